//! Group consumer configuration.
//!
//! Built through [`GroupConfigBuilder`], which mirrors the Kafka client
//! defaults: 45s session timeout, 60s rebalance timeout, 3s heartbeats, 5s
//! autocommit. Lifecycle callbacks are optional; when `on_revoked` is left
//! unset and autocommit is enabled, the group falls back to a synchronous
//! commit of everything consumed before partitions are lost.

use crate::balance::{AssignmentMap, GroupBalancer, RangeBalancer};
use crate::error::{GroupError, Result};
use crate::transport::StartOffset;
use kafka_protocol::messages::{OffsetCommitRequest, OffsetCommitResponse};
use rand::Rng;
use regex::Regex;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Future returned by a rebalance callback.
pub type RebalanceFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Callback invoked with the partitions being assigned, revoked, or lost.
///
/// The token is the group token; it is already canceled when the callback
/// runs because the group is shutting down.
pub type RebalanceCallback =
    Arc<dyn Fn(CancellationToken, AssignmentMap) -> RebalanceFuture + Send + Sync>;

/// Callback observing every commit result: the request that was sent, the
/// response if one was received, and the error otherwise.
pub type CommitCallback = Arc<
    dyn Fn(&OffsetCommitRequest, Option<&OffsetCommitResponse>, Option<&GroupError>) + Send + Sync,
>;

/// What the member subscribes to.
#[derive(Debug, Clone)]
pub(crate) enum Subscription {
    /// An explicit topic set.
    Topics(BTreeSet<String>),
    /// Topics matching any of these expressions, evaluated against metadata.
    Regex(Vec<Regex>),
}

/// Configuration for a [`GroupConsumer`](crate::GroupConsumer).
#[derive(Clone)]
pub struct GroupConfig {
    pub(crate) group: String,
    pub(crate) subscription: Subscription,
    pub(crate) instance_id: Option<String>,
    pub(crate) protocol_type: String,
    pub(crate) balancers: Vec<Arc<dyn GroupBalancer>>,
    pub(crate) session_timeout: Duration,
    pub(crate) rebalance_timeout: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) autocommit_interval: Duration,
    pub(crate) autocommit_disable: bool,
    pub(crate) transactional: bool,
    pub(crate) require_stable: bool,
    pub(crate) reset_offset: StartOffset,
    pub(crate) retry_backoff_base: Duration,
    pub(crate) retry_backoff_max: Duration,
    pub(crate) on_assigned: Option<RebalanceCallback>,
    pub(crate) on_revoked: Option<RebalanceCallback>,
    pub(crate) on_lost: Option<RebalanceCallback>,
    pub(crate) commit_callback: Option<CommitCallback>,
}

impl GroupConfig {
    /// Create a builder for the given group, subscribing to explicit topics.
    pub fn builder(group: impl Into<String>) -> GroupConfigBuilder {
        GroupConfigBuilder::new(group)
    }

    /// True when every configured balancer follows the cooperative protocol.
    pub(crate) fn cooperative(&self) -> bool {
        self.balancers.iter().all(|b| b.is_cooperative())
    }

    pub(crate) fn autocommit_enabled(&self) -> bool {
        !self.autocommit_disable && !self.autocommit_interval.is_zero()
    }

    /// Exponential backoff with jitter for the manage loop, doubling from the
    /// base up to the cap.
    pub(crate) fn retry_backoff(&self, consecutive_errors: u32) -> Duration {
        let base = self.retry_backoff_base.as_millis() as u64;
        let max = self.retry_backoff_max.as_millis() as u64;
        let backoff = base
            .saturating_mul(1u64 << consecutive_errors.saturating_sub(1).min(16))
            .min(max);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_millis((backoff as f64 * jitter) as u64)
    }
}

/// Builder for [`GroupConfig`].
pub struct GroupConfigBuilder {
    group: String,
    topics: BTreeSet<String>,
    regex_patterns: Vec<String>,
    instance_id: Option<String>,
    balancers: Vec<Arc<dyn GroupBalancer>>,
    session_timeout: Duration,
    rebalance_timeout: Duration,
    heartbeat_interval: Duration,
    autocommit_interval: Duration,
    autocommit_disable: bool,
    transactional: bool,
    require_stable: bool,
    reset_offset: StartOffset,
    retry_backoff_base: Duration,
    retry_backoff_max: Duration,
    on_assigned: Option<RebalanceCallback>,
    on_revoked: Option<RebalanceCallback>,
    on_lost: Option<RebalanceCallback>,
    commit_callback: Option<CommitCallback>,
}

impl GroupConfigBuilder {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            topics: BTreeSet::new(),
            regex_patterns: Vec::new(),
            instance_id: None,
            balancers: Vec::new(),
            session_timeout: Duration::from_secs(45),
            rebalance_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(3),
            autocommit_interval: Duration::from_secs(5),
            autocommit_disable: false,
            transactional: false,
            require_stable: false,
            reset_offset: StartOffset::earliest(),
            retry_backoff_base: Duration::from_millis(250),
            retry_backoff_max: Duration::from_millis(2500),
            on_assigned: None,
            on_revoked: None,
            on_lost: None,
            commit_callback: None,
        }
    }

    /// Subscribe to an explicit topic.
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.insert(topic.into());
        self
    }

    /// Subscribe to explicit topics.
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics.extend(topics.into_iter().map(Into::into));
        self
    }

    /// Subscribe to topics matching a regular expression instead of an
    /// explicit set. May be called multiple times; a topic matching any
    /// pattern is consumed. Mutually exclusive with [`topic`](Self::topic).
    pub fn topic_regex(mut self, pattern: impl Into<String>) -> Self {
        self.regex_patterns.push(pattern.into());
        self
    }

    /// Set a static membership instance id (KIP-345). A member with an
    /// instance id does not send LeaveGroup on shutdown; it is expected to
    /// restart and rejoin under the same identity without a rebalance.
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Add a balancer to offer in JoinGroup, in preference order.
    /// Defaults to [`RangeBalancer`] when none are added.
    pub fn balancer(mut self, balancer: Arc<dyn GroupBalancer>) -> Self {
        self.balancers.push(balancer);
        self
    }

    /// Session timeout: how long the coordinator waits between heartbeats
    /// before evicting this member (default 45s).
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Rebalance timeout: how long the coordinator waits for all members to
    /// rejoin once a rebalance begins (default 60s).
    pub fn rebalance_timeout(mut self, timeout: Duration) -> Self {
        self.rebalance_timeout = timeout;
        self
    }

    /// Heartbeat interval (default 3s).
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Autocommit interval (default 5s).
    pub fn autocommit_interval(mut self, interval: Duration) -> Self {
        self.autocommit_interval = interval;
        self
    }

    /// Disable the autocommit ticker entirely.
    pub fn disable_autocommit(mut self) -> Self {
        self.autocommit_disable = true;
        self
    }

    /// Mark this member as part of a transactional producer pair. Disables
    /// autocommit; commits are expected to flow through the transactional
    /// path, preceded by
    /// [`heartbeat_before_commit`](crate::GroupConsumer::heartbeat_before_commit).
    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    /// Require stable offsets when fetching committed offsets (KIP-447),
    /// refusing offsets that an open transaction may yet rewrite.
    pub fn require_stable_fetch_offsets(mut self) -> Self {
        self.require_stable = true;
        self
    }

    /// Where to start partitions with no committed offset (default earliest).
    pub fn reset_offset(mut self, offset: StartOffset) -> Self {
        self.reset_offset = offset;
        self
    }

    /// Bounds for the manage loop's exponential retry backoff
    /// (defaults 250ms to 2.5s).
    pub fn retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff_base = base;
        self.retry_backoff_max = max;
        self
    }

    /// Called after each generation's assignment is known, with the
    /// partitions newly added to this member. Always called once per
    /// generation, even when nothing new was assigned.
    pub fn on_assigned(mut self, cb: RebalanceCallback) -> Self {
        self.on_assigned = Some(cb);
        self
    }

    /// Called when partitions are being revoked cleanly, before they are
    /// fenced off. Commits issued inside the callback still count.
    pub fn on_revoked(mut self, cb: RebalanceCallback) -> Self {
        self.on_revoked = Some(cb);
        self
    }

    /// Called when partitions were lost to a fatal error (fenced, unknown
    /// member). Unlike revoke, it is too late to commit for them.
    pub fn on_lost(mut self, cb: RebalanceCallback) -> Self {
        self.on_lost = Some(cb);
        self
    }

    /// Observer for every commit issued on this group's behalf, including
    /// autocommits and the default revoke commit.
    pub fn commit_callback(mut self, cb: CommitCallback) -> Self {
        self.commit_callback = Some(cb);
        self
    }

    pub fn build(self) -> Result<GroupConfig> {
        if self.group.is_empty() {
            return Err(GroupError::Config("group id must not be empty".into()));
        }
        if !self.topics.is_empty() && !self.regex_patterns.is_empty() {
            return Err(GroupError::Config(
                "explicit topics and regex subscriptions are mutually exclusive".into(),
            ));
        }
        let subscription = if self.regex_patterns.is_empty() {
            Subscription::Topics(self.topics)
        } else {
            let mut compiled = Vec::with_capacity(self.regex_patterns.len());
            for pattern in &self.regex_patterns {
                compiled.push(Regex::new(pattern).map_err(|e| {
                    GroupError::Config(format!("invalid topic regex {pattern:?}: {e}"))
                })?);
            }
            Subscription::Regex(compiled)
        };
        let mut balancers = self.balancers;
        if balancers.is_empty() {
            balancers.push(Arc::new(RangeBalancer));
        }
        // Non-transactional groups get an explicit no-op on_lost rather than
        // falling back to on_revoked: revoke paths commit, and committing for
        // partitions already lost to a fatal error is wrong. Transactional
        // groups keep the fallback; their commits flow through the
        // transaction and never through a revoke-time commit.
        let mut on_lost = self.on_lost;
        if !self.transactional && on_lost.is_none() {
            let noop: RebalanceCallback = Arc::new(|_token, _lost| Box::pin(async {}));
            on_lost = Some(noop);
        }
        Ok(GroupConfig {
            group: self.group,
            subscription,
            instance_id: self.instance_id,
            protocol_type: "consumer".to_string(),
            balancers,
            session_timeout: self.session_timeout,
            rebalance_timeout: self.rebalance_timeout,
            heartbeat_interval: self.heartbeat_interval,
            autocommit_interval: self.autocommit_interval,
            autocommit_disable: self.autocommit_disable || self.transactional,
            transactional: self.transactional,
            require_stable: self.require_stable,
            reset_offset: self.reset_offset,
            retry_backoff_base: self.retry_backoff_base,
            retry_backoff_max: self.retry_backoff_max,
            on_assigned: self.on_assigned,
            on_revoked: self.on_revoked,
            on_lost,
            commit_callback: self.commit_callback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = GroupConfig::builder("g").topic("t").build().unwrap();
        assert_eq!(cfg.session_timeout, Duration::from_secs(45));
        assert_eq!(cfg.balancers.len(), 1);
        assert!(!cfg.cooperative());
        assert!(cfg.autocommit_enabled());
    }

    #[test]
    fn test_non_transactional_gets_noop_on_lost() {
        let cfg = GroupConfig::builder("g").topic("t").build().unwrap();
        assert!(cfg.on_lost.is_some());

        let cfg = GroupConfig::builder("g")
            .topic("t")
            .transactional()
            .build()
            .unwrap();
        assert!(cfg.on_lost.is_none());
    }

    #[test]
    fn test_transactional_disables_autocommit() {
        let cfg = GroupConfig::builder("g")
            .topic("t")
            .transactional()
            .build()
            .unwrap();
        assert!(!cfg.autocommit_enabled());
    }

    #[test]
    fn test_empty_group_rejected() {
        assert!(GroupConfig::builder("").topic("t").build().is_err());
    }

    #[test]
    fn test_bad_regex_rejected() {
        assert!(GroupConfig::builder("g").topic_regex("(").build().is_err());
    }

    #[test]
    fn test_mixed_subscription_rejected() {
        assert!(GroupConfig::builder("g")
            .topic("t")
            .topic_regex("t.*")
            .build()
            .is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let cfg = GroupConfig::builder("g").topic("t").build().unwrap();
        let first = cfg.retry_backoff(1);
        let fifth = cfg.retry_backoff(5);
        let huge = cfg.retry_backoff(40);
        assert!(first < fifth);
        assert!(huge <= Duration::from_millis(3000));
    }
}
