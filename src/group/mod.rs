//! Group membership runtime.
//!
//! [`GroupConsumer`] keeps one member inside a coordinator-managed consumer
//! group: it joins and syncs, heartbeats for the life of each generation,
//! fetches committed offsets for newly assigned partitions, tracks consumed
//! progress, and commits it back, speaking either the eager or the
//! cooperative rebalance protocol depending on the configured balancers.
//!
//! # Lifecycle
//!
//! ```text
//! 1. find_new_assignments  <- metadata refresh reports subscribable topics
//! 2. join + sync           -> coordinator elects a leader, assigns partitions
//! 3. offset fetch          -> resume points for what we were assigned
//! 4. heartbeat             -> stay in the group, detect rebalances
//! 5. commit                -> autocommit, user commits, revoke-time commit
//! 6. revoke / rejoin       -> on rebalance, repeat from 2
//! ```
//!
//! The consumer owns the group; the group holds non-owning handles to the
//! fetch pipeline and transport. User lifecycle callbacks always run with no
//! internal lock held, so they may call back into this API.

mod commit;
mod heartbeat;
mod join;
mod ledger;
mod manager;
mod session;

pub use commit::CommitCompletion;
pub use ledger::{EpochOffset, OffsetMap, PolledBatch, Record};

use crate::balance::AssignmentMap;
use crate::config::{CommitCallback, GroupConfig};
use crate::error::Result;
use crate::transport::{
    AssignMode, FetchPipeline, GroupHook, GroupTransport, MetadataWaiter, StartOffset,
    StartOffsets, TopicMeta,
};
use kafka_protocol::messages::leave_group_request::MemberIdentity;
use kafka_protocol::messages::{GroupId, LeaveGroupRequest};
use kafka_protocol::protocol::StrBytes;
use ledger::UncommittedLedger;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A completion latch: many waiters, completed once.
#[derive(Clone, Debug, Default)]
pub(crate) struct Latch {
    token: CancellationToken,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn complete(&self) {
        self.token.cancel();
    }

    pub(crate) async fn wait(&self) {
        self.token.cancelled().await;
    }
}

/// Coalescing single-slot rejoin signal: any number of raises between two
/// observations collapse into one.
#[derive(Default)]
pub(crate) struct RejoinSignal {
    raised: AtomicBool,
    notify: Notify,
}

impl RejoinSignal {
    pub(crate) fn raise(&self) {
        if !self.raised.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }

    pub(crate) fn drain(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }

    pub(crate) async fn raised(&self) {
        loop {
            if self.raised.swap(false, Ordering::SeqCst) {
                return;
            }
            self.notify.notified().await;
        }
    }
}

/// Forced heartbeat request: the sender gets the heartbeat's outcome.
pub(crate) type ForcedHeartbeat = oneshot::Sender<Result<()>>;

/// State guarded by the group lock.
pub(crate) struct GroupState {
    /// Topics we are consuming -> number of partitions known in each.
    pub(crate) using: BTreeMap<String, i32>,
    /// Topics already evaluated against the regex subscription.
    pub(crate) re_seen: HashMap<String, bool>,
    pub(crate) uncommitted: Option<UncommittedLedger>,
    pub(crate) member_id: String,
    pub(crate) generation: i32,
    /// Assignment of the previous generation; kept only in cooperative mode.
    pub(crate) last_assigned: Option<AssignmentMap>,
    pub(crate) now_assigned: Option<AssignmentMap>,
    /// Cancels the in-flight commit, if any.
    pub(crate) commit_cancel: Option<CancellationToken>,
    /// Observed by the next commit to wait out the in-flight one.
    pub(crate) commit_done: Option<oneshot::Receiver<()>>,
    /// Suppresses autocommit ticks while a user commit is outstanding.
    pub(crate) block_auto: bool,
    pub(crate) dying: bool,
}

pub(crate) struct GroupInner {
    pub(crate) cfg: GroupConfig,
    pub(crate) commit_callback: CommitCallback,
    pub(crate) transport: Arc<dyn GroupTransport>,
    pub(crate) pipeline: Arc<dyn FetchPipeline>,
    pub(crate) metadata: Arc<dyn MetadataWaiter>,
    pub(crate) hooks: Vec<Arc<dyn GroupHook>>,
    /// The client's token; outlives the group token so that the final revoke
    /// commit can still complete after the group is canceled.
    pub(crate) client_token: CancellationToken,
    /// The group token, child of the client token.
    pub(crate) token: CancellationToken,
    pub(crate) cooperative: bool,
    /// Whether this member led the current generation's assignment.
    pub(crate) leader: AtomicBool,
    /// Writers are sync commits, readers are async commits: a sync commit
    /// excludes every other commit for its whole duration.
    pub(crate) sync_commit: Arc<RwLock<()>>,
    pub(crate) rejoin: RejoinSignal,
    pub(crate) force_heartbeat_tx: mpsc::Sender<ForcedHeartbeat>,
    pub(crate) force_heartbeat_rx: Mutex<mpsc::Receiver<ForcedHeartbeat>>,
    /// Completed when the manage task exits.
    pub(crate) manage_done: Latch,
    pub(crate) mu: Mutex<GroupState>,
}

impl GroupInner {
    /// Compute `(added, lost)` between the previous and current assignment.
    /// The first generation has no previous assignment: everything is added.
    pub(crate) fn diff_assigned(
        last: Option<&AssignmentMap>,
        now: &AssignmentMap,
    ) -> (AssignmentMap, AssignmentMap) {
        let Some(last) = last else {
            return (now.clone(), AssignmentMap::new());
        };

        let mut added = AssignmentMap::new();
        let mut lost = AssignmentMap::new();

        for (topic, last_partitions) in last {
            match now.get(topic) {
                None => {
                    lost.insert(topic.clone(), last_partitions.clone());
                }
                Some(now_partitions) => {
                    let gone: Vec<i32> = last_partitions
                        .iter()
                        .filter(|p| !now_partitions.contains(p))
                        .copied()
                        .collect();
                    if !gone.is_empty() {
                        lost.insert(topic.clone(), gone);
                    }
                    let new: Vec<i32> = now_partitions
                        .iter()
                        .filter(|p| !last_partitions.contains(p))
                        .copied()
                        .collect();
                    if !new.is_empty() {
                        added.insert(topic.clone(), new);
                    }
                }
            }
        }
        for (topic, now_partitions) in now {
            if !last.contains_key(topic) {
                added.insert(topic.clone(), now_partitions.clone());
            }
        }

        (added, lost)
    }

    pub(crate) fn using_topics(st: &GroupState) -> Vec<String> {
        st.using.keys().cloned().collect()
    }

    pub(crate) async fn invoke_on_assigned(&self, added: AssignmentMap) {
        if let Some(cb) = &self.cfg.on_assigned {
            cb(self.token.clone(), added).await;
        }
    }

    /// Run the revoke callback, or the default revoke when none is set: a
    /// synchronous commit of everything consumed, under the client token so
    /// it survives group shutdown.
    pub(crate) async fn invoke_on_revoked(self: &Arc<Self>, revoked: AssignmentMap) {
        if let Some(cb) = &self.cfg.on_revoked {
            cb(self.token.clone(), revoked).await;
        } else if self.cfg.autocommit_enabled() {
            let heads = self
                .mu
                .lock()
                .await
                .uncommitted
                .as_ref()
                .and_then(|l| l.snapshot(true));
            let on_done = self.commit_callback_completion();
            self.commit_offsets_sync_inner(
                self.client_token.clone(),
                heads.unwrap_or_default(),
                Some(on_done),
            )
            .await;
        }
    }

    /// Fatal-error callback. Non-transactional configs always carry an
    /// on_lost (a no-op is installed at build when the user set none), so the
    /// on_revoked fallback below is reachable only for transactional groups,
    /// whose revoke paths never commit. It is too late to commit for
    /// partitions that are already lost.
    pub(crate) async fn invoke_on_lost(&self, lost: AssignmentMap) {
        if let Some(cb) = &self.cfg.on_lost {
            cb(self.token.clone(), lost).await;
        } else if let Some(cb) = &self.cfg.on_revoked {
            cb(self.token.clone(), lost).await;
        }
    }
}

/// A consumer-group member.
///
/// Construct with [`GroupConsumer::new`], feed it topic metadata through
/// [`find_new_assignments`](Self::find_new_assignments) (which starts group
/// management once there is something to consume), report consumed records
/// through [`update_uncommitted`](Self::update_uncommitted), and commit
/// through the `commit_*` methods.
pub struct GroupConsumer {
    inner: Arc<GroupInner>,
}

impl GroupConsumer {
    pub fn new(
        cfg: GroupConfig,
        client_token: CancellationToken,
        transport: Arc<dyn GroupTransport>,
        pipeline: Arc<dyn FetchPipeline>,
        metadata: Arc<dyn MetadataWaiter>,
        hooks: Vec<Arc<dyn GroupHook>>,
    ) -> Self {
        let token = client_token.child_token();
        let cooperative = cfg.cooperative();
        let commit_callback = cfg
            .commit_callback
            .clone()
            .unwrap_or_else(|| default_commit_callback(cfg.group.clone()));
        let (force_heartbeat_tx, force_heartbeat_rx) = mpsc::channel(1);

        let inner = Arc::new(GroupInner {
            commit_callback,
            transport,
            pipeline,
            metadata,
            hooks,
            client_token,
            token,
            cooperative,
            leader: AtomicBool::new(false),
            sync_commit: Arc::new(RwLock::new(())),
            rejoin: RejoinSignal::default(),
            force_heartbeat_tx,
            force_heartbeat_rx: Mutex::new(force_heartbeat_rx),
            manage_done: Latch::new(),
            mu: Mutex::new(GroupState {
                using: BTreeMap::new(),
                re_seen: HashMap::new(),
                uncommitted: None,
                member_id: String::new(),
                generation: -1,
                last_assigned: None,
                now_assigned: None,
                commit_cancel: None,
                commit_done: None,
                block_auto: false,
                dying: false,
            }),
            cfg,
        });

        if inner.cfg.autocommit_enabled() {
            info!(group = %inner.cfg.group, "beginning autocommit loop");
            inner.spawn_autocommit();
        }

        Self { inner }
    }

    /// Digest a metadata refresh: track newly subscribable topics and
    /// partition-count growth, start group management on the first hit, and
    /// rejoin when the subscription changed (or when we are leader and can
    /// see partitions nobody is consuming yet).
    pub async fn find_new_assignments(&self, topics: &[TopicMeta]) {
        let inner = &self.inner;
        let mut st = inner.mu.lock().await;

        let mut num_new_topics = 0;
        let mut to_change: HashMap<String, i32> = HashMap::new();
        for topic in topics {
            if let Some(&used) = st.using.get(&topic.name) {
                let delta = topic.partitions - used;
                if delta > 0 {
                    to_change.insert(topic.name.clone(), delta);
                }
                continue;
            }

            let want = match &inner.cfg.subscription {
                crate::config::Subscription::Topics(set) => set.contains(&topic.name),
                crate::config::Subscription::Regex(patterns) => {
                    if topic.internal {
                        continue;
                    }
                    match st.re_seen.get(&topic.name) {
                        Some(&want) => want,
                        None => {
                            let want = patterns.iter().any(|re| re.is_match(&topic.name));
                            st.re_seen.insert(topic.name.clone(), want);
                            want
                        }
                    }
                }
            };

            // Only track topics that metadata actually knows partitions for.
            if want && topic.partitions > 0 {
                to_change.insert(topic.name.clone(), topic.partitions);
                num_new_topics += 1;
            }
        }

        if to_change.is_empty() || st.dying {
            return;
        }

        let was_managing = !st.using.is_empty();
        for (topic, delta) in &to_change {
            *st.using.entry(topic.clone()).or_insert(0) += delta;
        }
        drop(st);

        if !was_managing {
            inner.spawn_manage();
            return;
        }

        if num_new_topics > 0 || inner.leader.load(Ordering::SeqCst) {
            inner.rejoin.raise();
        }
    }

    /// Record the progress of records handed to the user, advancing each
    /// partition's head offset. The fetch pipeline calls this on every poll.
    pub async fn update_uncommitted(&self, polled: &[PolledBatch]) {
        if polled.is_empty() {
            return;
        }
        let mut st = self.inner.mu.lock().await;
        st.uncommitted
            .get_or_insert_with(UncommittedLedger::default)
            .advance(polled);
        debug!(group = %self.inner.cfg.group, batches = polled.len(), "updated uncommitted");
    }

    /// The latest consumed-but-uncommitted offsets, or `None` when everything
    /// consumed is already committed.
    pub async fn uncommitted_offsets(&self) -> Option<OffsetMap> {
        let st = self.inner.mu.lock().await;
        st.uncommitted.as_ref().and_then(|l| l.snapshot(true))
    }

    /// The latest committed offsets, from commits or from the offset fetch on
    /// joining.
    pub async fn committed_offsets(&self) -> Option<OffsetMap> {
        let st = self.inner.mu.lock().await;
        st.uncommitted.as_ref().and_then(|l| l.snapshot(false))
    }

    /// Directly set offsets, e.g. to rewind. Only topics the member is
    /// actively using can be set. Partitions whose head already sits at the
    /// requested offset only have their committed mark moved; everything else
    /// is repositioned in the fetch pipeline too.
    pub async fn set_offsets(&self, offsets: OffsetMap) {
        if offsets.is_empty() {
            return;
        }
        let inner = &self.inner;
        let mut st = inner.mu.lock().await;

        let using: std::collections::BTreeSet<String> = st.using.keys().cloned().collect();
        let mut assigns = StartOffsets::new();
        let ledger = st.uncommitted.get_or_insert_with(UncommittedLedger::default);
        for (topic, partitions) in &offsets {
            // Topics we are not using cannot be set.
            if !using.contains(topic) {
                continue;
            }
            for (&partition, at) in partitions {
                if ledger.set_offset(topic, partition, *at) {
                    assigns
                        .entry(topic.clone())
                        .or_default()
                        .insert(partition, StartOffset::at(at.offset, at.epoch));
                }
            }
        }

        if assigns.is_empty() {
            return;
        }
        let topics = GroupInner::using_topics(&st);
        drop(st);
        inner
            .pipeline
            .assign_partitions(Some(&assigns), AssignMode::SetMatching, &topics);
    }

    /// Quit the heartbeat loop so the member rejoins with a fresh JoinGroup.
    ///
    /// Useful when this member is the leader and external state consulted by
    /// a custom balancer changed (KIP-568). Otherwise the coordinator will
    /// simply hand back the current assignment.
    pub fn force_rebalance(&self) {
        self.inner.rejoin.raise();
    }

    /// Force a heartbeat and wait for its outcome.
    ///
    /// Used before a transactional commit: a successful in-session heartbeat
    /// proves the member still holds its generation, so a commit racing a
    /// rebalance is caught before it does damage.
    pub async fn heartbeat_before_commit(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        tokio::select! {
            res = self.inner.force_heartbeat_tx.send(tx) => {
                if res.is_err() {
                    return Err(crate::error::GroupError::Canceled);
                }
            }
            _ = self.inner.token.cancelled() => return Err(crate::error::GroupError::Canceled),
        }
        tokio::select! {
            res = rx => res.unwrap_or(Err(crate::error::GroupError::Canceled)),
            _ = self.inner.token.cancelled() => Err(crate::error::GroupError::Canceled),
        }
    }

    /// Leave the group and wait until fully left.
    ///
    /// The final revoke (and its commit) runs under the client token, which
    /// stays live, so the last commit can still succeed. Calling this twice
    /// waits for the first leave; only one LeaveGroup request is ever sent.
    /// With a static membership instance id, no LeaveGroup is sent at all:
    /// the member is expected to restart under the same identity.
    pub async fn leave_group(&self) {
        let inner = &self.inner;
        let (was_dead, was_managing) = {
            let mut st = inner.mu.lock().await;
            let was_dead = st.dying;
            st.dying = true;
            (was_dead, !st.using.is_empty())
        };

        inner.token.cancel();

        if was_managing {
            inner.manage_done.wait().await;
        }
        if was_dead {
            return;
        }

        if inner.cfg.instance_id.is_none() {
            let member_id = inner.mu.lock().await.member_id.clone();
            info!(group = %inner.cfg.group, member_id = %member_id, "leaving group");
            let req = LeaveGroupRequest::default()
                .with_group_id(GroupId::from(StrBytes::from_string(
                    inner.cfg.group.clone(),
                )))
                .with_member_id(StrBytes::from_string(member_id.clone()))
                .with_members(vec![
                    MemberIdentity::default().with_member_id(StrBytes::from_string(member_id))
                ]);
            // Best effort: if leaving errors there is nothing useful to do.
            if let Err(err) = inner
                .transport
                .leave_group(&inner.client_token, req)
                .await
            {
                error!(group = %inner.cfg.group, %err, "leave group request failed");
            }
        }
    }
}

fn default_commit_callback(group: String) -> CommitCallback {
    Arc::new(move |_req, resp, err| {
        if let Some(err) = err {
            if err.is_canceled() {
                debug!(group = %group, "default commit canceled");
            } else {
                error!(group = %group, %err, "default commit failed");
            }
            return;
        }
        if let Some(resp) = resp {
            for topic in &resp.topics {
                for partition in &topic.partitions {
                    if let Some(err) = crate::error::GroupError::for_code(partition.error_code) {
                        error!(
                            group = %group,
                            topic = %topic.name.as_str(),
                            partition = partition.partition_index,
                            %err,
                            "unable to commit offsets for topic partition"
                        );
                    }
                }
            }
        }
    })
}
