//! Per-generation session orchestration.
//!
//! Once a generation is synced, three concurrent pieces run with strict
//! ordering between them: the cooperative pre-revoke of lost partitions, the
//! user's assigned callback (after pre-revoke), and the offset fetch for
//! added partitions (also after pre-revoke). Heartbeating starts immediately
//! and outlives them all; the session does not return until the assigned
//! callback and the fetch are complete, which guarantees a later `on_lost`
//! can never run concurrently with `on_assigned`.

use crate::balance::AssignmentMap;
use crate::error::{GroupError, Result};
use crate::group::ledger::EpochOffset;
use crate::group::ledger::UncommittedLedger;
use crate::group::{GroupInner, Latch};
use crate::transport::{AssignMode, StartOffset, StartOffsets};
use kafka_protocol::messages::offset_fetch_request::OffsetFetchRequestTopic;
use kafka_protocol::messages::{GroupId, OffsetFetchRequest, TopicName};
use kafka_protocol::protocol::StrBytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RevokeStage {
    /// Cooperative pre-revoke of partitions lost against the last session.
    LastSession,
    /// End-of-session revoke.
    ThisSession,
}

/// Sequences prerevoke -> assign -> revoke for one session.
#[derive(Clone, Default)]
pub(crate) struct AssignRevokeSession {
    prerevoke_done: Latch,
    pub(crate) assign_done: Latch,
    revoke_done: Latch,
}

impl AssignRevokeSession {
    /// Cooperative members first revoke whatever the new assignment took away.
    fn prerevoke(&self, inner: &Arc<GroupInner>, lost: AssignmentMap) {
        let done = self.prerevoke_done.clone();
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            if inner.cooperative && !lost.is_empty() {
                inner.revoke(RevokeStage::LastSession, Some(lost), false).await;
            }
            done.complete();
        });
    }

    fn assign(&self, inner: &Arc<GroupInner>, added: AssignmentMap) {
        let sess = self.clone();
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            sess.prerevoke_done.wait().await;
            // Always invoked, even with nothing newly assigned, so users
            // know the assignment settled and setup logic can run.
            inner.invoke_on_assigned(added).await;
            sess.assign_done.complete();
        });
    }

    /// End-of-session revoke, ordered after the assigned callback. Returns
    /// the latch the heartbeat loop waits on.
    pub(crate) fn revoke(&self, inner: &Arc<GroupInner>, leaving: bool) -> Latch {
        let sess = self.clone();
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            sess.assign_done.wait().await;
            inner.revoke(RevokeStage::ThisSession, None, leaving).await;
            sess.revoke_done.complete();
        });
        self.revoke_done.clone()
    }
}

impl GroupInner {
    /// Run one generation: pre-revoke, assigned callback, offset fetch, and
    /// the heartbeat loop. Returns the error that ended the session.
    pub(crate) async fn setup_assigned_and_heartbeat(self: &Arc<Self>) -> GroupError {
        let (added, lost) = {
            let st = self.mu.lock().await;
            let now = st.now_assigned.clone().unwrap_or_default();
            GroupInner::diff_assigned(st.last_assigned.as_ref(), &now)
        };
        info!(
            group = %self.cfg.group,
            added = ?added,
            lost = ?lost,
            "new group session begun"
        );

        let sess = AssignRevokeSession::default();
        sess.prerevoke(self, lost);

        let session_token = self.token.child_token();
        let (fetch_err_tx, fetch_err_rx) = oneshot::channel::<Result<()>>();
        let fetch_done = Latch::new();
        {
            let inner = Arc::clone(self);
            let sess = sess.clone();
            let token = session_token.clone();
            let done = fetch_done.clone();
            let added = added.clone();
            tokio::spawn(async move {
                // Fetching waits for the pre-revoke: a commit issued inside
                // the revoke callback must settle before we read back
                // committed offsets.
                sess.prerevoke_done.wait().await;
                let res = if added.is_empty() {
                    Ok(())
                } else {
                    info!(
                        group = %inner.cfg.group,
                        added = ?added,
                        "fetching offsets for added partitions"
                    );
                    inner.fetch_offsets(&token, &added).await
                };
                let _ = fetch_err_tx.send(res);
                done.complete();
            });
        }

        sess.assign(self, added);

        info!(group = %self.cfg.group, "beginning heartbeat loop");
        let err = self.heartbeat(sess.clone(), fetch_err_rx).await;

        // Kill a fetch still in flight, then wait for both the fetch and the
        // assigned callback before handing control back to the manager.
        session_token.cancel();
        fetch_done.wait().await;
        sess.assign_done.wait().await;
        err
    }

    /// Ask the coordinator for prior commits on newly assigned partitions,
    /// seed the ledger with them, and start the partitions in the pipeline.
    async fn fetch_offsets(
        self: &Arc<Self>,
        token: &CancellationToken,
        added: &AssignmentMap,
    ) -> Result<()> {
        loop {
            let req = OffsetFetchRequest::default()
                .with_group_id(GroupId::from(StrBytes::from_string(self.cfg.group.clone())))
                .with_require_stable(self.cfg.require_stable)
                .with_topics(Some(
                    added
                        .iter()
                        .map(|(topic, partitions)| {
                            OffsetFetchRequestTopic::default()
                                .with_name(TopicName::from(StrBytes::from_string(topic.clone())))
                                .with_partition_indexes(partitions.clone())
                        })
                        .collect(),
                ));

            let resp = tokio::select! {
                res = self.transport.offset_fetch(token, req) => res.map_err(|err| {
                    error!(group = %self.cfg.group, %err, "fetch offsets failed with non-retriable error");
                    err
                })?,
                _ = token.cancelled() => {
                    error!(group = %self.cfg.group, "fetch offsets failed due to cancellation");
                    return Err(GroupError::Canceled);
                }
            };
            if let Some(err) = GroupError::for_code(resp.error_code) {
                return Err(err);
            }

            let mut retry = false;
            let mut offsets = StartOffsets::new();
            let mut seeds: Vec<(String, i32, EpochOffset)> = Vec::new();
            'topics: for topic in &resp.topics {
                for partition in &topic.partitions {
                    if let Some(err) = GroupError::for_code(partition.error_code) {
                        // KIP-447: a transaction is about to finish
                        // committing; wait and refetch.
                        if err.is_unstable_offset_commit() {
                            info!(
                                group = %self.cfg.group,
                                topic = %topic.name.as_str(),
                                partition = partition.partition_index,
                                "fetch offsets failed with UnstableOffsetCommit, waiting 1s and retrying"
                            );
                            tokio::select! {
                                _ = token.cancelled() => return Err(GroupError::Canceled),
                                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                                    retry = true;
                                    break 'topics;
                                }
                            }
                        }
                        return Err(err);
                    }

                    let fetched = EpochOffset {
                        epoch: partition.committed_leader_epoch,
                        offset: partition.committed_offset,
                    };
                    let start = if fetched.offset == -1 {
                        self.cfg.reset_offset
                    } else {
                        StartOffset::at(fetched.offset, fetched.epoch)
                    };
                    offsets
                        .entry(topic.name.as_str().to_string())
                        .or_default()
                        .insert(partition.partition_index, start);
                    if fetched.offset >= 0 {
                        seeds.push((
                            topic.name.as_str().to_string(),
                            partition.partition_index,
                            fetched,
                        ));
                    }
                }
            }
            if retry {
                continue;
            }

            let topics_view = {
                let mut st = self.mu.lock().await;
                let unasked: Vec<String> = offsets
                    .keys()
                    .filter(|t| !st.using.contains_key(*t))
                    .cloned()
                    .collect();
                for topic in &unasked {
                    warn!(
                        group = %self.cfg.group,
                        topic = %topic,
                        "assigned a topic we never subscribed to, skipping it"
                    );
                    offsets.remove(topic);
                }

                // Seed committed = head = fetched so a stray SetOffsets
                // cannot rewind behind what the coordinator just told us.
                let ledger = st.uncommitted.get_or_insert_with(UncommittedLedger::default);
                for (topic, partition, fetched) in seeds {
                    if offsets.contains_key(&topic) {
                        ledger.seed(&topic, partition, fetched);
                    }
                }
                GroupInner::using_topics(&st)
            };

            // Eager members invalidated everything at the last revoke;
            // cooperative members keep consuming what they already had.
            self.pipeline.assign_partitions(
                Some(&offsets),
                AssignMode::WithoutInvalidating,
                &topics_view,
            );
            info!(group = %self.cfg.group, "fetched committed offsets");
            return Ok(());
        }
    }

    /// Revoke partitions and update the ledger.
    ///
    /// Eager members (and anyone leaving) revoke everything they own and drop
    /// the whole ledger. Cooperative members revoke only `lost`, and at the
    /// end of a session are still notified with an empty set so callers can
    /// tell the session is ending.
    pub(crate) async fn revoke(
        self: &Arc<Self>,
        stage: RevokeStage,
        lost: Option<AssignmentMap>,
        leaving: bool,
    ) {
        if !self.cooperative || leaving {
            // Stop fetching everything before the callback so a revoke-time
            // commit covers exactly what was polled.
            self.pipeline
                .assign_partitions(None, AssignMode::InvalidateAll, &[]);

            let now = {
                self.mu.lock().await.now_assigned.take().unwrap_or_default()
            };
            if self.cooperative {
                info!(
                    group = %self.cfg.group,
                    revoking = ?now,
                    "cooperative consumer revoking prior assigned partitions because leaving group"
                );
            } else {
                info!(
                    group = %self.cfg.group,
                    revoking = ?now,
                    "eager consumer revoking prior assigned partitions"
                );
            }
            self.invoke_on_revoked(now).await;

            // Nothing may recreate the ledger until an offset fetch after
            // the group is rejoined.
            self.mu.lock().await.uncommitted = None;
            return;
        }

        let lost = lost.unwrap_or_default();
        if !lost.is_empty() {
            // Invalidate buffered fetches for the lost partitions before the
            // callback: a poll racing the revoke must not surface records
            // for partitions we are giving away.
            let mut lost_offsets = StartOffsets::new();
            for (topic, partitions) in &lost {
                let slots = lost_offsets.entry(topic.clone()).or_default();
                for &partition in partitions {
                    slots.insert(partition, StartOffset::earliest());
                }
            }
            let topics_view = GroupInner::using_topics(&*self.mu.lock().await);
            self.pipeline.assign_partitions(
                Some(&lost_offsets),
                AssignMode::InvalidateMatching,
                &topics_view,
            );
        }

        if !lost.is_empty() || stage == RevokeStage::ThisSession {
            if lost.is_empty() {
                info!(
                    group = %self.cfg.group,
                    "cooperative consumer calling on_revoked at the end of a session even though no partitions were lost"
                );
            } else {
                info!(
                    group = %self.cfg.group,
                    lost = ?lost,
                    stage = ?stage,
                    "cooperative consumer calling on_revoked"
                );
            }
            self.invoke_on_revoked(lost.clone()).await;
        }

        if lost.is_empty() {
            return;
        }

        // Commits should be complete by now: the default revoke commits
        // synchronously. Drop what was lost so no later commit covers it.
        {
            let mut st = self.mu.lock().await;
            if let Some(ledger) = st.uncommitted.as_mut() {
                if ledger.drop_partitions(&lost) {
                    st.uncommitted = None;
                }
            }
        }

        // A cooperative member rejoins after revoking what it lost.
        self.rejoin.raise();
    }
}
