//! The commit engine.
//!
//! Commits are strictly serialized: issuing a new commit cancels the
//! in-flight one and waits for it to finish before sending, giving a total
//! order on commit requests. A synchronous commit additionally takes the
//! sync-commit latch exclusively, so no async commit or autocommit can
//! interleave with it from the moment it starts to the moment its completion
//! callback returns.

use crate::error::{GroupError, Result};
use crate::group::ledger::{EpochOffset, OffsetMap, Record};
use crate::group::{GroupConsumer, GroupInner, GroupState};
use kafka_protocol::messages::offset_commit_request::{
    OffsetCommitRequestPartition, OffsetCommitRequestTopic,
};
use kafka_protocol::messages::{GroupId, OffsetCommitRequest, OffsetCommitResponse, TopicName};
use kafka_protocol::protocol::StrBytes;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One-shot observer for a single commit's outcome: the request that was
/// sent, the response if one arrived, and the error otherwise. Called exactly
/// once per commit, including canceled ones.
pub type CommitCompletion = Box<
    dyn FnOnce(&OffsetCommitRequest, Option<&OffsetCommitResponse>, Option<&GroupError>) + Send,
>;

impl GroupConsumer {
    /// Commit the given offsets asynchronously.
    ///
    /// Ordering is absolute: this cancels any commit already in flight and
    /// waits for it to finish before sending its own request, so a caller may
    /// commit async periodically and finish with one sync commit. Autocommit
    /// is blocked until `on_done` has returned.
    ///
    /// Do not use this from a revoke callback; a rebalance will not wait for
    /// an async commit, and the commit may land on partitions that already
    /// moved. Use [`commit_offsets_sync`](Self::commit_offsets_sync) there.
    pub fn commit_offsets(
        &self,
        token: CancellationToken,
        uncommitted: OffsetMap,
        on_done: Option<CommitCompletion>,
    ) {
        debug!(group = %self.inner.cfg.group, topics = uncommitted.len(), "in commit_offsets");
        let on_done = on_done.unwrap_or_else(|| Box::new(|_, _, _| {}));
        if uncommitted.is_empty() {
            let req = OffsetCommitRequest::default();
            tokio::spawn(async move { on_done(&req, None, None) });
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            // Block sync commits, but let other async commits cancel us.
            let latch = Arc::clone(&inner.sync_commit).read_owned().await;
            let mut st = inner.mu.lock().await;
            st.block_auto = true;

            let unblock = Arc::clone(&inner);
            let wrapped: CommitCompletion = Box::new(move |req, resp, err| {
                on_done(req, resp, err);
                drop(latch);
                tokio::spawn(async move {
                    unblock.mu.lock().await.block_auto = false;
                });
            });
            inner.commit_locked(&mut st, token, uncommitted, wrapped);
        });
    }

    /// Commit the given offsets and wait for the commit (and its `on_done`)
    /// to complete.
    ///
    /// While this runs no other commit of any kind can start, which is what a
    /// revoke callback needs: the commit it issues cannot be canceled by an
    /// autocommit racing the rebalance.
    pub async fn commit_offsets_sync(
        &self,
        token: CancellationToken,
        uncommitted: OffsetMap,
        on_done: Option<CommitCompletion>,
    ) {
        self.inner
            .commit_offsets_sync_inner(token, uncommitted, on_done)
            .await;
    }

    /// Synchronously commit the offsets of the given records, favouring the
    /// later epoch/offset when records share a partition. Returns the first
    /// partition-level error, if any.
    pub async fn commit_records(&self, token: CancellationToken, records: &[Record]) -> Result<()> {
        let mut offsets = OffsetMap::new();
        for record in records {
            let slot = offsets
                .entry(record.topic.clone())
                .or_default()
                .entry(record.partition)
                .or_insert(EpochOffset {
                    epoch: record.leader_epoch,
                    offset: record.offset,
                });
            let candidate = EpochOffset {
                epoch: record.leader_epoch,
                offset: record.offset,
            };
            if candidate.later_than(slot) {
                *slot = candidate;
            }
        }
        self.commit_checked(token, offsets).await
    }

    /// Synchronously commit everything consumed so far that has not yet been
    /// committed. Returns the first partition-level error, if any.
    pub async fn commit_uncommitted_offsets(&self, token: CancellationToken) -> Result<()> {
        let uncommitted = self.uncommitted_offsets().await.unwrap_or_default();
        self.commit_checked(token, uncommitted).await
    }

    async fn commit_checked(&self, token: CancellationToken, offsets: OffsetMap) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let on_done: CommitCompletion = Box::new(move |_req, resp, err| {
            let result = match err {
                Some(err) => Err(err.clone()),
                None => first_partition_error(resp),
            };
            let _ = tx.send(result);
        });
        self.commit_offsets_sync(token, offsets, Some(on_done)).await;
        rx.await.unwrap_or(Err(GroupError::Canceled))
    }
}

fn first_partition_error(resp: Option<&OffsetCommitResponse>) -> Result<()> {
    if let Some(resp) = resp {
        for topic in &resp.topics {
            for partition in &topic.partitions {
                if let Some(err) = GroupError::for_code(partition.error_code) {
                    return Err(err);
                }
            }
        }
    }
    Ok(())
}

impl GroupInner {
    /// Adapt the configured commit callback into a one-shot completion.
    pub(crate) fn commit_callback_completion(&self) -> CommitCompletion {
        let cb = Arc::clone(&self.commit_callback);
        Box::new(move |req, resp, err| cb(req, resp, err))
    }

    pub(crate) async fn commit_offsets_sync_inner(
        self: &Arc<Self>,
        token: CancellationToken,
        uncommitted: OffsetMap,
        on_done: Option<CommitCompletion>,
    ) {
        debug!(group = %self.cfg.group, topics = uncommitted.len(), "in commit_offsets_sync");
        let on_done = on_done.unwrap_or_else(|| Box::new(|_, _, _| {}));

        // Exclusive: every other commit is locked out until our completion
        // callback has returned.
        let latch = Arc::clone(&self.sync_commit).write_owned().await;
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let mut st = self.mu.lock().await;
        st.block_auto = true;

        let unblock = Arc::clone(self);
        let wrapped: CommitCompletion = Box::new(move |req, resp, err| {
            on_done(req, resp, err);
            drop(latch);
            tokio::spawn(async move {
                unblock.mu.lock().await.block_auto = false;
            });
            let _ = done_tx.send(());
        });
        self.commit_locked(&mut st, token, uncommitted, wrapped);
        drop(st);

        let _ = done_rx.await;
        debug!(group = %self.cfg.group, "left commit_offsets_sync");
    }

    /// Core commit logic; the caller holds the group lock.
    ///
    /// Swaps itself in as the current commit, then on its own task cancels
    /// and waits out the prior commit before sending. The request is built
    /// with the generation captured under the lock, and the response is only
    /// applied to the ledger if the generation still matches when it arrives.
    pub(crate) fn commit_locked(
        self: &Arc<Self>,
        st: &mut GroupState,
        token: CancellationToken,
        uncommitted: OffsetMap,
        on_done: CommitCompletion,
    ) {
        if uncommitted.is_empty() {
            // Empty commits only arrive via autocommit or the default
            // revoke; completion still must fire, off this call stack.
            let req = OffsetCommitRequest::default();
            tokio::spawn(async move { on_done(&req, None, None) });
            return;
        }

        let prior_cancel = st.commit_cancel.take();
        let prior_done = st.commit_done.take();

        let commit_token = token.child_token();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        st.commit_cancel = Some(commit_token.clone());
        st.commit_done = Some(done_rx);

        let mut req = OffsetCommitRequest::default()
            .with_group_id(GroupId::from(StrBytes::from_string(self.cfg.group.clone())))
            .with_generation_id_or_member_epoch(st.generation)
            .with_member_id(StrBytes::from_string(st.member_id.clone()));
        if let Some(id) = &self.cfg.instance_id {
            req = req.with_group_instance_id(Some(StrBytes::from_string(id.clone())));
        }
        let member_id = st.member_id.clone();

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            // Dropping this hands the slot to whichever commit comes next.
            let _done_tx = done_tx;

            if let Some(mut prior_done) = prior_done {
                use tokio::sync::oneshot::error::TryRecvError;
                if matches!(prior_done.try_recv(), Err(TryRecvError::Empty)) {
                    debug!(group = %inner.cfg.group, "canceling prior commit to issue another");
                    if let Some(prior_cancel) = prior_cancel {
                        prior_cancel.cancel();
                    }
                    let _ = prior_done.await;
                }
            }

            debug!(group = %inner.cfg.group, "issuing commit");
            for (topic, partitions) in &uncommitted {
                req.topics.push(
                    OffsetCommitRequestTopic::default()
                        .with_name(TopicName::from(StrBytes::from_string(topic.clone())))
                        .with_partitions(
                            partitions
                                .iter()
                                .map(|(&partition, eo)| {
                                    OffsetCommitRequestPartition::default()
                                        .with_partition_index(partition)
                                        .with_committed_offset(eo.offset)
                                        .with_committed_leader_epoch(eo.epoch)
                                        .with_committed_metadata(Some(StrBytes::from_string(
                                            member_id.clone(),
                                        )))
                                })
                                .collect(),
                        ),
                );
            }

            let result = tokio::select! {
                res = inner.transport.offset_commit(&commit_token, req.clone()) => res,
                _ = commit_token.cancelled() => Err(GroupError::Canceled),
            };

            match result {
                Err(err) => on_done(&req, None, Some(&err)),
                Ok(mut resp) => {
                    {
                        let mut st = inner.mu.lock().await;
                        if st.generation == req.generation_id_or_member_epoch {
                            if let Some(ledger) = st.uncommitted.as_mut() {
                                ledger.apply_commit(&mut req, &mut resp);
                            }
                        }
                    }
                    on_done(&req, Some(&resp), None);
                }
            }
        });
    }

    /// Periodic autocommit of head offsets. Skips ticks while a user commit
    /// has autocommit blocked; exits with the group.
    pub(crate) fn spawn_autocommit(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let period = inner.cfg.autocommit_interval;
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = inner.token.cancelled() => return,
                }
                let mut st = inner.mu.lock().await;
                if st.block_auto {
                    continue;
                }
                let Some(heads) = st.uncommitted.as_ref().and_then(|l| l.snapshot(true)) else {
                    continue;
                };
                debug!(group = %inner.cfg.group, "autocommitting");
                let on_done = inner.commit_callback_completion();
                inner.commit_locked(&mut st, inner.token.clone(), heads, on_done);
            }
        });
    }
}
