//! The group manage loop.
//!
//! Spawned the first time the subscription watcher finds something to
//! consume, and alive until the group token is canceled: join and sync, run
//! the session, classify how it ended, run the user's lost/revoked callback,
//! back off, repeat.

use crate::group::GroupInner;
use crate::transport::AssignMode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info};

impl GroupInner {
    pub(crate) fn spawn_manage(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.manage().await;
            inner.manage_done.complete();
        });
    }

    async fn manage(self: &Arc<Self>) {
        info!(group = %self.cfg.group, "beginning to manage the group lifecycle");
        let mut consecutive_errors: u32 = 0;

        loop {
            let mut err = self.join_and_sync().await.err();
            if err.is_none() {
                let session_err = self.setup_assigned_and_heartbeat().await;
                // A rebalance ends the session but is a clean restart.
                err = (!session_err.is_rebalance_in_progress()).then_some(session_err);
            }
            let Some(err) = err else {
                consecutive_errors = 0;
                continue;
            };

            let canceled = err.is_canceled();
            if canceled {
                // Shutting down. A session that got far enough revoked on
                // its way out and cleared the assignment; if it did not (we
                // were canceled mid-join, say), revoke here so the user gets
                // one last chance to commit.
                let now = {
                    self.mu.lock().await.now_assigned.take().unwrap_or_default()
                };
                if !now.is_empty() {
                    self.invoke_on_revoked(now).await;
                }
            } else {
                // Fatal: the partitions are gone whether we like it or not.
                let now = {
                    self.mu.lock().await.now_assigned.clone().unwrap_or_default()
                };
                self.invoke_on_lost(now).await;
                for hook in &self.hooks {
                    hook.on_group_manage_error(&err);
                }
            }

            // Everything from the dead session is invalid.
            self.pipeline
                .assign_partitions(None, AssignMode::InvalidateAll, &[]);
            {
                let mut st = self.mu.lock().await;
                st.uncommitted = None;
                st.now_assigned = None;
                st.last_assigned = None;
            }
            self.leader.store(false, Ordering::SeqCst);

            if canceled {
                return;
            }

            consecutive_errors += 1;
            let backoff = self.cfg.retry_backoff(consecutive_errors);
            error!(
                group = %self.cfg.group,
                err = %err,
                consecutive_errors,
                backoff = ?backoff,
                "join and sync loop errored"
            );
            // Waiting out the backoff is a good time to refresh metadata;
            // the error may stem from staleness.
            let deadline = tokio::time::Instant::now() + backoff;
            self.metadata.wait_meta(&self.token, backoff).await;
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}
