//! The heartbeat loop.
//!
//! Runs for the life of one generation. Heartbeats fire on the configured
//! interval, on demand for transactional commits, and once quickly after a
//! cooperative revoke. The first error decides everything: a rebalance (or
//! our own shutdown) starts the end-of-session revoke plus a metadata
//! refresh and the loop keeps beating until both are done, while any other
//! error is fatal and returns immediately so the manager can treat the
//! partitions as lost.

use crate::error::{GroupError, Result};
use crate::group::session::AssignRevokeSession;
use crate::group::{ForcedHeartbeat, GroupInner, Latch};
use kafka_protocol::messages::{GroupId, HeartbeatRequest};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::ResponseError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

impl GroupInner {
    /// Heartbeat until the session ends. Returns the first error observed;
    /// when that error triggered a revoke, the return happens only after
    /// both the revoke and the metadata refresh have completed.
    pub(crate) async fn heartbeat(
        self: &Arc<Self>,
        sess: AssignRevokeSession,
        mut fetch_err_rx: oneshot::Receiver<Result<()>>,
    ) -> GroupError {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.cfg.heartbeat_interval,
            self.cfg.heartbeat_interval,
        );

        // A cooperative member that just revoked rejoins right away; check
        // in 500ms instead of waiting out a full heartbeat interval.
        let mut fast_check = self
            .cooperative
            .then(|| Box::pin(tokio::time::sleep(Duration::from_millis(500))));

        // Sessions are serial, so the force channel is ours for the
        // duration of the loop.
        let mut force_rx = self.force_heartbeat_rx.lock().await;

        let mut fetch_alive = true;
        let mut ctx_alive = true;
        let mut metadone: Option<Latch> = None;
        let mut revoked: Option<Latch> = None;
        let mut did_metadone = false;
        let mut did_revoke = false;
        let mut last_err: Option<GroupError> = None;

        loop {
            let mut err: Option<GroupError> = None;
            let mut force: Option<ForcedHeartbeat> = None;
            let mut beat = false;

            tokio::select! {
                _ = async { fast_check.as_mut().unwrap().await }, if fast_check.is_some() => {
                    fast_check = None;
                    beat = true;
                }
                _ = ticker.tick() => beat = true,
                forced = force_rx.recv() => {
                    force = forced;
                    beat = true;
                }
                _ = self.rejoin.raised() => {
                    // A changed subscription behaves like a rebalance.
                    err = Some(GroupError::Coordinator(ResponseError::RebalanceInProgress));
                }
                res = &mut fetch_err_rx, if fetch_alive => {
                    fetch_alive = false;
                    err = match res {
                        Ok(Err(fetch_err)) => Some(fetch_err),
                        Ok(Ok(())) | Err(_) => None,
                    };
                }
                _ = async { metadone.as_ref().unwrap().wait().await }, if metadone.is_some() => {
                    metadone = None;
                    did_metadone = true;
                }
                _ = async { revoked.as_ref().unwrap().wait().await }, if revoked.is_some() => {
                    revoked = None;
                    did_revoke = true;
                }
                _ = self.token.cancelled(), if ctx_alive => {
                    // Even though the group is going away, we keep looping
                    // until the revoke finishes so the manager never races
                    // it on the assignment state.
                    ctx_alive = false;
                    err = Some(GroupError::Canceled);
                }
            }

            if beat {
                debug!(group = %self.cfg.group, "heartbeating");
                let req = {
                    let st = self.mu.lock().await;
                    let mut req = HeartbeatRequest::default()
                        .with_group_id(GroupId::from(StrBytes::from_string(
                            self.cfg.group.clone(),
                        )))
                        .with_generation_id(st.generation)
                        .with_member_id(StrBytes::from_string(st.member_id.clone()));
                    if let Some(id) = &self.cfg.instance_id {
                        req = req.with_group_instance_id(Some(StrBytes::from_string(id.clone())));
                    }
                    req
                };
                let result = tokio::select! {
                    res = self.transport.heartbeat(&self.token, req) => res,
                    _ = self.token.cancelled() => Err(GroupError::Canceled),
                };
                err = match result {
                    Ok(resp) => GroupError::for_code(resp.error_code),
                    Err(transport_err) => Some(transport_err),
                };
                debug!(group = %self.cfg.group, err = ?err, "heartbeat complete");
                if let Some(force) = force {
                    let _ = force.send(match &err {
                        Some(err) => Err(err.clone()),
                        None => Ok(()),
                    });
                }
            }

            // Once the revoke we triggered and the metadata refresh are both
            // done, the session is fully unwound.
            if did_metadone && did_revoke {
                info!(group = %self.cfg.group, err = ?last_err, "heartbeat loop complete");
                return last_err.unwrap_or(GroupError::Canceled);
            }

            let Some(this_err) = err else { continue };

            if last_err.is_none() {
                info!(group = %self.cfg.group, err = %this_err, "heartbeat errored");
            } else {
                info!(
                    group = %self.cfg.group,
                    err = %this_err,
                    "heartbeat errored again while waiting for revoke to finish"
                );
            }

            if !did_revoke && revoked.is_none() {
                // IllegalGeneration, UnknownMemberId, a fenced instance: the
                // session is unrecoverable. Return without revoking; the
                // manager calls on_lost with everything instead. The session
                // still waits out on_assigned, so on_lost cannot race it.
                if !this_err.is_rebalance_in_progress() && !this_err.is_canceled() {
                    return this_err;
                }
                // Rebalance or shutdown: revoke cleanly. Shutdown revokes
                // everything regardless of protocol.
                revoked = Some(sess.revoke(self, this_err.is_canceled()));
            }

            if !did_metadone && metadone.is_none() {
                // The rebalance may stem from a metadata change we have not
                // observed yet; refresh while the revoke runs.
                let latch = Latch::new();
                let done = latch.clone();
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    inner
                        .metadata
                        .wait_meta(&inner.token, inner.cfg.session_timeout)
                        .await;
                    done.complete();
                });
                metadone = Some(latch);
            }

            if last_err.is_none() {
                last_err = Some(this_err);
            }
        }
    }
}
