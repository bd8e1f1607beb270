//! The JoinGroup / SyncGroup driver.
//!
//! Joining is a small state machine: a join can be told to restart with a
//! coordinator-assigned member id (KIP-394) or with no member id at all, and
//! a sync can be told the group is already rebalancing again, which restarts
//! from the join. The elected leader balances the group between the two
//! steps; followers sync with an empty plan and receive their assignment.

use crate::balance::{self, JoinMember};
use crate::error::{GroupError, Result};
use crate::group::GroupInner;
use kafka_protocol::messages::join_group_request::JoinGroupRequestProtocol;
use kafka_protocol::messages::sync_group_request::SyncGroupRequestAssignment;
use kafka_protocol::messages::{
    GroupId, JoinGroupRequest, JoinGroupResponse, SyncGroupRequest, SyncGroupResponse,
};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::ResponseError;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

enum JoinOutcome {
    /// Retry the join; the member identity was adjusted per the response.
    Restart,
    /// Joined; `plan` is empty unless this member leads the generation.
    Joined {
        protocol: String,
        plan: Vec<SyncGroupRequestAssignment>,
    },
}

impl GroupInner {
    /// Join the group and sync an assignment. On success the assignment maps
    /// are updated and the caller can start the session.
    pub(crate) async fn join_and_sync(self: &Arc<Self>) -> Result<()> {
        info!(group = %self.cfg.group, "joining group");
        self.leader.store(false, Ordering::SeqCst);

        loop {
            // Anything that asked for a rejoin before this point is being
            // served right now.
            self.rejoin.drain();

            let join_req = self.build_join_request().await;
            let resp = tokio::select! {
                res = self.transport.join_group(&self.token, join_req) => res?,
                _ = self.token.cancelled() => return Err(GroupError::Canceled),
            };

            let (protocol, plan) = match self.handle_join_resp(resp).await? {
                JoinOutcome::Restart => continue,
                JoinOutcome::Joined { protocol, plan } => (protocol, plan),
            };

            let sync_req = self.build_sync_request(&protocol, plan).await;
            info!(
                group = %self.cfg.group,
                protocol_type = %self.cfg.protocol_type,
                protocol = %protocol,
                "syncing"
            );
            let resp = tokio::select! {
                res = self.transport.sync_group(&self.token, sync_req) => res?,
                _ = self.token.cancelled() => return Err(GroupError::Canceled),
            };

            match self.handle_sync_resp(&protocol, resp).await {
                Err(err) if err.is_rebalance_in_progress() => {
                    info!(
                        group = %self.cfg.group,
                        "sync failed with RebalanceInProgress, rejoining"
                    );
                    continue;
                }
                Err(err) => {
                    warn!(group = %self.cfg.group, %err, "sync group failed");
                    return Err(err);
                }
                Ok(()) => return Ok(()),
            }
        }
    }

    async fn build_join_request(&self) -> JoinGroupRequest {
        let (topics, current, generation, member_id) = {
            let st = self.mu.lock().await;
            (
                GroupInner::using_topics(&st),
                st.now_assigned.clone().unwrap_or_default(),
                st.generation,
                st.member_id.clone(),
            )
        };

        let protocols = self
            .cfg
            .balancers
            .iter()
            .map(|b| {
                JoinGroupRequestProtocol::default()
                    .with_name(StrBytes::from_string(b.protocol_name().to_string()))
                    .with_metadata(b.join_metadata(&topics, &current, generation))
            })
            .collect();

        let mut req = JoinGroupRequest::default()
            .with_group_id(GroupId::from(StrBytes::from_string(self.cfg.group.clone())))
            .with_session_timeout_ms(self.cfg.session_timeout.as_millis() as i32)
            .with_rebalance_timeout_ms(self.cfg.rebalance_timeout.as_millis() as i32)
            .with_protocol_type(StrBytes::from_string(self.cfg.protocol_type.clone()))
            .with_member_id(StrBytes::from_string(member_id))
            .with_protocols(protocols);
        if let Some(id) = &self.cfg.instance_id {
            req = req.with_group_instance_id(Some(StrBytes::from_string(id.clone())));
        }
        req
    }

    async fn handle_join_resp(self: &Arc<Self>, resp: JoinGroupResponse) -> Result<JoinOutcome> {
        if let Some(err) = GroupError::for_code(resp.error_code) {
            match err {
                GroupError::Coordinator(ResponseError::MemberIdRequired) => {
                    let member_id = resp.member_id.as_str().to_string();
                    self.mu.lock().await.member_id = member_id.clone();
                    info!(
                        group = %self.cfg.group,
                        member_id = %member_id,
                        "join returned MemberIdRequired, rejoining with response's member id"
                    );
                    return Ok(JoinOutcome::Restart);
                }
                GroupError::Coordinator(ResponseError::UnknownMemberId) => {
                    self.mu.lock().await.member_id.clear();
                    info!(
                        group = %self.cfg.group,
                        "join returned UnknownMemberId, rejoining without a member id"
                    );
                    return Ok(JoinOutcome::Restart);
                }
                err => {
                    // The transport retries what is retriable; this is final.
                    warn!(group = %self.cfg.group, %err, "join group failed");
                    return Err(err);
                }
            }
        }

        let member_id = resp.member_id.as_str().to_string();
        let generation = resp.generation_id;
        {
            // Commits read the member identity at any moment; both fields
            // move together under the lock.
            let mut st = self.mu.lock().await;
            st.member_id = member_id.clone();
            st.generation = generation;
        }

        let protocol = resp
            .protocol_name
            .as_ref()
            .map(|p| p.as_str().to_string())
            .unwrap_or_default();

        if resp.leader != resp.member_id {
            info!(
                group = %self.cfg.group,
                member_id = %member_id,
                generation,
                leader = false,
                "joined"
            );
            return Ok(JoinOutcome::Joined {
                protocol,
                plan: Vec::new(),
            });
        }

        self.leader.store(true, Ordering::SeqCst);
        info!(
            group = %self.cfg.group,
            member_id = %member_id,
            generation,
            balance_protocol = %protocol,
            leader = true,
            "joined, balancing group"
        );
        let plan = self.balance_group(&protocol, &resp).await?;
        Ok(JoinOutcome::Joined { protocol, plan })
    }

    /// Leader only: run the balancer the coordinator chose over the full
    /// member list and encode the per-member plan for SyncGroup.
    async fn balance_group(
        &self,
        protocol: &str,
        resp: &JoinGroupResponse,
    ) -> Result<Vec<SyncGroupRequestAssignment>> {
        let balancer = self.find_balancer(protocol)?;
        let members: Vec<JoinMember> = resp
            .members
            .iter()
            .map(|m| JoinMember {
                member_id: m.member_id.as_str().to_string(),
                instance_id: m.group_instance_id.as_ref().map(|s| s.as_str().to_string()),
                metadata: m.metadata.clone(),
            })
            .collect();
        let partitions = {
            let st = self.mu.lock().await;
            st.using.clone()
        };
        let plan = balancer.balance(&members, &partitions)?;
        Ok(plan
            .into_iter()
            .map(|(member_id, assignment)| {
                SyncGroupRequestAssignment::default()
                    .with_member_id(StrBytes::from_string(member_id))
                    .with_assignment(balance::encode_assignment(&assignment))
            })
            .collect())
    }

    async fn build_sync_request(
        &self,
        protocol: &str,
        plan: Vec<SyncGroupRequestAssignment>,
    ) -> SyncGroupRequest {
        let (member_id, generation) = {
            let st = self.mu.lock().await;
            (st.member_id.clone(), st.generation)
        };
        let mut req = SyncGroupRequest::default()
            .with_group_id(GroupId::from(StrBytes::from_string(self.cfg.group.clone())))
            .with_generation_id(generation)
            .with_member_id(StrBytes::from_string(member_id))
            .with_protocol_type(Some(StrBytes::from_string(self.cfg.protocol_type.clone())))
            .with_protocol_name(Some(StrBytes::from_string(protocol.to_string())))
            .with_assignments(plan);
        if let Some(id) = &self.cfg.instance_id {
            req = req.with_group_instance_id(Some(StrBytes::from_string(id.clone())));
        }
        req
    }

    async fn handle_sync_resp(&self, protocol: &str, resp: SyncGroupResponse) -> Result<()> {
        if let Some(err) = GroupError::for_code(resp.error_code) {
            return Err(err);
        }
        let balancer = self.find_balancer(protocol)?;
        let assigned = balancer.parse_sync_assignment(&resp.assignment).map_err(|err| {
            error!(group = %self.cfg.group, %err, "sync assignment parse failed");
            err
        })?;
        info!(group = %self.cfg.group, assigned = ?assigned, "synced");

        // Past this point the session's prerevoke owns reconciling what was
        // lost against what is now assigned.
        let mut st = self.mu.lock().await;
        if self.cooperative {
            st.last_assigned = st.now_assigned.take();
        }
        st.now_assigned = Some(assigned);
        Ok(())
    }

    pub(crate) fn find_balancer(
        &self,
        protocol: &str,
    ) -> Result<&Arc<dyn crate::balance::GroupBalancer>> {
        self.cfg
            .balancers
            .iter()
            .find(|b| b.protocol_name() == protocol)
            .ok_or_else(|| GroupError::UnknownProtocol(protocol.to_string()))
    }
}
