//! Shared test fixtures: a scripted mock coordinator, a recording fetch
//! pipeline, and event-collecting lifecycle callbacks.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::join_group_response::JoinGroupResponseMember;
use kafka_protocol::messages::offset_commit_response::{
    OffsetCommitResponsePartition, OffsetCommitResponseTopic,
};
use kafka_protocol::messages::offset_fetch_response::{
    OffsetFetchResponsePartition, OffsetFetchResponseTopic,
};
use kafka_protocol::messages::{
    HeartbeatRequest, HeartbeatResponse, JoinGroupRequest, JoinGroupResponse, LeaveGroupRequest,
    LeaveGroupResponse, OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest,
    OffsetFetchResponse, SyncGroupRequest, SyncGroupResponse, TopicName,
};
use kafka_protocol::protocol::StrBytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI16, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamgroup::{
    AssignMode, AssignmentMap, FetchPipeline, GroupConfig, GroupConfigBuilder, GroupConsumer,
    GroupError, GroupTransport, MetadataWaiter, RebalanceCallback, Result, StartOffsets,
};
use tokio_util::sync::CancellationToken;

pub const MEMBER: &str = "member-1";

/// Call at the top of a test to see the group's tracing output
/// (`RUST_LOG=streamgroup=debug cargo test -- --nocapture`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A scripted group coordinator. Responses can be queued per request kind;
/// when a queue is empty a sensible default is derived from the request, with
/// this member as leader of a one-member group.
#[derive(Default)]
pub struct MockCoordinator {
    pub join_queue: Mutex<VecDeque<JoinGroupResponse>>,
    pub sync_queue: Mutex<VecDeque<SyncGroupResponse>>,
    pub fetch_queue: Mutex<VecDeque<OffsetFetchResponse>>,
    /// Error code every heartbeat answers with.
    pub heartbeat_code: AtomicI16,
    /// Commits that should hang until their token is canceled.
    pub hold_commits: AtomicUsize,
    /// Commits that should take 200ms before answering.
    pub delay_commits: AtomicUsize,
    generation: AtomicI32,
    pub join_requests: Mutex<Vec<JoinGroupRequest>>,
    pub sync_requests: Mutex<Vec<SyncGroupRequest>>,
    pub commit_requests: Mutex<Vec<OffsetCommitRequest>>,
    pub fetch_requests: AtomicUsize,
    pub heartbeat_requests: AtomicUsize,
    pub leave_requests: AtomicUsize,
}

impl MockCoordinator {
    pub fn commit_count(&self) -> usize {
        self.commit_requests.lock().len()
    }

    pub fn join_count(&self) -> usize {
        self.join_requests.lock().len()
    }
}

#[async_trait]
impl GroupTransport for MockCoordinator {
    async fn join_group(
        &self,
        _token: &CancellationToken,
        req: JoinGroupRequest,
    ) -> Result<JoinGroupResponse> {
        let scripted = self.join_queue.lock().pop_front();
        let resp = scripted.unwrap_or_else(|| {
            let member_id = if req.member_id.is_empty() {
                MEMBER.to_string()
            } else {
                req.member_id.as_str().to_string()
            };
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let protocol = req
                .protocols
                .first()
                .map(|p| p.name.as_str().to_string())
                .unwrap_or_default();
            let metadata = req
                .protocols
                .first()
                .map(|p| p.metadata.clone())
                .unwrap_or_default();
            JoinGroupResponse::default()
                .with_error_code(0)
                .with_generation_id(generation)
                .with_protocol_name(Some(StrBytes::from_string(protocol)))
                .with_member_id(StrBytes::from_string(member_id.clone()))
                .with_leader(StrBytes::from_string(member_id.clone()))
                .with_members(vec![JoinGroupResponseMember::default()
                    .with_member_id(StrBytes::from_string(member_id))
                    .with_metadata(metadata)])
        });
        self.join_requests.lock().push(req);
        Ok(resp)
    }

    async fn sync_group(
        &self,
        _token: &CancellationToken,
        req: SyncGroupRequest,
    ) -> Result<SyncGroupResponse> {
        let scripted = self.sync_queue.lock().pop_front();
        let resp = scripted.unwrap_or_else(|| {
            // Echo back the plan the leader computed for itself.
            let assignment = req
                .assignments
                .iter()
                .find(|a| a.member_id == req.member_id)
                .map(|a| a.assignment.clone())
                .unwrap_or_else(|| encode_assignment(&[]));
            SyncGroupResponse::default()
                .with_error_code(0)
                .with_assignment(assignment)
        });
        self.sync_requests.lock().push(req);
        Ok(resp)
    }

    async fn heartbeat(
        &self,
        _token: &CancellationToken,
        _req: HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        self.heartbeat_requests.fetch_add(1, Ordering::SeqCst);
        Ok(HeartbeatResponse::default()
            .with_error_code(self.heartbeat_code.load(Ordering::SeqCst)))
    }

    async fn offset_commit(
        &self,
        token: &CancellationToken,
        req: OffsetCommitRequest,
    ) -> Result<OffsetCommitResponse> {
        self.commit_requests.lock().push(req.clone());

        if self
            .hold_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            token.cancelled().await;
            return Err(GroupError::Canceled);
        }
        if self
            .delay_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                _ = token.cancelled() => return Err(GroupError::Canceled),
            }
        }

        let topics = req
            .topics
            .iter()
            .map(|topic| {
                OffsetCommitResponseTopic::default()
                    .with_name(topic.name.clone())
                    .with_partitions(
                        topic
                            .partitions
                            .iter()
                            .map(|p| {
                                OffsetCommitResponsePartition::default()
                                    .with_partition_index(p.partition_index)
                                    .with_error_code(0)
                            })
                            .collect(),
                    )
            })
            .collect();
        Ok(OffsetCommitResponse::default().with_topics(topics))
    }

    async fn offset_fetch(
        &self,
        _token: &CancellationToken,
        req: OffsetFetchRequest,
    ) -> Result<OffsetFetchResponse> {
        self.fetch_requests.fetch_add(1, Ordering::SeqCst);
        if let Some(resp) = self.fetch_queue.lock().pop_front() {
            return Ok(resp);
        }
        // Default: nothing committed yet.
        let topics = req
            .topics
            .unwrap_or_default()
            .into_iter()
            .map(|topic| {
                OffsetFetchResponseTopic::default()
                    .with_name(topic.name.clone())
                    .with_partitions(
                        topic
                            .partition_indexes
                            .iter()
                            .map(|&p| {
                                OffsetFetchResponsePartition::default()
                                    .with_partition_index(p)
                                    .with_committed_offset(-1)
                                    .with_committed_leader_epoch(-1)
                                    .with_error_code(0)
                            })
                            .collect(),
                    )
            })
            .collect();
        Ok(OffsetFetchResponse::default().with_topics(topics))
    }

    async fn leave_group(
        &self,
        _token: &CancellationToken,
        _req: LeaveGroupRequest,
    ) -> Result<LeaveGroupResponse> {
        self.leave_requests.fetch_add(1, Ordering::SeqCst);
        Ok(LeaveGroupResponse::default())
    }
}

/// Records every assignment change the group pushes at the fetch pipeline.
#[derive(Default)]
pub struct MockPipeline {
    pub calls: Mutex<Vec<(AssignMode, Option<StartOffsets>)>>,
}

impl MockPipeline {
    pub fn modes(&self) -> Vec<AssignMode> {
        self.calls.lock().iter().map(|(mode, _)| *mode).collect()
    }
}

impl FetchPipeline for MockPipeline {
    fn assign_partitions(
        &self,
        offsets: Option<&StartOffsets>,
        mode: AssignMode,
        _topics: &[String],
    ) {
        self.calls.lock().push((mode, offsets.cloned()));
    }
}

pub struct MockMetadata;

#[async_trait]
impl MetadataWaiter for MockMetadata {
    async fn wait_meta(&self, token: &CancellationToken, _max_wait: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(1)) => {}
            _ = token.cancelled() => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Assigned(AssignmentMap),
    Revoked(AssignmentMap),
    Lost(AssignmentMap),
}

pub type Events = Arc<Mutex<Vec<Event>>>;

fn recorder(events: &Events, wrap: fn(AssignmentMap) -> Event) -> RebalanceCallback {
    let events = Arc::clone(events);
    Arc::new(move |_token, map| {
        let events = Arc::clone(&events);
        Box::pin(async move {
            events.lock().push(wrap(map));
        })
    })
}

pub fn record_assigned(events: &Events) -> RebalanceCallback {
    recorder(events, Event::Assigned)
}

pub fn record_revoked(events: &Events) -> RebalanceCallback {
    recorder(events, Event::Revoked)
}

pub fn record_lost(events: &Events) -> RebalanceCallback {
    recorder(events, Event::Lost)
}

pub struct Harness {
    pub coordinator: Arc<MockCoordinator>,
    pub pipeline: Arc<MockPipeline>,
    pub group: GroupConsumer,
    pub client_token: CancellationToken,
    pub events: Events,
}

/// Build a group wired to mocks, with fast timers and both lifecycle
/// callbacks recording into `events`. The closure can override any config.
pub fn harness(configure: impl FnOnce(GroupConfigBuilder) -> GroupConfigBuilder) -> Harness {
    let events: Events = Events::default();
    let builder = GroupConfig::builder("test-group")
        .topic("t")
        .heartbeat_interval(Duration::from_millis(100))
        .session_timeout(Duration::from_secs(2))
        .retry_backoff(Duration::from_millis(10), Duration::from_millis(50))
        .on_assigned(record_assigned(&events))
        .on_revoked(record_revoked(&events));
    let cfg = configure(builder).build().expect("config must build");

    let coordinator = Arc::new(MockCoordinator::default());
    let pipeline = Arc::new(MockPipeline::default());
    let client_token = CancellationToken::new();
    let group = GroupConsumer::new(
        cfg,
        client_token.clone(),
        coordinator.clone(),
        pipeline.clone(),
        Arc::new(MockMetadata),
        vec![],
    );

    Harness {
        coordinator,
        pipeline,
        group,
        client_token,
        events,
    }
}

/// Spin (in test time) until the condition holds.
pub async fn await_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn assignment(entries: &[(&str, &[i32])]) -> AssignmentMap {
    entries
        .iter()
        .map(|(t, ps)| (t.to_string(), ps.to_vec()))
        .collect()
}

/// Consumer-protocol member assignment bytes, for scripting SyncGroup
/// responses: version, topic/partitions array, empty user data.
pub fn encode_assignment(entries: &[(&str, &[i32])]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i16(0);
    buf.put_i32(entries.len() as i32);
    for (topic, partitions) in entries {
        buf.put_i16(topic.len() as i16);
        buf.put_slice(topic.as_bytes());
        buf.put_i32(partitions.len() as i32);
        for partition in *partitions {
            buf.put_i32(*partition);
        }
    }
    buf.put_i32(-1);
    buf.freeze()
}

pub fn sync_response(entries: &[(&str, &[i32])]) -> SyncGroupResponse {
    SyncGroupResponse::default()
        .with_error_code(0)
        .with_assignment(encode_assignment(entries))
}

pub fn fetch_response(entries: &[(&str, i32, i64, i16)]) -> OffsetFetchResponse {
    let mut topics: Vec<OffsetFetchResponseTopic> = Vec::new();
    for (topic, partition, offset, error_code) in entries {
        let partition_resp = OffsetFetchResponsePartition::default()
            .with_partition_index(*partition)
            .with_committed_offset(*offset)
            .with_committed_leader_epoch(if *offset >= 0 { 1 } else { -1 })
            .with_error_code(*error_code);
        match topics.iter_mut().find(|t| t.name.as_str() == *topic) {
            Some(existing) => existing.partitions.push(partition_resp),
            None => topics.push(
                OffsetFetchResponseTopic::default()
                    .with_name(TopicName::from(StrBytes::from_string(topic.to_string())))
                    .with_partitions(vec![partition_resp]),
            ),
        }
    }
    OffsetFetchResponse::default().with_topics(topics)
}
