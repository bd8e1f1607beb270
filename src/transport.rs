//! Contracts consumed from external collaborators.
//!
//! The group core does not speak the Kafka wire format, discover brokers, or
//! buffer records itself. It drives those concerns through the traits in this
//! module:
//!
//! - [`GroupTransport`]: round-trips coordinator requests under a cancellation
//!   token, retrying retriable coordinator errors (coordinator loading, not
//!   coordinator) internally so the core never sees them
//! - [`MetadataWaiter`]: blocks until a cluster metadata refresh completes
//! - [`FetchPipeline`]: the record-fetching side of the consumer, told which
//!   partitions to start, stop, or rewind
//! - [`GroupHook`]: fan-out of group lifecycle events to listeners

use crate::error::Result;
use async_trait::async_trait;
use kafka_protocol::messages::{
    HeartbeatRequest, HeartbeatResponse, JoinGroupRequest, JoinGroupResponse, LeaveGroupRequest,
    LeaveGroupResponse, OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest,
    OffsetFetchResponse, SyncGroupRequest, SyncGroupResponse,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::GroupError;

/// Round-trips group coordinator requests.
///
/// Implementations own broker discovery, connection management, and the frame
/// codec. Every method must return promptly once `token` is canceled.
/// Retriable coordinator errors (`CoordinatorLoadInProgress`, `NotCoordinator`,
/// network blips) are retried inside the transport; any error surfaced to the
/// core is treated as final for the current attempt.
#[async_trait]
pub trait GroupTransport: Send + Sync {
    async fn join_group(
        &self,
        token: &CancellationToken,
        req: JoinGroupRequest,
    ) -> Result<JoinGroupResponse>;

    async fn sync_group(
        &self,
        token: &CancellationToken,
        req: SyncGroupRequest,
    ) -> Result<SyncGroupResponse>;

    async fn heartbeat(
        &self,
        token: &CancellationToken,
        req: HeartbeatRequest,
    ) -> Result<HeartbeatResponse>;

    async fn offset_commit(
        &self,
        token: &CancellationToken,
        req: OffsetCommitRequest,
    ) -> Result<OffsetCommitResponse>;

    async fn offset_fetch(
        &self,
        token: &CancellationToken,
        req: OffsetFetchRequest,
    ) -> Result<OffsetFetchResponse>;

    async fn leave_group(
        &self,
        token: &CancellationToken,
        req: LeaveGroupRequest,
    ) -> Result<LeaveGroupResponse>;
}

/// Waits for cluster metadata refreshes.
///
/// The group manager waits on metadata while backing off after an errored
/// session, and the heartbeat loop waits on it while a revoke runs, because a
/// rebalance is often triggered by a metadata change we have not seen yet.
#[async_trait]
pub trait MetadataWaiter: Send + Sync {
    /// Return once a metadata refresh finishes, `max_wait` elapses, or the
    /// token is canceled, whichever comes first.
    async fn wait_meta(&self, token: &CancellationToken, max_wait: Duration);
}

/// Where a partition should start (or resume) fetching.
///
/// `at` follows the Kafka list-offsets convention: `-2` is the log start,
/// `-1` is the log end, anything else is an exact offset. `epoch` carries the
/// leader epoch for fencing (KIP-320), `-1` when unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOffset {
    pub at: i64,
    pub epoch: i32,
}

impl StartOffset {
    /// Start at the beginning of the partition.
    pub fn earliest() -> Self {
        Self { at: -2, epoch: -1 }
    }

    /// Start at the end of the partition.
    pub fn latest() -> Self {
        Self { at: -1, epoch: -1 }
    }

    /// Start at an exact offset.
    pub fn at(offset: i64, epoch: i32) -> Self {
        Self { at: offset, epoch }
    }
}

/// Start offsets keyed by topic then partition.
pub type StartOffsets = BTreeMap<String, BTreeMap<i32, StartOffset>>;

/// How an `assign_partitions` call interacts with in-flight fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignMode {
    /// Stop everything and drop all buffered fetches (eager revoke).
    InvalidateAll,
    /// Stop and drop buffers only for the named partitions (cooperative revoke).
    InvalidateMatching,
    /// Start the named partitions without touching anything in flight
    /// (seeding newly assigned partitions after an offset fetch).
    WithoutInvalidating,
    /// Rewind the named partitions that are already being consumed
    /// (explicit offset override).
    SetMatching,
}

/// The record-fetching half of the consumer.
///
/// The pipeline is expected to call back into
/// [`GroupConsumer::update_uncommitted`](crate::GroupConsumer::update_uncommitted)
/// whenever it hands records to the user, which is how consumed progress
/// reaches the commit path.
pub trait FetchPipeline: Send + Sync {
    /// Apply a partition assignment change. `offsets` is `None` only for
    /// [`AssignMode::InvalidateAll`]. `topics` is the set of topics the group
    /// member is using, for implementations that track per-topic state.
    fn assign_partitions(&self, offsets: Option<&StartOffsets>, mode: AssignMode, topics: &[String]);
}

/// Listener for group lifecycle events.
pub trait GroupHook: Send + Sync {
    /// Called when the manage loop exits a session with an error, after the
    /// lost/revoked callback has run.
    fn on_group_manage_error(&self, _err: &GroupError) {}
}

/// One topic as seen by a metadata refresh, fed to
/// [`GroupConsumer::find_new_assignments`](crate::GroupConsumer::find_new_assignments).
#[derive(Debug, Clone)]
pub struct TopicMeta {
    pub name: String,
    /// Number of partitions the metadata reported. Topics with zero known
    /// partitions are ignored until metadata catches up.
    pub partitions: i32,
    /// Internal topics (`__consumer_offsets` and friends) are never matched
    /// by regex subscriptions.
    pub internal: bool,
}

impl TopicMeta {
    pub fn new(name: impl Into<String>, partitions: i32) -> Self {
        Self {
            name: name.into(),
            partitions,
            internal: false,
        }
    }
}
