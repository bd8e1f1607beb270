//! Partition balancing for group membership.
//!
//! The leader of each generation runs a balancer over the full member list to
//! compute per-member assignments; every member uses the same balancer (picked
//! by the protocol name the coordinator chose) to parse the assignment it
//! receives in SyncGroup.
//!
//! Two strategies ship in-tree:
//!
//! - [`RangeBalancer`]: contiguous per-topic ranges, eager protocol
//! - [`CooperativeStickyBalancer`]: keeps partitions with their prior owner,
//!   withholding moving partitions for one generation so members revoke
//!   incrementally instead of stopping the world

mod protocol;
mod range;
mod sticky;

pub use range::RangeBalancer;
pub use sticky::{CooperativeStickyBalancer, StickyUserData};

pub(crate) use protocol::encode_assignment;

use crate::error::Result;
use bytes::Bytes;
use std::collections::BTreeMap;

/// A group assignment: topic to sorted partition ids.
pub type AssignmentMap = BTreeMap<String, Vec<i32>>;

/// One member as seen in a JoinGroup response, handed to the leader's balancer.
#[derive(Debug, Clone)]
pub struct JoinMember {
    pub member_id: String,
    pub instance_id: Option<String>,
    /// The member's serialized subscription, produced by its
    /// [`GroupBalancer::join_metadata`].
    pub metadata: Bytes,
}

/// Strategy for assigning partitions across group members.
///
/// A balancer owns both the balancing decision (run on the leader only) and
/// the byte format of the subscription/assignment payloads that ride inside
/// JoinGroup and SyncGroup.
pub trait GroupBalancer: Send + Sync {
    /// The protocol name offered in JoinGroup, e.g. `"range"`.
    fn protocol_name(&self) -> &'static str;

    /// Whether this balancer follows the cooperative rebalance protocol.
    /// A group is cooperative only if every configured balancer is.
    fn is_cooperative(&self) -> bool;

    /// Serialize this member's subscription for JoinGroup. `topics` is sorted;
    /// `current` is the member's current assignment (relevant to cooperative
    /// and sticky strategies) and `generation` the generation it was built in.
    fn join_metadata(&self, topics: &[String], current: &AssignmentMap, generation: i32) -> Bytes;

    /// Compute the assignment for every member. Only the leader calls this.
    /// `partitions` maps each subscribable topic to its known partition count.
    fn balance(
        &self,
        members: &[JoinMember],
        partitions: &BTreeMap<String, i32>,
    ) -> Result<BTreeMap<String, AssignmentMap>>;

    /// Parse the assignment bytes this member received in SyncGroup.
    fn parse_sync_assignment(&self, data: &Bytes) -> Result<AssignmentMap>;
}
