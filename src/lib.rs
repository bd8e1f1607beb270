//! Consumer-group membership and offset-commit runtime for Kafka-compatible
//! brokers.
//!
//! streamgroup keeps one consumer inside a coordinator-managed group and
//! tracks the offsets it has consumed and committed. It implements:
//!
//! - **Membership**: JoinGroup/SyncGroup with member-id negotiation
//!   (KIP-394) and static membership (KIP-345)
//! - **Rebalancing**: both the eager (stop-the-world) and cooperative
//!   (incremental) protocols, driven by pluggable balancers
//! - **Heartbeating**: rebalance detection, forced heartbeats for
//!   transactional commits, clean revoke sequencing
//! - **Offsets**: fetching prior commits on join (KIP-447 aware), tracking
//!   per-partition progress with leader epochs (KIP-320), autocommit, and
//!   strictly ordered manual commits
//!
//! The Kafka wire format, broker discovery, and the record fetch path stay
//! behind the traits in [`transport`]; this crate is only the group state
//! machine.
//!
//! # Example
//!
//! ```rust,ignore
//! use streamgroup::{GroupConfig, GroupConsumer, TopicMeta};
//!
//! let cfg = GroupConfig::builder("my-group")
//!     .topic("orders")
//!     .build()?;
//! let group = GroupConsumer::new(cfg, client_token, transport, pipeline, metadata, vec![]);
//!
//! // Metadata refreshes feed the watcher; the first subscribable topic
//! // starts group management.
//! group.find_new_assignments(&[TopicMeta::new("orders", 6)]).await;
//!
//! // ... poll records via the fetch pipeline, then:
//! group.commit_uncommitted_offsets(token).await?;
//! group.leave_group().await;
//! ```

pub mod balance;
pub mod config;
pub mod error;
pub mod group;
pub mod transport;

pub use balance::{
    AssignmentMap, CooperativeStickyBalancer, GroupBalancer, JoinMember, RangeBalancer,
    StickyUserData,
};
pub use config::{
    CommitCallback, GroupConfig, GroupConfigBuilder, RebalanceCallback, RebalanceFuture,
};
pub use error::{GroupError, Result};
pub use group::{CommitCompletion, EpochOffset, GroupConsumer, OffsetMap, PolledBatch, Record};
pub use transport::{
    AssignMode, FetchPipeline, GroupHook, GroupTransport, MetadataWaiter, StartOffset,
    StartOffsets, TopicMeta,
};
