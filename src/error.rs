//! Error types for streamgroup
//!
//! This module defines the main error type used throughout the crate and the
//! mapping from Kafka protocol error codes, so that coordinator responses can
//! be classified into the handful of outcomes the group state machine cares
//! about: clean rebalances, fatal member-identity errors, and transient
//! offset-fetch conditions.

use kafka_protocol::ResponseError;
use thiserror::Error;

/// Result type alias for streamgroup operations
pub type Result<T> = std::result::Result<T, GroupError>;

/// Main error type for group membership and offset management
#[derive(Error, Debug, Clone)]
pub enum GroupError {
    /// The coordinator replied with a Kafka error code
    #[error("coordinator error: {0:?}")]
    Coordinator(ResponseError),

    /// The surrounding context was canceled (group shutdown or caller cancel)
    #[error("operation canceled")]
    Canceled,

    /// The transport failed to round-trip a request
    #[error("transport error: {0}")]
    Transport(String),

    /// Assignment balancing failed on the leader
    #[error("balance error: {0}")]
    Balance(String),

    /// The coordinator selected a balance protocol we did not offer
    #[error("unknown balance protocol: {0}")]
    UnknownProtocol(String),

    /// A coordinator response did not structurally match its request
    #[error("malformed coordinator response: {0}")]
    BadResponse(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl GroupError {
    /// Map a Kafka error code to an error, `None` when the code signals success.
    pub fn for_code(code: i16) -> Option<GroupError> {
        ResponseError::try_from_code(code).map(GroupError::Coordinator)
    }

    /// True when the coordinator is telling us a rebalance has begun and we
    /// should revoke and rejoin cleanly.
    pub fn is_rebalance_in_progress(&self) -> bool {
        matches!(
            self,
            GroupError::Coordinator(ResponseError::RebalanceInProgress)
        )
    }

    /// True when the error came from cancellation rather than the coordinator.
    pub fn is_canceled(&self) -> bool {
        matches!(self, GroupError::Canceled)
    }

    /// True for the member-identity errors that end a session fatally:
    /// the member must be treated as having lost its partitions.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            GroupError::Coordinator(
                ResponseError::UnknownMemberId
                    | ResponseError::IllegalGeneration
                    | ResponseError::FencedInstanceId
            )
        )
    }

    /// True when an offset fetch should pause and retry (KIP-447).
    pub fn is_unstable_offset_commit(&self) -> bool {
        matches!(
            self,
            GroupError::Coordinator(ResponseError::UnstableOffsetCommit)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_code_none_on_success() {
        assert!(GroupError::for_code(0).is_none());
    }

    #[test]
    fn test_for_code_maps_rebalance() {
        let err = GroupError::for_code(ResponseError::RebalanceInProgress.code()).unwrap();
        assert!(err.is_rebalance_in_progress());
        assert!(!err.is_fatal_to_session());
    }

    #[test]
    fn test_member_identity_errors_are_fatal() {
        for code in [
            ResponseError::UnknownMemberId,
            ResponseError::IllegalGeneration,
            ResponseError::FencedInstanceId,
        ] {
            let err = GroupError::for_code(code.code()).unwrap();
            assert!(err.is_fatal_to_session(), "{err} should be fatal");
        }
    }

    #[test]
    fn test_canceled_is_not_fatal_identity() {
        assert!(GroupError::Canceled.is_canceled());
        assert!(!GroupError::Canceled.is_fatal_to_session());
    }
}
