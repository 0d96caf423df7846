//! Error types for the Synod cluster core
//!
//! Every variant is recoverable at the command boundary: the caller is told
//! what happened and the cluster keeps running.

use serde::{Deserialize, Serialize};

use crate::model::{EntityKind, MemberId};

/// Coarse error category reported to callers alongside the detailed error
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    NoAvailableMembers,
    InsufficientStock,
    ReplicationPartialFailure,
    Config,
}

/// Errors raised by registry, election, replication, dispatch and lifecycle operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClusterError {
    #[error("member {0} not found")]
    MemberNotFound(MemberId),

    #[error("{kind} '{id}' not found")]
    EntityNotFound { kind: EntityKind, id: String },

    #[error("member {0} is already crashed")]
    AlreadyCrashed(MemberId),

    #[error("member {0} is not crashed")]
    NotCrashed(MemberId),

    #[error("an election is already in progress")]
    ElectionAlreadyInProgress,

    #[error("member {0} cannot initiate an election")]
    InvalidInitiator(MemberId),

    #[error("no active members in the cluster")]
    NoActiveMembers,

    #[error("no available members to dispatch to")]
    NoAvailableMembers,

    #[error("insufficient stock for product '{product_id}': requested {requested}, available {available}")]
    InsufficientStock {
        product_id: String,
        requested: u32,
        available: u32,
    },

    #[error("replication partially failed: {succeeded}/{targets} targets updated, {failed} failed")]
    ReplicationPartialFailure {
        succeeded: usize,
        failed: usize,
        targets: usize,
    },

    #[error("member {0} is unavailable")]
    MemberUnavailable(MemberId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::MemberNotFound(_)
            | ClusterError::EntityNotFound { .. }
            | ClusterError::MemberUnavailable(_) => ErrorKind::NotFound,
            ClusterError::AlreadyCrashed(_)
            | ClusterError::NotCrashed(_)
            | ClusterError::ElectionAlreadyInProgress
            | ClusterError::InvalidInitiator(_)
            | ClusterError::InvalidArgument(_) => ErrorKind::InvalidState,
            ClusterError::NoActiveMembers | ClusterError::NoAvailableMembers => {
                ErrorKind::NoAvailableMembers
            }
            ClusterError::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            ClusterError::ReplicationPartialFailure { .. } => ErrorKind::ReplicationPartialFailure,
            ClusterError::Config(_) => ErrorKind::Config,
        }
    }

    /// Stable machine-readable reason attached to rejected commands
    pub fn reason_code(&self) -> &'static str {
        match self {
            ClusterError::MemberNotFound(_) => "MEMBER_NOT_FOUND",
            ClusterError::EntityNotFound { .. } => "ENTITY_NOT_FOUND",
            ClusterError::AlreadyCrashed(_) => "ALREADY_CRASHED",
            ClusterError::NotCrashed(_) => "NOT_CRASHED",
            ClusterError::ElectionAlreadyInProgress => "ELECTION_IN_PROGRESS",
            ClusterError::InvalidInitiator(_) => "INVALID_INITIATOR",
            ClusterError::NoActiveMembers => "NO_ACTIVE_MEMBERS",
            ClusterError::NoAvailableMembers => "NO_AVAILABLE_MEMBERS",
            ClusterError::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            ClusterError::ReplicationPartialFailure { .. } => "REPLICATION_PARTIAL_FAILURE",
            ClusterError::MemberUnavailable(_) => "MEMBER_UNAVAILABLE",
            ClusterError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ClusterError::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<config::ConfigError> for ClusterError {
    fn from(value: config::ConfigError) -> Self {
        ClusterError::Config(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ClusterError::MemberNotFound(MemberId(3));
        assert_eq!(err.to_string(), "member node-3 not found");

        let err = ClusterError::InsufficientStock {
            product_id: "p-1".to_string(),
            requested: 5,
            available: 2,
        };
        assert_eq!(
            err.to_string(),
            "insufficient stock for product 'p-1': requested 5, available 2"
        );

        let err = ClusterError::ReplicationPartialFailure {
            succeeded: 3,
            failed: 1,
            targets: 4,
        };
        assert_eq!(
            err.to_string(),
            "replication partially failed: 3/4 targets updated, 1 failed"
        );
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            ClusterError::AlreadyCrashed(MemberId(1)).kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            ClusterError::NoActiveMembers.kind(),
            ErrorKind::NoAvailableMembers
        );
        assert_eq!(
            ClusterError::EntityNotFound {
                kind: EntityKind::Product,
                id: "x".to_string()
            }
            .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            ClusterError::ElectionAlreadyInProgress.reason_code(),
            "ELECTION_IN_PROGRESS"
        );
    }
}
