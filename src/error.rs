//! Coordinator error abstractions.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coordinator error variants.
///
/// These are the only error kinds ever surfaced to callers. They are carried inside
/// command replies and query results, and as such they are serializable and never wrap
/// node-local detail.
#[derive(Clone, Debug, Deserialize, Eq, Error, PartialEq, Serialize)]
pub enum CoordinatorError {
    /// No coordinator server could be reached.
    #[error("no coordinator server could be reached")]
    CoordinatorUnavailable,
    /// The operation timed out.
    #[error("the operation timed out")]
    Timeout,
    /// The requested resource was not found.
    #[error("the requested resource was not found")]
    NotFound,
    /// The target stream is unknown to the coordinator.
    #[error("the target stream is unknown to the coordinator")]
    StreamNotFound,
    /// The target stream has no running writer.
    #[error("the target stream has no running writer")]
    WriterNotFound,
    /// Refusal to delete a replica which would leave the stream without members.
    #[error("refusing to remove the last remaining members of the stream")]
    LastStreamMember,
    /// The operation is disallowed in the cluster's current state.
    #[error("operation disallowed: {0}")]
    Disallowed(DisallowedReason),
    /// The command is not recognized by this machine version.
    #[error("unknown command")]
    UnknownCommand,
}

/// Reasons for which an otherwise valid operation is refused.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DisallowedReason {
    /// Existing replicas are too far out of sync for a new replica to join safely.
    OutOfSyncReplica,
}

impl fmt::Display for DisallowedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfSyncReplica => write!(f, "replica write offsets are out of sync"),
        }
    }
}
