//! Contract types shared with the consensus runtime.
//!
//! The runtime itself is an external collaborator: it orders commands, persists the
//! log, snapshots machine state on release-cursor boundaries, and executes the effects
//! the machine returns. Everything the machine assumes about it is captured here.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::Command;

/// The machine version implemented by this crate.
pub const MACHINE_VERSION: u32 = 3;

/// The interval, in applied commands, at which a release cursor is emitted.
pub const RELEASE_CURSOR_INTERVAL: u64 = 4096;

/// Metadata the runtime supplies with every command it applies.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Meta {
    /// The monotonic index of the command in the replicated log.
    pub index: u64,
    /// Wall-clock time at the leader when the command was appended, in milliseconds.
    pub system_time: u64,
    /// The effective machine version negotiated across the cluster.
    pub machine_version: u32,
}

/// The runtime role of the local replica of the coordinator machine.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RuntimeRole {
    Leader,
    Follower,
    Candidate,
}

/// A handle used by out-of-band collaborators to inject commands back into the
/// replicated log, re-serializing them into the deterministic command stream.
#[async_trait]
pub trait CommandSink: Send + Sync + 'static {
    async fn inject(&self, cmd: Command) -> Result<()>;
}
