//! Data models of the coordinator and its collaborators.

pub mod commands;
pub mod effects;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use commands::{Command, DownReason, ListenerKind, Query, QueryOutput, Reply, ReplyAddress};
pub use effects::{ActionArgs, ActionKind, ActiveActions, AuxCmd, AuxSignal, Effect, MonitorTarget, QueueEvent};

/// A monotonic per-stream term in which exactly one writer exists.
pub type Epoch = u64;

/// The highest log position of a stopped member, as `(epoch, offset)`; `None` if the
/// member holds no data.
pub type Tail = Option<(Epoch, u64)>;

/// Unique identity of a stream within the cluster.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct StreamId(String);

impl StreamId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(src: &str) -> Self {
        Self(src.to_string())
    }
}

impl From<String> for StreamId {
    fn from(src: String) -> Self {
        Self(src)
    }
}

/// Identity of a node of the cluster.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(src: &str) -> Self {
        Self(src.to_string())
    }
}

impl From<String> for NodeId {
    fn from(src: String) -> Self {
        Self(src)
    }
}

/// Opaque identity of a log process running on a cluster node.
///
/// Only equality, ordering and node-of-pid are ever observed; the token itself carries
/// no meaning outside of the node which minted it.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct PeerHandle {
    node: NodeId,
    token: Uuid,
}

impl PeerHandle {
    /// Mint a new handle for a process on the given node.
    pub fn new(node: NodeId) -> Self {
        Self { node, token: Uuid::new_v4() }
    }

    /// The node on which this process runs.
    pub fn node(&self) -> &NodeId {
        &self.node
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.token, self.node)
    }
}

/// The role a member plays within its stream.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RoleKind {
    Writer,
    Replica,
}

/// Retention behavior of a stream.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RetentionSpec {
    /// The retention strategy in use.
    pub strategy: RetentionPolicy,
    /// The time-based retention window, in seconds; only read under the `Time` strategy.
    pub retention_seconds: Option<u64>,
}

/// All supported retention strategies.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RetentionPolicy {
    /// Retain data indefinitely.
    Retain,
    /// Retain data for a configured window of time.
    Time,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::Retain
    }
}

/// Per-epoch configuration shipped to the members of a stream.
///
/// The machine only reads `retention` and rewrites `leader_node`, `replica_nodes`,
/// `nodes` and `epoch` into shipped copies; all other fields pass through opaquely.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StreamConf {
    /// The name under which listener notifications for this stream are delivered.
    pub reference: String,
    /// Retention behavior of the stream.
    pub retention: RetentionSpec,
    /// All nodes which should host a member of this stream.
    pub nodes: Vec<NodeId>,
    /// The node hosting the stream's writer.
    pub leader_node: NodeId,
    /// The nodes hosting the stream's replicas.
    pub replica_nodes: Vec<NodeId>,
    /// The epoch for which this configuration was cut.
    pub epoch: Epoch,
}
