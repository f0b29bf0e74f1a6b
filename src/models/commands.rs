//! Commands applied to the coordinator machine, and their replies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::sac::SacCommand;
use crate::error::CoordinatorError;
use crate::models::effects::ActionKind;
use crate::models::{Epoch, NodeId, PeerHandle, RoleKind, StreamConf, StreamId, Tail};

/// A command delivered in total order by the consensus runtime.
///
/// The encoding is adjacently tagged so that commands appended by newer machine
/// versions deserialize to [`Command::Unknown`] instead of failing the replica.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "op", content = "body")]
pub enum Command {
    /// Create a new stream in epoch 1 with its writer pre-chosen.
    NewStream {
        id: StreamId,
        conf: StreamConf,
        reply_to: Option<ReplyAddress>,
    },
    /// Mark every member of the stream for deletion.
    DeleteStream { id: StreamId },
    /// Add a new replica member on the given node.
    AddReplica { id: StreamId, node: NodeId },
    /// Remove the member on the given node.
    DeleteReplica { id: StreamId, node: NodeId },
    /// Replace the stream's configuration; shipped to members as a retention update.
    PolicyChanged { id: StreamId, conf: StreamConf },
    /// Aux confirmation: a member process started.
    MemberStarted {
        id: StreamId,
        node: NodeId,
        epoch: Epoch,
        index: u64,
        pid: PeerHandle,
    },
    /// Aux confirmation: a member process stopped gracefully, reporting its tail.
    MemberStopped {
        id: StreamId,
        node: NodeId,
        epoch: Epoch,
        index: u64,
        tail: Tail,
    },
    /// Aux confirmation: a member's data was deleted from its node.
    MemberDeleted { id: StreamId, node: NodeId },
    /// Aux confirmation: a member received the current retention configuration.
    RetentionUpdated { id: StreamId, node: NodeId },
    /// Aux confirmation: the external catalog now carries the writer of the given epoch.
    CatalogUpdated { id: StreamId, epoch: Epoch },
    /// Aux failure report for an action scheduled at `index`.
    ActionFailed {
        id: StreamId,
        node: NodeId,
        index: u64,
        epoch: Epoch,
        action: ActionKind,
    },
    /// Register interest in endpoint changes of a stream.
    RegisterListener {
        id: StreamId,
        pid: PeerHandle,
        kind: ListenerKind,
    },
    /// A monitored process went down.
    Down { pid: PeerHandle, reason: DownReason },
    /// A previously unreachable node is reachable again.
    NodeUp { node: NodeId },
    /// Delegate to the embedded Single-Active-Consumer sub-machine.
    Sac(SacCommand),
    /// Run state migrations for each machine version step in `[from, to)`.
    MachineVersion { from: u32, to: u32 },
    /// A command appended by a newer machine version.
    #[serde(other)]
    Unknown,
}

/// The reason reported with a `down` event.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DownReason {
    /// The process's node became unreachable; the process itself may still be alive.
    Noconnection,
    /// Any other exit reason, carried verbatim.
    Other(String),
}

/// The kinds of endpoint interest a listener may register.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub enum ListenerKind {
    /// Interested in the stream's current writer pid.
    Leader,
    /// Interested in the running member pid on the listener's own node.
    LocalMember,
}

/// An opaque address to which a deferred reply is delivered.
#[derive(Clone, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ReplyAddress(pub PeerHandle);

/// The synchronous reply returned by the dispatcher for an applied command.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum Reply {
    /// The command was applied.
    Ok,
    /// No synchronous reply; the originator is answered later via a reply effect.
    NoReply,
    /// The command was refused; no state change took place.
    Error(CoordinatorError),
}

/// A read-only query against the machine state.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum Query {
    /// The pid of the stream's running writer.
    WriterPid(StreamId),
    /// The pid of the running member on the given node.
    LocalPid(StreamId, NodeId),
    /// All members of the stream with their pids & roles.
    Members(StreamId),
}

/// The successful output of a [`Query`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum QueryOutput {
    Pid(PeerHandle),
    Members(BTreeMap<NodeId, (Option<PeerHandle>, RoleKind)>),
}
