//! Effects returned from the coordinator machine for execution by the runtime & aux.

use serde::{Deserialize, Serialize};

use crate::error::CoordinatorError;
use crate::models::{Epoch, NodeId, PeerHandle, ReplyAddress, StreamConf, StreamId};

/// A side-effect to be executed outside of the deterministic machine.
///
/// Effects are emitted in a deterministic order; the runtime executes them only on the
/// leader replica, after the triggering command has been committed.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Run an out-of-band action through the aux executor.
    Aux(AuxCmd),
    /// Deliver a control signal to the aux executor.
    AuxSignal(AuxSignal),
    /// Ask the runtime to watch a process or node and report `down`/`nodeup` events.
    Monitor(MonitorTarget),
    /// Deliver a queue event notification to a listener pid.
    Notify {
        pid: PeerHandle,
        queue_ref: String,
        event: QueueEvent,
    },
    /// Deliver a deferred reply to the originator of an earlier command.
    Reply {
        to: ReplyAddress,
        result: Result<PeerHandle, CoordinatorError>,
    },
    /// Allow the runtime to compact the log up to `index` against the given snapshot.
    ReleaseCursor {
        index: u64,
        snapshot: Box<crate::core::Coordinator>,
    },
}

/// A monitoring target for the runtime.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum MonitorTarget {
    Process(PeerHandle),
    Node(NodeId),
}

/// A notification delivered to listener pids as `(queue_event, queue_ref, event)`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum QueueEvent {
    /// The stream's writer endpoint changed.
    LeaderChange(PeerHandle),
    /// The running member on the listener's node changed.
    LocalMemberChange(PeerHandle),
    /// The stream was destroyed.
    Eol,
}

/// An out-of-band action scheduled by the machine for the aux executor.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AuxCmd {
    /// The action to run.
    pub action: ActionKind,
    /// The stream on whose behalf the action runs.
    pub stream: StreamId,
    /// Correlation & targeting data echoed back in the action's outcome command.
    pub args: ActionArgs,
    /// The configuration to ship with the action.
    pub conf: StreamConf,
}

/// The only aux action tags.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ActionKind {
    StartWriter,
    StartReplica,
    Stop,
    DeleteMember,
    UpdateCatalog,
    UpdateRetention,
}

/// Correlation & targeting data carried by an aux action.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ActionArgs {
    /// The index of the command which scheduled the action; outcome commands echo it and
    /// the machine correlates them against `member.current`.
    pub index: u64,
    /// The stream epoch under which the action was scheduled.
    pub epoch: Epoch,
    /// The node targeted by the action.
    pub node: NodeId,
    /// The pid of the running writer, for actions which need it.
    pub leader_pid: Option<PeerHandle>,
}

/// Control signals delivered to the aux executor outside of the action path.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum AuxSignal {
    /// The machine gained leadership; stranded in-flight actions must be turned into
    /// explicit `action_failed` commands so the evaluator can reissue them.
    FailActiveActions { active: Vec<ActiveActions> },
    /// Reconcile runtime membership against the external cluster roster.
    MaybeResize,
}

/// Summary of one stream's outstanding actions, shipped with `FailActiveActions`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ActiveActions {
    /// The stream whose actions are summarized.
    pub stream: StreamId,
    /// The stream's current epoch.
    pub epoch: Epoch,
    /// One entry per member with an action in flight: `(node, index, action)`.
    pub members: Vec<(NodeId, u64, ActionKind)>,
    /// The in-flight catalog update, if any: the writer node and the recorded epoch.
    pub catalog_updating: Option<(NodeId, Epoch)>,
}
