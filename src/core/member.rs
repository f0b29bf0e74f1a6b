//! Member state & transitions.
//!
//! A member is one replica's desired and observed state on one node for one stream. Its
//! observed `state` only ever changes when a command is applied (aux confirmations,
//! monitor events); its desired `target` is what the evaluator reconciles against.

use serde::{Deserialize, Serialize};

use crate::models::{Epoch, NodeId, PeerHandle, RoleKind, StreamConf, Tail};

/// The role a member plays within its stream at a given epoch.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Role {
    pub kind: RoleKind,
    pub epoch: Epoch,
}

/// Observed state of a member.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum MemberState {
    /// Constructed but not yet started in this epoch.
    Ready(Epoch),
    /// Process alive and serving.
    Running(Epoch, PeerHandle),
    /// Gracefully stopped in the given epoch, tail reported.
    Stopped(Epoch, Tail),
    /// Node unreachable; the last-known pid is retained.
    Disconnected(Epoch, PeerHandle),
    /// Process known dead.
    Down(Epoch),
    /// Terminal; the member is awaiting removal.
    Deleted,
}

impl MemberState {
    /// The epoch recorded in this state, if any.
    pub fn epoch(&self) -> Option<Epoch> {
        match self {
            Self::Ready(epoch) | Self::Down(epoch) => Some(*epoch),
            Self::Running(epoch, _) | Self::Stopped(epoch, _) | Self::Disconnected(epoch, _) => Some(*epoch),
            Self::Deleted => None,
        }
    }
}

/// Desired state of a member.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum MemberTarget {
    Running,
    Stopped,
    Deleted,
}

/// Tag of the aux action currently in flight for a member.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ActionTag {
    Starting,
    Stopping,
    Deleting,
    UpdatingRetention,
    /// No action in flight; the member is parked until its node comes back.
    Sleeping,
}

/// The aux action currently in flight for a member, tagged with the index of the
/// command which scheduled it.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CurrentAction {
    pub tag: ActionTag,
    pub index: u64,
}

/// One replica's desired and observed state on one node for one stream.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Member {
    /// The node hosting this member.
    pub node: NodeId,
    /// The member's role at its epoch.
    pub role: Role,
    /// Observed state.
    pub state: MemberState,
    /// Desired state.
    pub target: MemberTarget,
    /// At most one in-flight aux action.
    pub current: Option<CurrentAction>,
    /// The configuration snapshot last shipped to this member.
    pub conf: StreamConf,
}

impl Member {
    /// Create a new member in `ready` state at the given epoch.
    pub fn new(node: NodeId, kind: RoleKind, epoch: Epoch, target: MemberTarget, conf: StreamConf) -> Self {
        Self {
            node,
            role: Role { kind, epoch },
            state: MemberState::Ready(epoch),
            target,
            current: None,
            conf,
        }
    }

    pub fn is_writer(&self) -> bool {
        matches!(self.role.kind, RoleKind::Writer)
    }

    /// The member's pid if it is running.
    pub fn running_pid(&self) -> Option<&PeerHandle> {
        match &self.state {
            MemberState::Running(_, pid) => Some(pid),
            _ => None,
        }
    }

    /// The pid through which this member is currently observed, running or not.
    pub fn observed_pid(&self) -> Option<&PeerHandle> {
        match &self.state {
            MemberState::Running(_, pid) | MemberState::Disconnected(_, pid) => Some(pid),
            _ => None,
        }
    }

    /// Whether the member has confirmed a stop in the given epoch.
    pub fn is_stopped_at(&self, epoch: Epoch) -> bool {
        matches!(&self.state, MemberState::Stopped(stopped_epoch, _) if *stopped_epoch == epoch)
    }

    /// Whether the member is considered part of the stream going forward.
    pub fn is_live(&self) -> bool {
        !matches!(self.target, MemberTarget::Deleted) && !matches!(self.state, MemberState::Deleted)
    }

    /// Update the member's desired state. Deletion is terminal: once targeted for
    /// deletion a member can never be retargeted.
    pub fn retarget(&mut self, target: MemberTarget) {
        if matches!(self.target, MemberTarget::Deleted) {
            return;
        }
        self.target = target;
    }

    /// Record an in-flight aux action for this member.
    pub fn set_current(&mut self, tag: ActionTag, index: u64) {
        self.current = Some(CurrentAction { tag, index });
    }

    /// Whether the in-flight action carries the given tag and index.
    pub fn current_matches(&self, tag: ActionTag, index: u64) -> bool {
        matches!(&self.current, Some(current) if current.tag == tag && current.index == index)
    }
}
