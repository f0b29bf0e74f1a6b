//! Stream state & transitions.
//!
//! ## Epochs & elections
//! Every stream progresses through monotonically increasing epochs, each with exactly
//! one writer. An epoch change is driven by stopping members: once a quorum of members
//! has confirmed a stop in the current epoch, a new writer is selected from their
//! reported tails and every surviving member is re-seated as `ready` in the next epoch.
//! The whole election happens within a single applied command, so no replica ever
//! observes a half-elected stream.
//!
//! All transitions here are pure; the dispatcher catches any error and keeps the
//! pre-command stream unchanged.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::core::listeners::{ListenerKey, ListenerPayload};
use crate::core::member::{ActionTag, CurrentAction, Member, MemberState, MemberTarget, Role};
use crate::error::CoordinatorError;
use crate::models::{ActionKind, Command, DownReason, Epoch, NodeId, PeerHandle, Reply, ReplyAddress, RoleKind, StreamConf, StreamId, Tail};
use crate::runtime::Meta;

/// Desired state of a stream.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum StreamTarget {
    Running,
    Deleted,
}

/// Publication state of the stream's writer in the external catalog.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CatalogState {
    pub phase: CatalogPhase,
    /// The last epoch whose writer was published (or is being published).
    pub epoch: Epoch,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum CatalogPhase {
    Updated,
    Updating,
}

/// The replicated state of one stream.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StreamState {
    /// Unique identity of the stream.
    pub id: StreamId,
    /// The stream's current epoch.
    pub epoch: Epoch,
    /// The ordered set of nodes which should host a member.
    pub nodes: Vec<NodeId>,
    /// All members of the stream, keyed by node.
    pub members: BTreeMap<NodeId, Member>,
    /// The name under which listener notifications are delivered.
    pub queue_ref: String,
    /// The stream's configuration; immutable per epoch, rewritten into shipped copies.
    pub conf: StreamConf,
    /// Desired state of the stream as a whole.
    pub target: StreamTarget,
    /// Set iff the originating command must be answered once the writer is running.
    pub reply_to: Option<ReplyAddress>,
    /// Publication state of the writer in the external catalog.
    pub catalog: CatalogState,
    /// Registered listeners, keyed by `(pid, kind)`.
    pub listeners: BTreeMap<ListenerKey, ListenerPayload>,
    /// Legacy v1 listener storage (`pid → last leader pid`); only ever populated by old
    /// snapshots, drained by the v1→v2 migration.
    #[serde(default)]
    pub listeners_v1: BTreeMap<PeerHandle, PeerHandle>,
}

impl StreamState {
    /// Build a new stream in epoch 1 from its initial configuration, with the writer
    /// pre-chosen on `conf.leader_node`.
    pub fn new(id: StreamId, conf: &StreamConf, reply_to: Option<ReplyAddress>) -> Self {
        let mut members = BTreeMap::new();
        for node in &conf.nodes {
            let kind = if node == &conf.leader_node { RoleKind::Writer } else { RoleKind::Replica };
            members.insert(node.clone(), Member::new(node.clone(), kind, 1, MemberTarget::Running, conf.clone()));
        }
        Self {
            id,
            epoch: 1,
            nodes: conf.nodes.clone(),
            members,
            queue_ref: conf.reference.clone(),
            conf: conf.clone(),
            target: StreamTarget::Running,
            reply_to,
            catalog: CatalogState { phase: CatalogPhase::Updated, epoch: 0 },
            listeners: BTreeMap::new(),
            listeners_v1: BTreeMap::new(),
        }
    }

    /// The stream's configuration as shipped to members: leader, replicas, nodes and
    /// epoch rewritten to the current stream values.
    pub fn shipped_conf(&self) -> StreamConf {
        let leader_node = self
            .members
            .values()
            .find(|member| member.is_writer())
            .map(|member| member.node.clone())
            .unwrap_or_else(|| self.conf.leader_node.clone());
        let replica_nodes = self.nodes.iter().filter(|node| **node != leader_node).cloned().collect();
        StreamConf {
            reference: self.conf.reference.clone(),
            retention: self.conf.retention.clone(),
            nodes: self.nodes.clone(),
            leader_node,
            replica_nodes,
            epoch: self.epoch,
        }
    }

    /// The stream's writer member, if one exists.
    pub fn writer(&self) -> Option<&Member> {
        self.members.values().find(|member| member.is_writer())
    }

    /// Whether a writer exists for the current epoch in `ready`/`running` state with a
    /// `running` target.
    pub fn has_active_writer(&self) -> bool {
        self.members.values().any(|member| {
            member.is_writer()
                && matches!(member.target, MemberTarget::Running)
                && matches!(&member.state,
                    MemberState::Ready(epoch) | MemberState::Running(epoch, _) if *epoch == self.epoch)
        })
    }

    /// Mark the whole stream for deletion.
    fn begin_delete(&mut self) {
        for member in self.members.values_mut() {
            member.retarget(MemberTarget::Deleted);
        }
        self.target = StreamTarget::Deleted;
        self.reply_to = None;
    }

    /// Flip every `running` target to `stopped`, forcing a full stop & elect cycle.
    fn force_cycle(&mut self) {
        for member in self.members.values_mut() {
            if matches!(member.target, MemberTarget::Running) {
                member.retarget(MemberTarget::Stopped);
            }
        }
    }

    /// Add a new replica member on the given node.
    ///
    /// The new member joins with `target = stopped` and every running member is cycled,
    /// so that a full stop & elect round seats the replica at a well-defined tail.
    fn add_replica(&mut self, node: &NodeId) {
        if self.members.contains_key(node) {
            return;
        }
        self.force_cycle();
        self.members
            .insert(node.clone(), Member::new(node.clone(), RoleKind::Replica, self.epoch, MemberTarget::Stopped, self.conf.clone()));
        if !self.nodes.contains(node) {
            self.nodes.push(node.clone());
        }
    }

    /// Mark the member on the given node for deletion, refusing when that would leave
    /// the stream with fewer than two live members.
    fn delete_replica(&mut self, node: &NodeId) -> Reply {
        if !self.members.contains_key(node) {
            return Reply::Error(CoordinatorError::NotFound);
        }
        let live = self.members.values().filter(|member| member.is_live()).count();
        let target_is_live = self.members.get(node).map(|member| member.is_live()).unwrap_or(false);
        if target_is_live && live.saturating_sub(1) < 2 {
            return Reply::Error(CoordinatorError::LastStreamMember);
        }
        self.force_cycle();
        if let Some(member) = self.members.get_mut(node) {
            member.retarget(MemberTarget::Deleted);
        }
        Reply::Ok
    }

    /// Confirm a member start at a matching `(epoch, index)`.
    fn member_started(&mut self, node: &NodeId, epoch: Epoch, index: u64, pid: &PeerHandle) {
        let member = match self.members.get_mut(node) {
            Some(member) => member,
            None => return,
        };
        let accept = member.current_matches(ActionTag::Starting, index)
            && matches!(&member.state, MemberState::Ready(ready_epoch) if *ready_epoch == epoch)
            && pid.node() == node;
        if !accept {
            tracing::debug!(stream = %self.id, node = %node, index, epoch, "ignoring stale member_started confirmation");
            return;
        }
        member.state = MemberState::Running(epoch, pid.clone());
        member.current = None;
    }

    /// Confirm a member stop, possibly triggering an election.
    fn member_stopped(&mut self, meta: &Meta, node: &NodeId, epoch: Epoch, index: u64, tail: Tail) -> Result<()> {
        if let Some((tail_epoch, _)) = tail {
            if tail_epoch > self.epoch {
                bail!("member on {} reported tail epoch {} beyond stream epoch {}", node, tail_epoch, self.epoch);
            }
        }
        let stream_epoch = self.epoch;
        let stream_target = self.target;
        let member = match self.members.get_mut(node) {
            Some(member) => member,
            None => return Ok(()),
        };
        if !member.current_matches(ActionTag::Stopping, index) {
            tracing::debug!(stream = %self.id, node = %node, index, epoch, "ignoring stale member_stopped confirmation");
            return Ok(());
        }
        member.state = MemberState::Stopped(epoch, tail);
        member.current = None;
        if epoch != stream_epoch {
            // Stopped in an older epoch; the target is left as-is so the evaluator
            // reissues the stop for the current epoch.
            return Ok(());
        }
        let deleting = matches!(stream_target, StreamTarget::Deleted);
        member.retarget(if deleting { MemberTarget::Deleted } else { MemberTarget::Running });
        let is_writer = member.is_writer();
        if !is_writer && self.has_active_writer() {
            // A writer is already seated for this epoch; the straggler re-joins it
            // directly instead of waiting on another election.
            if let Some(member) = self.members.get_mut(node) {
                member.state = MemberState::Ready(stream_epoch);
                member.role = Role { kind: RoleKind::Replica, epoch: stream_epoch };
            }
            return Ok(());
        }
        self.maybe_elect(meta);
        Ok(())
    }

    /// Run an election once a quorum of members has stopped in the current epoch.
    fn maybe_elect(&mut self, meta: &Meta) {
        let candidates: Vec<(NodeId, Tail)> = self
            .members
            .values()
            .filter(|member| matches!(member.target, MemberTarget::Running) && member.is_stopped_at(self.epoch))
            .map(|member| match &member.state {
                MemberState::Stopped(_, tail) => (member.node.clone(), *tail),
                _ => (member.node.clone(), None),
            })
            .collect();
        if candidates.len() < quorum(self.nodes.len()) {
            return;
        }
        let leader = match select_leader(meta.machine_version, &candidates) {
            Some(leader) => leader,
            None => return,
        };
        let next = self.epoch + 1;
        self.epoch = next;
        for member in self.members.values_mut() {
            if !member.is_live() {
                continue;
            }
            let kind = if member.node == leader { RoleKind::Writer } else { RoleKind::Replica };
            member.role = Role { kind, epoch: next };
            member.state = MemberState::Ready(next);
        }
        tracing::debug!(stream = %self.id, epoch = next, leader = %leader, "elected new stream writer");
    }

    /// Remove a deleted member; returns `true` when the stream has no members left.
    fn member_deleted(&mut self, node: &NodeId) -> bool {
        self.members.remove(node);
        self.nodes.retain(|existing| existing != node);
        self.members.is_empty()
    }

    /// Confirm delivery of the current retention configuration to a member.
    fn retention_updated(&mut self, node: &NodeId) {
        let shipped = self.shipped_conf();
        if let Some(member) = self.members.get_mut(node) {
            if matches!(&member.current, Some(CurrentAction { tag: ActionTag::UpdatingRetention, .. })) {
                member.current = None;
            }
            member.conf = shipped;
        }
    }

    /// Handle an aux failure report for an action scheduled at `index`.
    fn action_failed(&mut self, node: &NodeId, index: u64, action: ActionKind) {
        if matches!(action, ActionKind::UpdateCatalog) {
            // Reset the publication phase so the evaluator reissues the update.
            if matches!(self.catalog.phase, CatalogPhase::Updating) {
                self.catalog.phase = CatalogPhase::Updated;
            }
            return;
        }
        let member = match self.members.get_mut(node) {
            Some(member) => member,
            None => return,
        };
        let current = match &member.current {
            Some(current) if current.index == index => *current,
            _ => return,
        };
        let writer_start_failed = member.is_writer() && current.tag == ActionTag::Starting && matches!(&member.state, MemberState::Ready(_));
        if matches!(&member.state, MemberState::Disconnected(..)) {
            // Retrying against an unreachable node would spin; park the member until
            // its node is reported back up.
            member.current = Some(CurrentAction { tag: ActionTag::Sleeping, index });
        } else {
            member.current = None;
        }
        if writer_start_failed {
            self.force_cycle();
        }
    }

    /// Handle a `down` report for the given pid.
    fn member_down(&mut self, pid: &PeerHandle, reason: &DownReason) {
        let node = match self
            .members
            .values()
            .find(|member| member.observed_pid() == Some(pid))
            .map(|member| member.node.clone())
        {
            Some(node) => node,
            None => return,
        };
        let mut writer_down = false;
        if let Some(member) = self.members.get_mut(&node) {
            let epoch = member.state.epoch().unwrap_or(self.epoch);
            if member.is_writer() {
                member.state = MemberState::Down(epoch);
                writer_down = true;
            } else if matches!(reason, DownReason::Noconnection) {
                member.state = MemberState::Disconnected(epoch, pid.clone());
            } else {
                member.state = MemberState::Down(epoch);
            }
        }
        if writer_down {
            self.force_cycle();
        }
    }

    /// Handle a node becoming reachable again: wake any parked member on that node and
    /// report the pids which need re-monitoring.
    pub(super) fn node_up(&mut self, node: &NodeId) -> (bool, Option<PeerHandle>) {
        let mut woke = false;
        let mut remonitor = None;
        if let Some(member) = self.members.get_mut(node) {
            if matches!(&member.current, Some(CurrentAction { tag: ActionTag::Sleeping, .. })) {
                member.current = None;
                woke = true;
            }
            if let MemberState::Disconnected(_, pid) = &member.state {
                remonitor = Some(pid.clone());
            }
        }
        (woke, remonitor)
    }
}

/// Apply a stream-scoped command, returning the updated stream (or `None` when the
/// stream is destroyed) along with the synchronous reply.
pub(super) fn update_stream(meta: &Meta, cmd: &Command, stream: &StreamState) -> Result<(Option<StreamState>, Reply)> {
    let mut stream = stream.clone();
    let reply = match cmd {
        // Re-creating an existing stream is a no-op; the original reply path has
        // already fired or is still pending.
        Command::NewStream { .. } => Reply::Ok,
        Command::DeleteStream { .. } => {
            stream.begin_delete();
            Reply::Ok
        }
        Command::AddReplica { node, .. } => {
            stream.add_replica(node);
            Reply::Ok
        }
        Command::DeleteReplica { node, .. } => stream.delete_replica(node),
        Command::PolicyChanged { conf, .. } => {
            stream.conf = conf.clone();
            Reply::Ok
        }
        Command::MemberStarted { node, epoch, index, pid, .. } => {
            stream.member_started(node, *epoch, *index, pid);
            Reply::Ok
        }
        Command::MemberStopped { node, epoch, index, tail, .. } => {
            stream.member_stopped(meta, node, *epoch, *index, *tail)?;
            Reply::Ok
        }
        Command::MemberDeleted { node, .. } => {
            if stream.member_deleted(node) {
                return Ok((None, Reply::Ok));
            }
            Reply::Ok
        }
        Command::RetentionUpdated { node, .. } => {
            stream.retention_updated(node);
            Reply::Ok
        }
        Command::CatalogUpdated { epoch, .. } => {
            stream.catalog = CatalogState { phase: CatalogPhase::Updated, epoch: *epoch };
            Reply::Ok
        }
        Command::ActionFailed { node, index, action, .. } => {
            stream.action_failed(node, *index, *action);
            Reply::Ok
        }
        Command::Down { pid, reason } => {
            stream.member_down(pid, reason);
            Reply::Ok
        }
        _ => Reply::Ok,
    };
    Ok((Some(stream), reply))
}

/// The quorum size for a membership of `n` nodes: strictly more than half, and 1 when
/// the stream has a single node.
pub fn quorum(n: usize) -> usize {
    n / 2 + 1
}

/// Select the next writer from the stopped members' `(node, tail)` pairs.
///
/// The corrected comparator orders by tail epoch, then offset, both descending, with
/// empty tails last and node order as the final tie break. Machine version 0 selects
/// the legacy comparator, which is kept verbatim so that replaying old logs yields the
/// exact states they produced: it compares offsets alone and ranks an empty tail ahead
/// of any recorded tail.
pub fn select_leader(machine_version: u32, candidates: &[(NodeId, Tail)]) -> Option<NodeId> {
    let mut candidates = candidates.to_vec();
    if machine_version == 0 {
        candidates.sort_by(|a, b| match (a.1, b.1) {
            (None, None) => a.0.cmp(&b.0),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some((_, offset_a)), Some((_, offset_b))) => offset_b.cmp(&offset_a).then_with(|| a.0.cmp(&b.0)),
        });
    } else {
        candidates.sort_by(|a, b| match (a.1, b.1) {
            (None, None) => a.0.cmp(&b.0),
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some((epoch_a, offset_a)), Some((epoch_b, offset_b))) => {
                epoch_b.cmp(&epoch_a).then_with(|| offset_b.cmp(&offset_a)).then_with(|| a.0.cmp(&b.0))
            }
        });
    }
    candidates.first().map(|(node, _)| node.clone())
}
