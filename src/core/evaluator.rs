//! Side-effect evaluation.
//!
//! `evaluate_stream` compares each member's desired state against its observed state
//! and schedules the aux actions needed to close the gap, recording every scheduled
//! action in `member.current`. It is idempotent: re-invocation with identical state
//! emits nothing new, since every rule is gated on `current = none` or an equivalent
//! in-state marker. Retries are not performed here; a failed action clears its marker
//! through an `action_failed` command and the next evaluation reissues it.

use crate::core::member::{ActionTag, MemberState, MemberTarget};
use crate::core::stream::{CatalogPhase, StreamState};
use crate::models::{ActionArgs, ActionKind, AuxCmd, Effect, NodeId, PeerHandle, StreamConf, StreamId};
use crate::runtime::Meta;

/// Evaluate the stream, emitting aux actions for every divergence between desired and
/// observed member state.
pub(super) fn evaluate_stream(meta: &Meta, stream: &mut StreamState, effects: &mut Vec<Effect>) {
    let shipped = stream.shipped_conf();
    let writer_node = stream.members.values().find(|member| member.is_writer()).map(|member| member.node.clone());
    let mut leader_pid = None;
    if let Some(node) = &writer_node {
        evaluate_writer(meta, stream, node, &shipped, effects);
        leader_pid = stream.members.get(node).and_then(|member| member.running_pid().cloned());
    }
    let replica_nodes: Vec<NodeId> = stream.members.keys().filter(|node| Some(*node) != writer_node.as_ref()).cloned().collect();
    for node in replica_nodes {
        evaluate_replica(meta, stream, &node, leader_pid.as_ref(), &shipped, effects);
    }
    eval_retention(meta, stream, effects);
}

/// The action scheduled for one member by a single evaluation pass.
enum Scheduled {
    Delete,
    Stop,
    Start(u64),
    Nothing,
}

/// Evaluate the stream's writer member. Rules are checked in order; the first match
/// schedules its action and ends the pass for this member.
fn evaluate_writer(meta: &Meta, stream: &mut StreamState, node: &NodeId, shipped: &StreamConf, effects: &mut Vec<Effect>) {
    let epoch = stream.epoch;
    let stream_id = stream.id.clone();
    let mut running_pid: Option<PeerHandle> = None;
    let mut scheduled = Scheduled::Nothing;
    if let Some(member) = stream.members.get(node) {
        let idle = member.current.is_none();
        scheduled = match (&member.state, member.target) {
            (state, MemberTarget::Deleted) if idle && !matches!(state, MemberState::Deleted) => Scheduled::Delete,
            (MemberState::Down(_), MemberTarget::Stopped) if idle => Scheduled::Stop,
            (MemberState::Ready(ready_epoch), MemberTarget::Running) if idle => Scheduled::Start(*ready_epoch),
            (MemberState::Running(_, pid), MemberTarget::Running) => {
                running_pid = Some(pid.clone());
                Scheduled::Nothing
            }
            (state, MemberTarget::Stopped) if idle && !member.is_stopped_at(epoch) && !matches!(state, MemberState::Deleted) => Scheduled::Stop,
            _ => Scheduled::Nothing,
        };
    }
    match scheduled {
        Scheduled::Delete => {
            effects.push(aux(ActionKind::DeleteMember, &stream_id, meta.index, epoch, node, None, shipped));
            if let Some(member) = stream.members.get_mut(node) {
                member.set_current(ActionTag::Deleting, meta.index);
            }
        }
        Scheduled::Stop => {
            effects.push(aux(ActionKind::Stop, &stream_id, meta.index, epoch, node, None, shipped));
            if let Some(member) = stream.members.get_mut(node) {
                member.set_current(ActionTag::Stopping, meta.index);
            }
        }
        Scheduled::Start(ready_epoch) => {
            effects.push(aux(ActionKind::StartWriter, &stream_id, meta.index, ready_epoch, node, None, shipped));
            if let Some(member) = stream.members.get_mut(node) {
                member.set_current(ActionTag::Starting, meta.index);
                member.conf = shipped.clone();
            }
        }
        Scheduled::Nothing => (),
    }
    let pid = match running_pid {
        Some(pid) => pid,
        None => return,
    };
    // The writer is up: publish it to the catalog if this epoch has not been published
    // yet, and answer the originator of the stream if it is still waiting.
    if matches!(stream.catalog.phase, CatalogPhase::Updated) && stream.catalog.epoch < epoch {
        effects.push(aux(ActionKind::UpdateCatalog, &stream_id, meta.index, epoch, node, Some(pid.clone()), shipped));
        stream.catalog.phase = CatalogPhase::Updating;
    }
    if let Some(to) = stream.reply_to.take() {
        effects.push(Effect::Reply { to, result: Ok(pid) });
    }
}

/// Evaluate one replica member relative to the current writer state.
fn evaluate_replica(
    meta: &Meta, stream: &mut StreamState, node: &NodeId, leader_pid: Option<&PeerHandle>, shipped: &StreamConf, effects: &mut Vec<Effect>,
) {
    let epoch = stream.epoch;
    let stream_id = stream.id.clone();
    let mut scheduled = Scheduled::Nothing;
    if let Some(member) = stream.members.get(node) {
        if member.current.is_some() {
            return;
        }
        scheduled = match (&member.state, member.target) {
            (state, MemberTarget::Stopped) if !member.is_stopped_at(epoch) && !matches!(state, MemberState::Deleted) => Scheduled::Stop,
            (state, MemberTarget::Deleted) if !matches!(state, MemberState::Deleted) => Scheduled::Delete,
            (MemberState::Ready(member_epoch), MemberTarget::Running) | (MemberState::Down(member_epoch), MemberTarget::Running)
                if *member_epoch == epoch && leader_pid.is_some() =>
            {
                Scheduled::Start(epoch)
            }
            _ => Scheduled::Nothing,
        };
    }
    match scheduled {
        Scheduled::Stop => {
            effects.push(aux(ActionKind::Stop, &stream_id, meta.index, epoch, node, None, shipped));
            if let Some(member) = stream.members.get_mut(node) {
                member.set_current(ActionTag::Stopping, meta.index);
            }
        }
        Scheduled::Delete => {
            effects.push(aux(ActionKind::DeleteMember, &stream_id, meta.index, epoch, node, None, shipped));
            if let Some(member) = stream.members.get_mut(node) {
                member.set_current(ActionTag::Deleting, meta.index);
            }
        }
        Scheduled::Start(epoch) => {
            effects.push(aux(ActionKind::StartReplica, &stream_id, meta.index, epoch, node, leader_pid.cloned(), shipped));
            if let Some(member) = stream.members.get_mut(node) {
                member.set_current(ActionTag::Starting, meta.index);
                member.conf = shipped.clone();
            }
        }
        Scheduled::Nothing => (),
    }
}

/// Ship the current retention configuration to every running member still carrying an
/// older one.
fn eval_retention(meta: &Meta, stream: &mut StreamState, effects: &mut Vec<Effect>) {
    let epoch = stream.epoch;
    let stream_id = stream.id.clone();
    let retention = stream.conf.retention.clone();
    let shipped = stream.shipped_conf();
    for member in stream.members.values_mut() {
        let running = matches!(&member.state, MemberState::Running(..));
        if running && member.current.is_none() && member.conf.retention != retention {
            let node = member.node.clone();
            effects.push(aux(ActionKind::UpdateRetention, &stream_id, meta.index, epoch, &node, None, &shipped));
            member.set_current(ActionTag::UpdatingRetention, meta.index);
        }
    }
}

fn aux(action: ActionKind, stream: &StreamId, index: u64, epoch: u64, node: &NodeId, leader_pid: Option<PeerHandle>, conf: &StreamConf) -> Effect {
    Effect::Aux(AuxCmd {
        action,
        stream: stream.clone(),
        args: ActionArgs { index, epoch, node: node.clone(), leader_pid },
        conf: conf.clone(),
    })
}
