//! Shared test fixtures.

use std::collections::BTreeMap;

use crate::core::Coordinator;
use crate::models::{AuxCmd, Command, Effect, NodeId, PeerHandle, RetentionSpec, StreamConf, StreamId};
use crate::runtime::{Meta, MACHINE_VERSION};

/// Build command metadata for the given log index.
pub fn meta(index: u64) -> Meta {
    Meta { index, system_time: 1_650_000_000_000 + index, machine_version: MACHINE_VERSION }
}

pub fn node(name: &str) -> NodeId {
    NodeId::from(name)
}

pub fn pid(name: &str) -> PeerHandle {
    PeerHandle::new(node(name))
}

/// Build an initial stream configuration over the given nodes.
pub fn conf(reference: &str, nodes: &[&str], leader: &str) -> StreamConf {
    StreamConf {
        reference: reference.into(),
        retention: RetentionSpec::default(),
        nodes: nodes.iter().map(|name| node(name)).collect(),
        leader_node: node(leader),
        replica_nodes: nodes.iter().filter(|name| **name != leader).map(|name| node(name)).collect(),
        epoch: 1,
    }
}

/// Extract the aux actions from an effect buffer.
pub fn aux_actions(effects: &[Effect]) -> Vec<AuxCmd> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::Aux(cmd) => Some(cmd.clone()),
            _ => None,
        })
        .collect()
}

/// Drive a fresh stream all the way to running: create it, confirm the writer start,
/// settle the catalog, then confirm every replica start. Returns the member pids.
///
/// Log indexes are consumed starting at `base_index`; the caller should continue from
/// `base_index + 10` to stay clear of them.
pub fn start_stream(machine: &mut Coordinator, reference: &str, nodes: &[&str], leader: &str, base_index: u64) -> BTreeMap<NodeId, PeerHandle> {
    let id = StreamId::from(reference);
    let (_reply, effects) = machine.apply(
        &meta(base_index),
        &Command::NewStream { id: id.clone(), conf: conf(reference, nodes, leader), reply_to: None },
    );
    let starts = aux_actions(&effects);
    assert!(starts.len() == 1, "expected exactly one writer start action, got {}", starts.len());

    let mut pids = BTreeMap::new();
    let writer_pid = pid(leader);
    let (_reply, effects) = machine.apply(
        &meta(base_index + 1),
        &Command::MemberStarted { id: id.clone(), node: node(leader), epoch: 1, index: base_index, pid: writer_pid.clone() },
    );
    pids.insert(node(leader), writer_pid);
    machine.apply(&meta(base_index + 2), &Command::CatalogUpdated { id: id.clone(), epoch: 1 });

    let mut next_index = base_index + 3;
    for action in aux_actions(&effects) {
        if !matches!(action.action, crate::models::ActionKind::StartReplica) {
            continue;
        }
        let replica_pid = PeerHandle::new(action.args.node.clone());
        machine.apply(
            &meta(next_index),
            &Command::MemberStarted {
                id: id.clone(),
                node: action.args.node.clone(),
                epoch: 1,
                index: action.args.index,
                pid: replica_pid.clone(),
            },
        );
        pids.insert(action.args.node.clone(), replica_pid);
        next_index += 1;
    }
    assert!(pids.len() == nodes.len(), "expected {} running members, got {}", nodes.len(), pids.len());
    pids
}
