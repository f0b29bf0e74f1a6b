//! Monitor registry.
//!
//! The coordinator tells the runtime which pids and nodes to watch; `down` and `nodeup`
//! events come back as commands. This registry records why each pid is watched so that
//! a `down` can be routed to the right handler.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::member::MemberState;
use crate::core::stream::StreamState;
use crate::models::{Effect, MonitorTarget, PeerHandle, StreamId};

/// Why a pid is being watched.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum MonitorPurpose {
    /// The pid is a stream member process.
    StreamMember(StreamId),
    /// The pid is a listener registered against the given streams.
    Listener(BTreeSet<StreamId>),
    /// The pid belongs to the Single-Active-Consumer sub-machine.
    Sac,
}

/// Ensure every running member pid of the stream is monitored, emitting monitor effects
/// for any which are not yet tracked.
pub(super) fn ensure_member_monitors(stream: &StreamState, monitors: &mut BTreeMap<PeerHandle, MonitorPurpose>, effects: &mut Vec<Effect>) {
    for member in stream.members.values() {
        if let MemberState::Running(_, pid) = &member.state {
            if !monitors.contains_key(pid) {
                effects.push(Effect::Monitor(MonitorTarget::Process(pid.clone())));
                effects.push(Effect::Monitor(MonitorTarget::Node(pid.node().clone())));
                monitors.insert(pid.clone(), MonitorPurpose::StreamMember(stream.id.clone()));
            }
        }
    }
}

/// Record a listener pid, emitting its monitor effect on first sight.
pub(super) fn track_listener(pid: &PeerHandle, stream: &StreamId, monitors: &mut BTreeMap<PeerHandle, MonitorPurpose>, effects: &mut Vec<Effect>) {
    match monitors.get_mut(pid) {
        Some(MonitorPurpose::Listener(streams)) => {
            streams.insert(stream.clone());
        }
        Some(_) => (),
        None => {
            effects.push(Effect::Monitor(MonitorTarget::Process(pid.clone())));
            let mut streams = BTreeSet::new();
            streams.insert(stream.clone());
            monitors.insert(pid.clone(), MonitorPurpose::Listener(streams));
        }
    }
}

/// Drop all monitor records tied to a destroyed stream.
pub(super) fn purge_stream(stream: &StreamId, monitors: &mut BTreeMap<PeerHandle, MonitorPurpose>) {
    monitors.retain(|_, purpose| match purpose {
        MonitorPurpose::StreamMember(id) => id != stream,
        MonitorPurpose::Listener(streams) => {
            streams.remove(stream);
            !streams.is_empty()
        }
        MonitorPurpose::Sac => true,
    });
}
