//! Machine version migrations.
//!
//! A `machine_version(from, to)` command applies one migration per integer step in
//! `[from, to)`, in order, mutating the state in place. Steps with no registered
//! migration are logged and skipped.

use crate::core::listeners::{ListenerKey, ListenerPayload};
use crate::core::monitors::MonitorPurpose;
use crate::core::sac::SacState;
use crate::core::Coordinator;
use crate::models::{Effect, ListenerKind, MonitorTarget};

/// Apply all migrations for the version steps in `[from, to)`.
pub(super) fn migrate(machine: &mut Coordinator, from: u32, to: u32, effects: &mut Vec<Effect>) {
    for step in from..to {
        match step {
            1 => migrate_listeners_v1(machine, effects),
            2 => machine.sac = SacState::default(),
            other => tracing::warn!(step = other, "no migration registered for machine version step"),
        }
    }
    if to > machine.version {
        machine.version = to;
    }
    tracing::info!(from, to, "machine version migrations applied");
}

/// v1 → v2: listener storage moves from `pid → leader_pid` per stream to the keyed
/// `(pid, kind) → payload` map. The v1 machine did not monitor listener pids, so a
/// monitor effect is emitted for every pid not already tracked.
fn migrate_listeners_v1(machine: &mut Coordinator, effects: &mut Vec<Effect>) {
    for stream in machine.streams.values_mut() {
        let legacy = std::mem::take(&mut stream.listeners_v1);
        for (pid, last) in legacy {
            stream
                .listeners
                .insert(ListenerKey { pid: pid.clone(), kind: ListenerKind::Leader }, ListenerPayload::Leader { last: Some(last) });
            if !machine.monitors.contains_key(&pid) {
                effects.push(Effect::Monitor(MonitorTarget::Process(pid.clone())));
                let mut streams = std::collections::BTreeSet::new();
                streams.insert(stream.id.clone());
                machine.monitors.insert(pid, MonitorPurpose::Listener(streams));
            } else if let Some(MonitorPurpose::Listener(streams)) = machine.monitors.get_mut(&pid) {
                streams.insert(stream.id.clone());
            }
        }
    }
}
