use anyhow::Result;

use super::listeners::{ListenerKey, ListenerPayload};
use super::monitors::MonitorPurpose;
use super::stream::StreamState;
use super::Coordinator;
use crate::fixtures::{conf, meta, node, pid};
use crate::models::{Command, Effect, ListenerKind, MonitorTarget, StreamId};

#[test]
fn v1_listener_storage_is_rewritten_and_monitored() -> Result<()> {
    let mut machine = Coordinator::new();
    machine.version = 1;
    let id = StreamId::from("orders");
    let mut stream = StreamState::new(id.clone(), &conf("orders", &["n1", "n2", "n3"], "n1"), None);
    let listener = pid("consumer-0");
    let last_leader = pid("n1");
    stream.listeners_v1.insert(listener.clone(), last_leader.clone());
    machine.streams.insert(id.clone(), stream);

    let (_reply, effects) = machine.apply(&meta(100), &Command::MachineVersion { from: 1, to: 3 });

    let stream = machine.streams.get(&id).unwrap();
    assert!(stream.listeners_v1.is_empty(), "the legacy listener map is drained");
    let payload = stream
        .listeners
        .get(&ListenerKey { pid: listener.clone(), kind: ListenerKind::Leader })
        .expect("expected the listener under its new key");
    assert_eq!(payload, &ListenerPayload::Leader { last: Some(last_leader) }, "the last notified pid survives the rewrite");

    assert!(
        effects.iter().any(|effect| matches!(effect, Effect::Monitor(MonitorTarget::Process(p)) if *p == listener)),
        "v1 never monitored listener pids, so the migration emits the monitor"
    );
    match machine.monitors.get(&listener) {
        Some(MonitorPurpose::Listener(streams)) => assert!(streams.contains(&id)),
        other => panic!("expected a listener monitor record, got {:?}", other),
    }
    assert_eq!(machine.version, 3);
    Ok(())
}

#[test]
fn sac_state_is_added_at_v3() -> Result<()> {
    let mut machine = Coordinator::new();
    machine.version = 2;
    machine.apply(&meta(100), &Command::MachineVersion { from: 2, to: 3 });
    assert_eq!(machine.sac, crate::core::sac::SacState::default());
    assert_eq!(machine.version, 3);
    Ok(())
}

#[test]
fn unknown_steps_are_skipped() -> Result<()> {
    let mut machine = Coordinator::new();
    machine.version = 0;
    let before_streams = machine.streams.clone();
    machine.apply(&meta(100), &Command::MachineVersion { from: 0, to: 1 });
    assert_eq!(machine.streams, before_streams, "steps with no registered migration change nothing");
    assert_eq!(machine.version, 1);
    Ok(())
}
