use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};

use super::*;
use crate::fixtures::{conf, node};
use crate::models::{ActionArgs, AuxCmd};

/// A log-process client which fails for the configured nodes and stalls forever for
/// nodes named `slow`.
struct MockLog {
    fail_nodes: Vec<NodeId>,
}

#[async_trait]
impl LogProcessClient for MockLog {
    async fn start_writer(&self, _stream: &StreamId, _conf: &StreamConf, node: &NodeId) -> Result<PeerHandle> {
        self.respond(node).await
    }
    async fn start_replica(&self, _stream: &StreamId, _conf: &StreamConf, node: &NodeId, _leader: &PeerHandle) -> Result<PeerHandle> {
        self.respond(node).await
    }
    async fn stop(&self, _stream: &StreamId, _conf: &StreamConf, node: &NodeId, epoch: Epoch) -> Result<Tail> {
        if self.fail_nodes.contains(node) {
            bail!("node_down")
        }
        Ok(Some((epoch, 42)))
    }
    async fn delete_member(&self, _stream: &StreamId, node: &NodeId) -> Result<()> {
        self.respond(node).await.map(|_| ())
    }
    async fn update_retention(&self, _stream: &StreamId, _conf: &StreamConf, node: &NodeId) -> Result<()> {
        self.respond(node).await.map(|_| ())
    }
    async fn replication_state(&self, _pid: &PeerHandle) -> Result<BTreeMap<NodeId, (u64, u64)>> {
        bail!("not used in aux tests")
    }
    async fn is_alive(&self, _pid: &PeerHandle) -> Result<bool> {
        Ok(true)
    }
}

impl MockLog {
    async fn respond(&self, target: &NodeId) -> Result<PeerHandle> {
        if target.as_str() == "slow" {
            tokio::time::sleep(Duration::from_secs(120)).await;
        }
        if self.fail_nodes.contains(target) {
            bail!("node_down")
        }
        Ok(PeerHandle::new(target.clone()))
    }
}

struct MockCatalog;

#[async_trait]
impl CatalogClient for MockCatalog {
    async fn publish_writer(&self, _stream: &StreamId, _conf: &StreamConf, _epoch: Epoch, _writer: &PeerHandle) -> Result<()> {
        Ok(())
    }
}

struct MockSink {
    tx: mpsc::Sender<Command>,
}

#[async_trait]
impl CommandSink for MockSink {
    async fn inject(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| anyhow::anyhow!("sink closed"))
    }
}

struct MockRoster {
    nodes: Vec<NodeId>,
}

#[async_trait]
impl ClusterRoster for MockRoster {
    async fn nodes(&self) -> Result<Vec<NodeId>> {
        Ok(self.nodes.clone())
    }
}

struct MockMembership {
    members: Vec<NodeId>,
    added: Mutex<Vec<NodeId>>,
    removed: Mutex<Vec<NodeId>>,
}

#[async_trait]
impl RuntimeMembership for MockMembership {
    async fn members(&self) -> Result<Vec<NodeId>> {
        Ok(self.members.clone())
    }
    async fn add_member(&self, node: &NodeId) -> Result<()> {
        self.added.lock().await.push(node.clone());
        Ok(())
    }
    async fn remove_member(&self, node: &NodeId) -> Result<()> {
        self.removed.lock().await.push(node.clone());
        Ok(())
    }
}

struct Harness {
    msgs_tx: mpsc::Sender<AuxMsg>,
    sink_rx: mpsc::Receiver<Command>,
    membership: Arc<MockMembership>,
    shutdown_tx: broadcast::Sender<()>,
}

fn harness(fail_nodes: Vec<NodeId>, roster: Vec<NodeId>, members: Vec<NodeId>) -> Harness {
    let (sink_tx, sink_rx) = mpsc::channel(100);
    let (shutdown_tx, _) = broadcast::channel(1);
    let membership = Arc::new(MockMembership { members, added: Mutex::new(Vec::new()), removed: Mutex::new(Vec::new()) });
    let (ctl, msgs_tx) = AuxCtl::new(
        Config::new_test(),
        Arc::new(MockLog { fail_nodes }),
        Arc::new(MockCatalog),
        Arc::new(MockSink { tx: sink_tx }),
        Arc::new(MockRoster { nodes: roster }),
        membership.clone(),
        shutdown_tx.clone(),
    );
    let _handle = ctl.spawn();
    Harness { msgs_tx, sink_rx, membership, shutdown_tx }
}

fn action(kind: ActionKind, target: &str, index: u64) -> AuxCmd {
    AuxCmd {
        action: kind,
        stream: "orders".into(),
        args: ActionArgs { index, epoch: 1, node: node(target), leader_pid: None },
        conf: conf("orders", &["n1", "n2", "n3"], "n1"),
    }
}

#[tokio::test]
async fn successful_start_injects_member_started() -> Result<()> {
    let mut harness = harness(vec![], vec![], vec![]);
    harness.msgs_tx.send(AuxMsg::Action(action(ActionKind::StartWriter, "n1", 7))).await?;

    let cmd = harness.sink_rx.recv().await.expect("expected an injected outcome");
    match cmd {
        Command::MemberStarted { node: started, epoch, index, pid, .. } => {
            assert_eq!(started, node("n1"));
            assert_eq!(epoch, 1);
            assert_eq!(index, 7, "the outcome echoes the scheduling index");
            assert_eq!(pid.node(), &node("n1"));
        }
        other => panic!("unexpected command injected: {:?}", other),
    }
    let _ = harness.shutdown_tx.send(());
    Ok(())
}

#[tokio::test]
async fn successful_stop_reports_the_tail() -> Result<()> {
    let mut harness = harness(vec![], vec![], vec![]);
    harness.msgs_tx.send(AuxMsg::Action(action(ActionKind::Stop, "n2", 8))).await?;

    let cmd = harness.sink_rx.recv().await.expect("expected an injected outcome");
    match cmd {
        Command::MemberStopped { node: stopped, epoch, index, tail, .. } => {
            assert_eq!(stopped, node("n2"));
            assert_eq!(epoch, 1);
            assert_eq!(index, 8);
            assert_eq!(tail, Some((1, 42)));
        }
        other => panic!("unexpected command injected: {:?}", other),
    }
    let _ = harness.shutdown_tx.send(());
    Ok(())
}

#[tokio::test]
async fn failed_action_injects_action_failed() -> Result<()> {
    let mut harness = harness(vec![node("n1")], vec![], vec![]);
    harness.msgs_tx.send(AuxMsg::Action(action(ActionKind::StartWriter, "n1", 9))).await?;

    let cmd = harness.sink_rx.recv().await.expect("expected an injected outcome");
    match cmd {
        Command::ActionFailed { node: failed, index, epoch, action, .. } => {
            assert_eq!(failed, node("n1"));
            assert_eq!(index, 9);
            assert_eq!(epoch, 1);
            assert_eq!(action, ActionKind::StartWriter);
        }
        other => panic!("unexpected command injected: {:?}", other),
    }
    let _ = harness.shutdown_tx.send(());
    Ok(())
}

#[tokio::test]
async fn newer_action_supersedes_in_flight_action() -> Result<()> {
    let mut harness = harness(vec![], vec![], vec![]);
    // The first action stalls forever; the second targets the same member and
    // completes immediately, which it can only do by superseding the first.
    harness.msgs_tx.send(AuxMsg::Action(action(ActionKind::StartWriter, "slow", 10))).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.msgs_tx.send(AuxMsg::Action(action(ActionKind::Stop, "slow", 11))).await?;

    let cmd = tokio::time::timeout(Duration::from_secs(5), harness.sink_rx.recv())
        .await
        .expect("expected the superseding action to complete")
        .expect("expected an injected outcome");
    match cmd {
        Command::MemberStopped { index, .. } => assert_eq!(index, 11, "only the superseding action's outcome arrives"),
        other => panic!("unexpected command injected: {:?}", other),
    }
    let stale = tokio::time::timeout(Duration::from_millis(250), harness.sink_rx.recv()).await;
    assert!(stale.is_err(), "the aborted action must never report an outcome");
    let _ = harness.shutdown_tx.send(());
    Ok(())
}

#[tokio::test]
async fn fail_active_actions_synthesizes_failures() -> Result<()> {
    let mut harness = harness(vec![], vec![], vec![]);
    let active = vec![ActiveActions {
        stream: "orders".into(),
        epoch: 2,
        members: vec![(node("n1"), 5, ActionKind::Stop)],
        catalog_updating: Some((node("n1"), 1)),
    }];
    harness.msgs_tx.send(AuxMsg::Signal(AuxSignal::FailActiveActions { active })).await?;

    let first = harness.sink_rx.recv().await.expect("expected a synthesized failure");
    match first {
        Command::ActionFailed { node: failed, index, epoch, action, .. } => {
            assert_eq!(failed, node("n1"));
            assert_eq!(index, 5);
            assert_eq!(epoch, 2);
            assert_eq!(action, ActionKind::Stop);
        }
        other => panic!("unexpected command injected: {:?}", other),
    }
    let second = harness.sink_rx.recv().await.expect("expected a synthesized catalog failure");
    match second {
        Command::ActionFailed { action, epoch, .. } => {
            assert_eq!(action, ActionKind::UpdateCatalog);
            assert_eq!(epoch, 1);
        }
        other => panic!("unexpected command injected: {:?}", other),
    }
    let _ = harness.shutdown_tx.send(());
    Ok(())
}

#[tokio::test]
async fn streams_with_live_local_actions_are_excluded_from_failure_synthesis() -> Result<()> {
    let mut harness = harness(vec![], vec![], vec![]);
    // Occupy the stream with a stalled local action.
    harness.msgs_tx.send(AuxMsg::Action(action(ActionKind::StartWriter, "slow", 3))).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let active = vec![ActiveActions {
        stream: "orders".into(),
        epoch: 1,
        members: vec![(node("n2"), 4, ActionKind::Stop)],
        catalog_updating: None,
    }];
    harness.msgs_tx.send(AuxMsg::Signal(AuxSignal::FailActiveActions { active })).await?;

    let outcome = tokio::time::timeout(Duration::from_millis(500), harness.sink_rx.recv()).await;
    assert!(outcome.is_err(), "no failure is synthesized while the stream has a live action on this node");
    let _ = harness.shutdown_tx.send(());
    Ok(())
}

#[tokio::test]
async fn maybe_resize_reconciles_membership() -> Result<()> {
    let harness = harness(vec![], vec![node("n1"), node("n2")], vec![node("n1"), node("n3")]);
    harness.msgs_tx.send(AuxMsg::Signal(AuxSignal::MaybeResize)).await?;
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(harness.membership.added.lock().await.clone(), vec![node("n2")], "missing roster nodes are added");
    assert_eq!(harness.membership.removed.lock().await.clone(), vec![node("n3")], "nodes gone from the roster are removed");
    let _ = harness.shutdown_tx.send(());
    Ok(())
}
