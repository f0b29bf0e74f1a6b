//! Aux executor.
//!
//! The aux executor runs the out-of-band actions the machine schedules: starting &
//! stopping log processes, deleting member data, publishing writers to the external
//! catalog and shipping retention updates. It is best-effort and holds no replicated
//! state; every action terminates by injecting a confirmation or an `action_failed`
//! command back into the replicated log, which is the only channel through which its
//! work becomes visible to the machine.
//!
//! At most one action is in flight per `(stream, node)`; a newly scheduled action for
//! the same key supersedes the old one. Transient failures are throttled with a sleep
//! before the failure is reported, so an unreachable node does not produce a hot loop
//! of schedule/fail cycles.

#[cfg(test)]
mod mod_test;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::models::{ActionKind, ActiveActions, AuxCmd, AuxSignal, Command, Epoch, NodeId, PeerHandle, StreamConf, StreamId, Tail};
use crate::runtime::CommandSink;

const METRIC_AUX_ACTIONS: &str = "stream_coordinator_aux_actions";
const METRIC_AUX_ACTION_FAILURES: &str = "stream_coordinator_aux_action_failures";

/// RPC surface of the per-node log server processes driven by aux actions.
#[async_trait]
pub trait LogProcessClient: Send + Sync + 'static {
    /// Start the writer process for the stream on the given node.
    async fn start_writer(&self, stream: &StreamId, conf: &StreamConf, node: &NodeId) -> Result<PeerHandle>;
    /// Start a replica process on the given node, following the given writer.
    async fn start_replica(&self, stream: &StreamId, conf: &StreamConf, node: &NodeId, leader: &PeerHandle) -> Result<PeerHandle>;
    /// Stop the stream's process on the given node, returning its tail.
    async fn stop(&self, stream: &StreamId, conf: &StreamConf, node: &NodeId, epoch: Epoch) -> Result<Tail>;
    /// Delete the stream's data from the given node.
    async fn delete_member(&self, stream: &StreamId, node: &NodeId) -> Result<()>;
    /// Ship the given retention configuration to the member on the given node.
    async fn update_retention(&self, stream: &StreamId, conf: &StreamConf, node: &NodeId) -> Result<()>;
    /// Read per-node replication state from a running writer: `node → (offset, millis)`.
    async fn replication_state(&self, pid: &PeerHandle) -> Result<BTreeMap<NodeId, (u64, u64)>>;
    /// Whether the given pid is alive on its node.
    async fn is_alive(&self, pid: &PeerHandle) -> Result<bool>;
}

/// The external durable queue catalog, updated when a new writer is elected.
#[async_trait]
pub trait CatalogClient: Send + Sync + 'static {
    async fn publish_writer(&self, stream: &StreamId, conf: &StreamConf, epoch: Epoch, writer: &PeerHandle) -> Result<()>;
}

/// The external roster of nodes which should participate in the coordinator's runtime.
#[async_trait]
pub trait ClusterRoster: Send + Sync + 'static {
    async fn nodes(&self) -> Result<Vec<NodeId>>;
}

/// Membership management surface of the consensus runtime.
#[async_trait]
pub trait RuntimeMembership: Send + Sync + 'static {
    async fn members(&self) -> Result<Vec<NodeId>>;
    async fn add_member(&self, node: &NodeId) -> Result<()>;
    async fn remove_member(&self, node: &NodeId) -> Result<()>;
}

/// A message bound for the aux executor.
pub enum AuxMsg {
    /// An action scheduled by the machine.
    Action(AuxCmd),
    /// A control signal emitted outside of the action path.
    Signal(AuxSignal),
}

/// A completion notice from a spawned task back into the control loop.
enum Done {
    Action { stream: StreamId, node: NodeId, index: u64 },
    Resize,
}

/// An action currently in flight on this node.
struct LiveAction {
    index: u64,
    handle: JoinHandle<()>,
}

/// The aux executor controller.
pub struct AuxCtl<C: LogProcessClient, G: CatalogClient, S: CommandSink, R: ClusterRoster, M: RuntimeMembership> {
    /// The application's runtime config.
    config: Arc<Config>,
    /// Client used to drive the per-node log processes.
    log: Arc<C>,
    /// Client used to publish writers to the external catalog.
    catalog: Arc<G>,
    /// Sink used to inject action outcomes back into the replicated log.
    sink: Arc<S>,
    /// The external cluster roster.
    roster: Arc<R>,
    /// The runtime's membership surface.
    membership: Arc<M>,

    /// A channel of inbound actions & signals.
    msgs_rx: ReceiverStream<AuxMsg>,
    /// A channel of completion notices from spawned tasks.
    done_tx: mpsc::Sender<Done>,
    /// A channel of completion notices from spawned tasks.
    done_rx: ReceiverStream<Done>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// All actions currently in flight, keyed by `(stream, node)`.
    live: HashMap<(StreamId, NodeId), LiveAction>,
    /// The in-flight cluster resize task, if any.
    resizer: Option<JoinHandle<()>>,
}

impl<C: LogProcessClient, G: CatalogClient, S: CommandSink, R: ClusterRoster, M: RuntimeMembership> AuxCtl<C, G, S, R, M> {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, log: Arc<C>, catalog: Arc<G>, sink: Arc<S>, roster: Arc<R>, membership: Arc<M>, shutdown_tx: broadcast::Sender<()>,
    ) -> (Self, mpsc::Sender<AuxMsg>) {
        metrics::register_counter!(METRIC_AUX_ACTIONS, metrics::Unit::Count, "aux actions executed");
        metrics::register_counter!(METRIC_AUX_ACTION_FAILURES, metrics::Unit::Count, "aux actions which terminated in failure");
        let (msgs_tx, msgs_rx) = mpsc::channel(1000);
        let (done_tx, done_rx) = mpsc::channel(1000);
        let this = Self {
            config,
            log,
            catalog,
            sink,
            roster,
            membership,
            msgs_rx: ReceiverStream::new(msgs_rx),
            done_tx,
            done_rx: ReceiverStream::new(done_rx),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            live: HashMap::new(),
            resizer: None,
        };
        (this, msgs_tx)
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("aux executor has started");
        loop {
            tokio::select! {
                Some(msg) = self.msgs_rx.next() => self.handle_msg(msg).await,
                Some(done) = self.done_rx.next() => self.handle_done(done),
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        for (_, action) in self.live.drain() {
            action.handle.abort();
        }
        if let Some(resizer) = self.resizer.take() {
            resizer.abort();
        }
        tracing::debug!("aux executor has shutdown");
        Ok(())
    }

    /// Handle an inbound action or signal.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_msg(&mut self, msg: AuxMsg) {
        match msg {
            AuxMsg::Action(cmd) => self.schedule_action(cmd),
            AuxMsg::Signal(AuxSignal::FailActiveActions { active }) => self.fail_active_actions(active).await,
            AuxMsg::Signal(AuxSignal::MaybeResize) => self.maybe_resize(),
        }
    }

    /// Handle a completion notice from a spawned task.
    fn handle_done(&mut self, done: Done) {
        match done {
            Done::Action { stream, node, index } => {
                let key = (stream, node);
                if matches!(self.live.get(&key), Some(action) if action.index == index) {
                    self.live.remove(&key);
                }
            }
            Done::Resize => self.resizer = None,
        }
    }

    /// Run the given action asynchronously, superseding any older action in flight for
    /// the same `(stream, node)`.
    #[tracing::instrument(level = "trace", skip(self, cmd), fields(stream = %cmd.stream, node = %cmd.args.node, index = cmd.args.index))]
    fn schedule_action(&mut self, cmd: AuxCmd) {
        metrics::counter!(METRIC_AUX_ACTIONS, 1);
        let key = (cmd.stream.clone(), cmd.args.node.clone());
        if let Some(old) = self.live.remove(&key) {
            tracing::debug!(stream = %key.0, node = %key.1, "superseding in-flight aux action");
            old.handle.abort();
        }
        let index = cmd.args.index;
        let (log, catalog, sink, done_tx) = (self.log.clone(), self.catalog.clone(), self.sink.clone(), self.done_tx.clone());
        let retry_sleep = self.config.aux_retry_sleep_secs;
        let (done_stream, done_node) = (key.0.clone(), key.1.clone());
        let handle = tokio::spawn(async move {
            let outcome = match execute_action(log.as_ref(), catalog.as_ref(), &cmd).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    metrics::counter!(METRIC_AUX_ACTION_FAILURES, 1);
                    tracing::warn!(error = ?err, stream = %cmd.stream, node = %cmd.args.node, action = ?cmd.action, "aux action failed");
                    // Throttle before reporting, so an unreachable node does not spin.
                    if retry_sleep > 0 {
                        tokio::time::sleep(Duration::from_secs(retry_sleep)).await;
                    }
                    action_failed(&cmd)
                }
            };
            if let Err(err) = sink.inject(outcome).await {
                tracing::error!(error = ?err, "error injecting aux action outcome into the log");
            }
            let _ = done_tx.send(Done::Action { stream: done_stream, node: done_node, index }).await;
        });
        self.live.insert(key, LiveAction { index, handle });
    }

    /// Turn actions stranded by the previous machine leader into explicit failures.
    ///
    /// Streams with an action still alive on this node are excluded: their outcomes
    /// will arrive on their own.
    #[tracing::instrument(level = "trace", skip(self, active))]
    async fn fail_active_actions(&mut self, active: Vec<ActiveActions>) {
        for summary in active {
            if self.live.keys().any(|(stream, _)| *stream == summary.stream) {
                continue;
            }
            for (node, index, action) in summary.members {
                let cmd = Command::ActionFailed { id: summary.stream.clone(), node, index, epoch: summary.epoch, action };
                if let Err(err) = self.sink.inject(cmd).await {
                    tracing::error!(error = ?err, stream = %summary.stream, "error injecting synthesized action failure");
                }
            }
            if let Some((node, epoch)) = summary.catalog_updating {
                let cmd = Command::ActionFailed {
                    id: summary.stream.clone(),
                    node,
                    index: 0,
                    epoch,
                    action: ActionKind::UpdateCatalog,
                };
                if let Err(err) = self.sink.inject(cmd).await {
                    tracing::error!(error = ?err, stream = %summary.stream, "error injecting synthesized catalog failure");
                }
            }
        }
    }

    /// Reconcile runtime membership against the external cluster roster, gated to a
    /// single in-flight task.
    #[tracing::instrument(level = "trace", skip(self))]
    fn maybe_resize(&mut self) {
        if self.resizer.is_some() {
            return;
        }
        let (roster, membership, done_tx) = (self.roster.clone(), self.membership.clone(), self.done_tx.clone());
        let handle = tokio::spawn(async move {
            if let Err(err) = reconcile_membership(roster.as_ref(), membership.as_ref()).await {
                tracing::warn!(error = ?err, "error reconciling cluster membership, will retry on next tick");
            }
            let _ = done_tx.send(Done::Resize).await;
        });
        self.resizer = Some(handle);
    }
}

/// Execute one aux action, returning the confirmation command for its outcome.
async fn execute_action<C: LogProcessClient, G: CatalogClient>(log: &C, catalog: &G, cmd: &AuxCmd) -> Result<Command> {
    let (id, node, epoch, index) = (&cmd.stream, &cmd.args.node, cmd.args.epoch, cmd.args.index);
    match cmd.action {
        ActionKind::StartWriter => {
            let pid = log.start_writer(id, &cmd.conf, node).await.context("error starting stream writer")?;
            Ok(Command::MemberStarted { id: id.clone(), node: node.clone(), epoch, index, pid })
        }
        ActionKind::StartReplica => {
            let leader = cmd.args.leader_pid.as_ref().ok_or_else(|| anyhow!("start_replica scheduled without a writer pid"))?;
            let pid = log.start_replica(id, &cmd.conf, node, leader).await.context("error starting stream replica")?;
            Ok(Command::MemberStarted { id: id.clone(), node: node.clone(), epoch, index, pid })
        }
        ActionKind::Stop => {
            let tail = log.stop(id, &cmd.conf, node, epoch).await.context("error stopping stream member")?;
            Ok(Command::MemberStopped { id: id.clone(), node: node.clone(), epoch, index, tail })
        }
        ActionKind::DeleteMember => {
            log.delete_member(id, node).await.context("error deleting stream member")?;
            Ok(Command::MemberDeleted { id: id.clone(), node: node.clone() })
        }
        ActionKind::UpdateRetention => {
            log.update_retention(id, &cmd.conf, node).await.context("error updating member retention")?;
            Ok(Command::RetentionUpdated { id: id.clone(), node: node.clone() })
        }
        ActionKind::UpdateCatalog => {
            let writer = cmd.args.leader_pid.as_ref().ok_or_else(|| anyhow!("update_catalog scheduled without a writer pid"))?;
            catalog.publish_writer(id, &cmd.conf, epoch, writer).await.context("error publishing writer to catalog")?;
            Ok(Command::CatalogUpdated { id: id.clone(), epoch })
        }
    }
}

/// The failure command reported for an action which could not complete.
fn action_failed(cmd: &AuxCmd) -> Command {
    Command::ActionFailed {
        id: cmd.stream.clone(),
        node: cmd.args.node.clone(),
        index: cmd.args.index,
        epoch: cmd.args.epoch,
        action: cmd.action,
    }
}

/// Compare the runtime's membership against the external roster, adding & removing
/// members as needed. Best-effort; failures surface on the next tick.
async fn reconcile_membership<R: ClusterRoster, M: RuntimeMembership>(roster: &R, membership: &M) -> Result<()> {
    let desired = roster.nodes().await.context("error reading cluster roster")?;
    let current = membership.members().await.context("error reading runtime membership")?;
    for node in desired.iter().filter(|node| !current.contains(node)) {
        tracing::info!(node = %node, "adding node to coordinator runtime membership");
        membership.add_member(node).await.with_context(|| format!("error adding member {}", node))?;
    }
    for node in current.iter().filter(|node| !desired.contains(node)) {
        tracing::info!(node = %node, "removing node from coordinator runtime membership");
        membership.remove_member(node).await.with_context(|| format!("error removing member {}", node))?;
    }
    Ok(())
}
