//! The coordinator state machine.
//!
//! ## Determinism
//! `apply` is a pure function over `(meta, command, state)`: every replica applying the
//! same ordered command stream reaches the same state and emits the same effects. All
//! maps are ordered, no clocks or randomness are consulted, and anything fallible is
//! contained — an error while updating a stream leaves that stream untouched.
//!
//! ## Shape of an apply
//! The dispatcher routes the command to the affected stream, the stream FSM produces an
//! updated snapshot, the evaluator schedules whatever aux actions close the gap between
//! desired and observed member state, and the listener & monitor registries append
//! their notifications. Aux action outcomes re-enter as regular commands, which is what
//! makes retries emerge from re-evaluation instead of in-place looping.

pub mod evaluator;
pub mod listeners;
pub mod member;
pub mod monitors;
pub mod sac;
pub mod stream;
pub mod upgrade;
#[cfg(test)]
mod upgrade_test;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::member::{ActionTag, CurrentAction, Member};
use crate::core::monitors::MonitorPurpose;
use crate::core::sac::SacState;
use crate::core::stream::{CatalogPhase, StreamState};
use crate::error::CoordinatorError;
use crate::models::{
    ActionKind, ActiveActions, AuxSignal, Command, DownReason, Effect, ListenerKind, MonitorTarget, NodeId, PeerHandle, Query, QueryOutput, Reply,
    RoleKind, StreamId,
};
use crate::runtime::{Meta, RuntimeRole, MACHINE_VERSION, RELEASE_CURSOR_INTERVAL};

const METRIC_COMMANDS_APPLIED: &str = "stream_coordinator_commands_applied";

/// The replicated coordinator state machine.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Coordinator {
    /// The machine version of this state.
    pub version: u32,
    /// All streams under coordination.
    pub streams: BTreeMap<StreamId, StreamState>,
    /// All watched pids and why they are watched.
    pub monitors: BTreeMap<PeerHandle, MonitorPurpose>,
    /// The embedded Single-Active-Consumer sub-machine.
    pub sac: SacState,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self {
            version: MACHINE_VERSION,
            streams: BTreeMap::new(),
            monitors: BTreeMap::new(),
            sac: SacState::default(),
        }
    }
}

impl Coordinator {
    /// Create a new instance.
    pub fn new() -> Self {
        metrics::register_counter!(METRIC_COMMANDS_APPLIED, metrics::Unit::Count, "commands applied to the coordinator state machine");
        Self::default()
    }

    /// Apply the next command from the replicated log.
    #[tracing::instrument(level = "trace", skip(self, meta, cmd))]
    pub fn apply(&mut self, meta: &Meta, cmd: &Command) -> (Reply, Vec<Effect>) {
        metrics::counter!(METRIC_COMMANDS_APPLIED, 1);
        let mut effects = Vec::new();
        let reply = self.dispatch(meta, cmd, &mut effects);
        if meta.index > 0 && meta.index % RELEASE_CURSOR_INTERVAL == 0 {
            effects.push(Effect::ReleaseCursor { index: meta.index, snapshot: Box::new(self.clone()) });
        }
        (reply, effects)
    }

    fn dispatch(&mut self, meta: &Meta, cmd: &Command, effects: &mut Vec<Effect>) -> Reply {
        match cmd {
            Command::NewStream { id, conf, reply_to } => self.apply_new_stream(meta, id, cmd, conf, reply_to, effects),
            Command::DeleteStream { id }
            | Command::AddReplica { id, .. }
            | Command::DeleteReplica { id, .. }
            | Command::PolicyChanged { id, .. } => self.apply_stream_command(meta, id, cmd, true, effects),
            Command::MemberStarted { id, .. }
            | Command::MemberStopped { id, .. }
            | Command::MemberDeleted { id, .. }
            | Command::RetentionUpdated { id, .. }
            | Command::CatalogUpdated { id, .. }
            | Command::ActionFailed { id, .. } => self.apply_stream_command(meta, id, cmd, false, effects),
            Command::RegisterListener { id, pid, kind } => self.apply_register_listener(id, pid, *kind, effects),
            Command::Down { pid, reason } => self.apply_down(meta, cmd, pid, reason, effects),
            Command::NodeUp { node } => self.apply_node_up(meta, node, effects),
            Command::Sac(inner) => {
                let (reply, monitor) = self.sac.apply(inner);
                for pid in monitor {
                    if !self.monitors.contains_key(&pid) {
                        effects.push(Effect::Monitor(MonitorTarget::Process(pid.clone())));
                        self.monitors.insert(pid, MonitorPurpose::Sac);
                    }
                }
                reply
            }
            Command::MachineVersion { from, to } => {
                upgrade::migrate(self, *from, *to, effects);
                Reply::Ok
            }
            Command::Unknown => Reply::Error(CoordinatorError::UnknownCommand),
        }
    }

    /// Create a new stream, or leave an existing one untouched.
    fn apply_new_stream(
        &mut self, meta: &Meta, id: &StreamId, cmd: &Command, conf: &crate::models::StreamConf, reply_to: &Option<crate::models::ReplyAddress>,
        effects: &mut Vec<Effect>,
    ) -> Reply {
        if self.streams.contains_key(id) {
            return self.apply_stream_command(meta, id, cmd, true, effects);
        }
        let mut stream = StreamState::new(id.clone(), conf, reply_to.clone());
        evaluator::evaluate_stream(meta, &mut stream, effects);
        monitors::ensure_member_monitors(&stream, &mut self.monitors, effects);
        self.streams.insert(id.clone(), stream);
        tracing::debug!(stream = %id, "created new stream");
        if reply_to.is_some() {
            Reply::NoReply
        } else {
            Reply::Ok
        }
    }

    /// Route a command to its stream, then re-evaluate the updated snapshot.
    fn apply_stream_command(&mut self, meta: &Meta, id: &StreamId, cmd: &Command, user_initiated: bool, effects: &mut Vec<Effect>) -> Reply {
        let pre = match self.streams.get(id) {
            Some(pre) => pre,
            None if user_initiated => return Reply::Error(CoordinatorError::StreamNotFound),
            // Stale confirmations for destroyed streams are expected; drop them.
            None => return Reply::Ok,
        };
        let pre_members = pre.members.clone();
        match stream::update_stream(meta, cmd, pre) {
            Err(err) => {
                tracing::warn!(error = %err, stream = %id, "error updating stream, state left unchanged");
                Reply::Ok
            }
            Ok((None, reply)) => {
                if let Some(stream) = self.streams.remove(id) {
                    listeners::eol_effects(&stream, effects);
                    monitors::purge_stream(id, &mut self.monitors);
                    tracing::debug!(stream = %id, "stream destroyed");
                }
                reply
            }
            Ok((Some(mut updated), reply)) => {
                evaluator::evaluate_stream(meta, &mut updated, effects);
                if updated.members != pre_members {
                    listeners::eval_listeners(&mut updated, effects);
                }
                monitors::ensure_member_monitors(&updated, &mut self.monitors, effects);
                self.streams.insert(id.clone(), updated);
                reply
            }
        }
    }

    /// Register a listener against a stream and immediately evaluate its endpoints.
    fn apply_register_listener(&mut self, id: &StreamId, pid: &PeerHandle, kind: ListenerKind, effects: &mut Vec<Effect>) -> Reply {
        let stream = match self.streams.get_mut(id) {
            Some(stream) => stream,
            None => return Reply::Error(CoordinatorError::StreamNotFound),
        };
        let payload = match kind {
            ListenerKind::Leader => listeners::ListenerPayload::Leader { last: None },
            ListenerKind::LocalMember => listeners::ListenerPayload::LocalMember { node: pid.node().clone(), last: None },
        };
        stream.listeners.insert(listeners::ListenerKey { pid: pid.clone(), kind }, payload);
        listeners::eval_listeners(stream, effects);
        monitors::track_listener(pid, id, &mut self.monitors, effects);
        Reply::Ok
    }

    /// Route a `down` event by the monitored pid's recorded purpose.
    fn apply_down(&mut self, meta: &Meta, cmd: &Command, pid: &PeerHandle, reason: &DownReason, effects: &mut Vec<Effect>) -> Reply {
        match self.monitors.remove(pid) {
            Some(MonitorPurpose::StreamMember(id)) => {
                if matches!(reason, DownReason::Noconnection) {
                    // Watch the node so its recovery is observed as a nodeup.
                    effects.push(Effect::Monitor(MonitorTarget::Node(pid.node().clone())));
                }
                self.apply_stream_command(meta, &id, cmd, false, effects)
            }
            Some(MonitorPurpose::Listener(streams)) => {
                for id in streams {
                    if let Some(stream) = self.streams.get_mut(&id) {
                        stream.listeners.retain(|key, _| key.pid != *pid);
                    }
                }
                Reply::Ok
            }
            Some(MonitorPurpose::Sac) => {
                self.sac.handle_down(pid);
                Reply::Ok
            }
            None => Reply::Ok,
        }
    }

    /// Wake parked members on a node which became reachable again.
    fn apply_node_up(&mut self, meta: &Meta, node: &NodeId, effects: &mut Vec<Effect>) -> Reply {
        let ids: Vec<StreamId> = self.streams.keys().cloned().collect();
        for id in ids {
            let stream = match self.streams.get_mut(&id) {
                Some(stream) => stream,
                None => continue,
            };
            let (woke, remonitor) = stream.node_up(node);
            if let Some(pid) = remonitor {
                // Track the pid again so the runtime's follow-up down (if the process
                // died with its node) can still be routed to this stream.
                effects.push(Effect::Monitor(MonitorTarget::Process(pid.clone())));
                self.monitors.insert(pid, MonitorPurpose::StreamMember(id.clone()));
            }
            if woke {
                evaluator::evaluate_stream(meta, stream, effects);
            }
        }
        Reply::Ok
    }

    /// Effects to run when the replicated machine itself changes runtime role.
    ///
    /// On gaining leadership every tracked pid & member node is re-monitored, and aux is
    /// told to fail any action stranded by the previous leader.
    pub fn state_enter(&self, role: RuntimeRole) -> Vec<Effect> {
        let mut effects = Vec::new();
        if role != RuntimeRole::Leader {
            return effects;
        }
        for pid in self.monitors.keys() {
            effects.push(Effect::Monitor(MonitorTarget::Process(pid.clone())));
        }
        let mut nodes = BTreeSet::new();
        for stream in self.streams.values() {
            for member in stream.members.values() {
                nodes.insert(member.node.clone());
            }
        }
        for node in nodes {
            effects.push(Effect::Monitor(MonitorTarget::Node(node)));
        }
        let mut active = Vec::new();
        for stream in self.streams.values() {
            let mut members = Vec::new();
            for member in stream.members.values() {
                if let Some(CurrentAction { tag, index }) = &member.current {
                    if *tag != ActionTag::Sleeping {
                        members.push((member.node.clone(), *index, action_kind(member, *tag)));
                    }
                }
            }
            let catalog_updating = match stream.catalog.phase {
                CatalogPhase::Updating => stream.writer().map(|writer| (writer.node.clone(), stream.catalog.epoch)),
                CatalogPhase::Updated => None,
            };
            if !members.is_empty() || catalog_updating.is_some() {
                active.push(ActiveActions { stream: stream.id.clone(), epoch: stream.epoch, members, catalog_updating });
            }
        }
        effects.push(Effect::AuxSignal(AuxSignal::FailActiveActions { active }));
        effects
    }

    /// Effects to run on the runtime's periodic tick.
    pub fn tick(&self) -> Vec<Effect> {
        vec![Effect::AuxSignal(AuxSignal::MaybeResize)]
    }

    /// The pid of the given stream's running writer.
    pub fn writer_pid(&self, id: &StreamId) -> Result<PeerHandle, CoordinatorError> {
        let stream = self.streams.get(id).ok_or(CoordinatorError::StreamNotFound)?;
        stream
            .writer()
            .and_then(|writer| writer.running_pid().cloned())
            .ok_or(CoordinatorError::WriterNotFound)
    }

    /// The pid of the running member of the given stream on the given node.
    pub fn local_pid(&self, id: &StreamId, node: &NodeId) -> Result<PeerHandle, CoordinatorError> {
        self.streams
            .get(id)
            .and_then(|stream| stream.members.get(node))
            .and_then(|member| member.running_pid().cloned())
            .ok_or(CoordinatorError::NotFound)
    }

    /// All members of the given stream with their pids & roles.
    pub fn members(&self, id: &StreamId) -> Result<BTreeMap<NodeId, (Option<PeerHandle>, RoleKind)>, CoordinatorError> {
        let stream = self.streams.get(id).ok_or(CoordinatorError::NotFound)?;
        Ok(stream
            .members
            .iter()
            .map(|(node, member)| (node.clone(), (member.running_pid().cloned(), member.role.kind)))
            .collect())
    }

    /// Answer a read-only query against this replica's state.
    pub fn query(&self, query: &Query) -> Result<QueryOutput, CoordinatorError> {
        match query {
            Query::WriterPid(id) => self.writer_pid(id).map(QueryOutput::Pid),
            Query::LocalPid(id, node) => self.local_pid(id, node).map(QueryOutput::Pid),
            Query::Members(id) => self.members(id).map(QueryOutput::Members),
        }
    }
}

/// The action kind represented by an in-flight member action tag.
fn action_kind(member: &Member, tag: ActionTag) -> ActionKind {
    match tag {
        ActionTag::Starting => {
            if member.is_writer() {
                ActionKind::StartWriter
            } else {
                ActionKind::StartReplica
            }
        }
        ActionTag::Stopping => ActionKind::Stop,
        ActionTag::Deleting => ActionKind::DeleteMember,
        ActionTag::UpdatingRetention => ActionKind::UpdateRetention,
        ActionTag::Sleeping => ActionKind::Stop,
    }
}
