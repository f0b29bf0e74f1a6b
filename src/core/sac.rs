//! Embedded Single-Active-Consumer sub-machine.
//!
//! The coordinator owns this state opaquely: commands tagged `sac` are delegated to
//! [`SacState::apply`], and `down` events for pids it registered are delegated to
//! [`SacState::handle_down`]. The sub-machine tracks consumer groups per stream and
//! keeps exactly one consumer active per group, promoting the next registrant when the
//! active one goes away.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{PeerHandle, Reply, StreamId};

/// Identity of a consumer group.
#[derive(Clone, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct SacGroupId {
    pub stream: StreamId,
    pub name: String,
}

/// One consumer group: registered consumers in arrival order, first is active.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SacGroup {
    consumers: Vec<PeerHandle>,
}

impl SacGroup {
    /// The currently active consumer, if any.
    pub fn active(&self) -> Option<&PeerHandle> {
        self.consumers.first()
    }
}

/// Commands delegated to the sub-machine.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum SacCommand {
    Register { group: SacGroupId, pid: PeerHandle },
    Unregister { group: SacGroupId, pid: PeerHandle },
}

/// The sub-machine's replicated state.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SacState {
    groups: BTreeMap<SacGroupId, SacGroup>,
}

impl SacState {
    /// Apply a delegated command. Returns the pids which must be newly monitored.
    pub fn apply(&mut self, cmd: &SacCommand) -> (Reply, Vec<PeerHandle>) {
        match cmd {
            SacCommand::Register { group, pid } => {
                let entry = self.groups.entry(group.clone()).or_insert_with(SacGroup::default);
                if !entry.consumers.contains(pid) {
                    entry.consumers.push(pid.clone());
                    return (Reply::Ok, vec![pid.clone()]);
                }
                (Reply::Ok, Vec::new())
            }
            SacCommand::Unregister { group, pid } => {
                if let Some(entry) = self.groups.get_mut(group) {
                    entry.consumers.retain(|existing| existing != pid);
                    if entry.consumers.is_empty() {
                        self.groups.remove(group);
                    }
                }
                (Reply::Ok, Vec::new())
            }
        }
    }

    /// Drop a downed consumer from every group; the next registrant becomes active.
    pub fn handle_down(&mut self, pid: &PeerHandle) {
        for group in self.groups.values_mut() {
            group.consumers.retain(|existing| existing != pid);
        }
        self.groups.retain(|_, group| !group.consumers.is_empty());
    }

    /// The currently active consumer of the given group.
    pub fn active(&self, group: &SacGroupId) -> Option<&PeerHandle> {
        self.groups.get(group).and_then(|group| group.active())
    }
}
