//! Listener registry.
//!
//! Listeners are external pids interested in a stream's endpoints: the writer pid
//! (`leader`) or the running member pid on the listener's own node (`local_member`).
//! Each listener stores the last pid it was notified of; a notification is only emitted
//! when the observed endpoint differs from it, which keeps re-evaluation silent.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::member::MemberTarget;
use crate::core::stream::StreamState;
use crate::models::{Effect, ListenerKind, NodeId, PeerHandle, QueueEvent};

/// The key under which a listener registration is stored.
#[derive(Clone, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ListenerKey {
    pub pid: PeerHandle,
    pub kind: ListenerKind,
}

/// The last notified endpoint of a listener.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ListenerPayload {
    Leader { last: Option<PeerHandle> },
    LocalMember { node: NodeId, last: Option<PeerHandle> },
}

/// Walk the stream's listeners and notify every one whose observed endpoint changed.
pub(super) fn eval_listeners(stream: &mut StreamState, effects: &mut Vec<Effect>) {
    let queue_ref = stream.queue_ref.clone();
    let leader = stream
        .members
        .values()
        .find(|member| member.is_writer() && !matches!(member.target, MemberTarget::Deleted))
        .and_then(|member| member.running_pid().cloned());
    let locals: Vec<(NodeId, PeerHandle)> = stream
        .members
        .values()
        .filter(|member| !matches!(member.target, MemberTarget::Deleted))
        .filter_map(|member| member.running_pid().map(|pid| (member.node.clone(), pid.clone())))
        .collect();
    for (key, payload) in stream.listeners.iter_mut() {
        match payload {
            ListenerPayload::Leader { last } => {
                if let Some(pid) = &leader {
                    if last.as_ref() != Some(pid) {
                        effects.push(Effect::Notify {
                            pid: key.pid.clone(),
                            queue_ref: queue_ref.clone(),
                            event: QueueEvent::LeaderChange(pid.clone()),
                        });
                        *last = Some(pid.clone());
                    }
                }
            }
            ListenerPayload::LocalMember { node, last } => {
                let observed = locals.iter().find(|(local_node, _)| local_node == node).map(|(_, pid)| pid);
                if let Some(pid) = observed {
                    if last.as_ref() != Some(pid) {
                        effects.push(Effect::Notify {
                            pid: key.pid.clone(),
                            queue_ref: queue_ref.clone(),
                            event: QueueEvent::LocalMemberChange(pid.clone()),
                        });
                        *last = Some(pid.clone());
                    }
                }
            }
        }
    }
}

/// Emit an end-of-life notification to every distinct listener pid of a destroyed stream.
pub(super) fn eol_effects(stream: &StreamState, effects: &mut Vec<Effect>) {
    let mut seen = BTreeSet::new();
    for key in stream.listeners.keys() {
        if seen.insert(key.pid.clone()) {
            effects.push(Effect::Notify {
                pid: key.pid.clone(),
                queue_ref: stream.queue_ref.clone(),
                event: QueueEvent::Eol,
            });
        }
    }
    for pid in stream.listeners_v1.keys() {
        if seen.insert(pid.clone()) {
            effects.push(Effect::Notify {
                pid: pid.clone(),
                queue_ref: stream.queue_ref.clone(),
                event: QueueEvent::Eol,
            });
        }
    }
}
