use crate::envelope::StreamCommand;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{Notify, mpsc};

/// Bounded FIFO of envelopes waiting to be written to one node.
///
/// The queue belongs to a node identity rather than to a physical connection,
/// so a worker that reconnects picks up whatever is still queued. Any number of
/// producers may enqueue; only one sender loop drains it at a time.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<StreamCommand>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<StreamCommand>>>,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        OutboundQueue {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<StreamCommand> {
        self.tx.clone()
    }

    pub fn try_enqueue(&self, frame: StreamCommand) -> Result<(), TrySendError<StreamCommand>> {
        self.tx.try_send(frame)
    }

    pub(crate) fn receiver(&self) -> Arc<tokio::sync::Mutex<mpsc::Receiver<StreamCommand>>> {
        self.rx.clone()
    }
}

/// A node reachable for dispatch, as seen at one point in time.
pub struct Candidate {
    pub node_id: String,
    pub tx: mpsc::Sender<StreamCommand>,
}

impl Candidate {
    pub async fn enqueue(&self, frame: StreamCommand) -> Result<(), SendError<StreamCommand>> {
        self.tx.send(frame).await
    }
}

/// What a connection receives when it registers.
pub struct Registration {
    pub queue: OutboundQueue,
    /// Notified once a newer connection takes over the same node identity.
    pub superseded: Arc<Notify>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Deregistration {
    /// The node was removed. `members` is what remains of the group.
    Removed { members: Vec<String> },
    /// A newer connection owns the identity; nothing changed.
    Stale { members: Vec<String> },
}

struct NodeEntry {
    group: String,
    conn_key: String,
    queue: OutboundQueue,
    superseded: Arc<Notify>,
}

#[derive(Default)]
struct RegistryState {
    groups: HashMap<String, HashSet<String>>,
    nodes: HashMap<String, NodeEntry>,
}

impl RegistryState {
    fn members(&self, group: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .groups
            .get(group)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    fn leave_group(&mut self, group: &str, node_id: &str) {
        if let Some(set) = self.groups.get_mut(group) {
            set.remove(node_id);
            if set.is_empty() {
                self.groups.remove(group);
            }
        }
    }
}

/// Which worker nodes are connected, which group each serves, and which
/// connection currently owns each identity.
///
/// Membership, connection keys and queues share a single lock, so the connKey
/// comparison in [`NodeRegistry::deregister`] and the eviction it guards are atomic.
pub struct NodeRegistry {
    queue_capacity: usize,
    state: Mutex<RegistryState>,
}

impl NodeRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        NodeRegistry {
            queue_capacity,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Adds `node_id` to `group` and makes `conn_key` its current connection.
    /// The identity's outbound queue is created on first sight and reused after.
    pub fn register(&self, group: &str, node_id: &str, conn_key: &str) -> Registration {
        let mut state = self.state.lock();

        let previous_group = state.nodes.get(node_id).map(|entry| entry.group.clone());
        if let Some(previous) = previous_group.filter(|g| g != group) {
            state.leave_group(&previous, node_id);
        }

        let registration = match state.nodes.get_mut(node_id) {
            Some(entry) => {
                if entry.conn_key != conn_key {
                    entry.superseded.notify_one();
                    entry.superseded = Arc::new(Notify::new());
                }
                entry.group = group.to_string();
                entry.conn_key = conn_key.to_string();
                Registration {
                    queue: entry.queue.clone(),
                    superseded: entry.superseded.clone(),
                }
            }
            None => {
                let queue = OutboundQueue::new(self.queue_capacity);
                let superseded = Arc::new(Notify::new());
                state.nodes.insert(
                    node_id.to_string(),
                    NodeEntry {
                        group: group.to_string(),
                        conn_key: conn_key.to_string(),
                        queue: queue.clone(),
                        superseded: superseded.clone(),
                    },
                );
                Registration { queue, superseded }
            }
        };

        state
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(node_id.to_string());

        registration
    }

    /// Removes `node_id` from `group` if `conn_key` is still its current connection.
    pub fn deregister(&self, group: &str, node_id: &str, conn_key: &str) -> Deregistration {
        let mut state = self.state.lock();

        let is_current = state
            .nodes
            .get(node_id)
            .is_some_and(|entry| entry.conn_key == conn_key && entry.group == group);

        if !is_current {
            return Deregistration::Stale {
                members: state.members(group),
            };
        }

        state.nodes.remove(node_id);
        state.leave_group(group, node_id);

        Deregistration::Removed {
            members: state.members(group),
        }
    }

    /// Snapshot of the nodes currently serving `group`. `None` if it has no members.
    pub fn candidates(&self, group: &str) -> Option<Vec<Candidate>> {
        let state = self.state.lock();
        let members = state.groups.get(group)?;

        let candidates: Vec<Candidate> = members
            .iter()
            .filter_map(|node_id| {
                state.nodes.get(node_id).map(|entry| Candidate {
                    node_id: node_id.clone(),
                    tx: entry.queue.sender(),
                })
            })
            .collect();

        (!candidates.is_empty()).then_some(candidates)
    }

    /// Every registered node's queue, regardless of group.
    pub fn all_queues(&self) -> Vec<(String, OutboundQueue)> {
        self.state
            .lock()
            .nodes
            .iter()
            .map(|(node_id, entry)| (node_id.clone(), entry.queue.clone()))
            .collect()
    }

    pub fn members(&self, group: &str) -> Vec<String> {
        self.state.lock().members(group)
    }

    pub fn has_members(&self, group: &str) -> bool {
        self.state.lock().groups.contains_key(group)
    }

    pub fn conn_key(&self, node_id: &str) -> Option<String> {
        self.state
            .lock()
            .nodes
            .get(node_id)
            .map(|entry| entry.conn_key.clone())
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }
}
