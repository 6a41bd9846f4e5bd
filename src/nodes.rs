//! In-memory view of the remote compute nodes for one scheduling pass.
//!
//! Capacity and reachability are per-pass only: accepted counts reset at
//! the start of every pass, and a node marked offline gets a fresh chance
//! on the next one.

use crate::config::{NodeEntry, QueueDiscipline};

#[derive(Debug, Clone)]
pub struct NodeSlot {
    pub addr: String,
    pub queue: QueueDiscipline,
    pub max_jobs: usize,
    accepted: usize,
    online: bool,
}

impl NodeSlot {
    pub fn new(entry: &NodeEntry) -> Self {
        Self {
            addr: entry.addr.clone(),
            queue: entry.queue,
            max_jobs: entry.max_jobs,
            accepted: 0,
            online: true,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Flag the node unreachable for the remainder of this pass.
    pub fn set_offline(&mut self) {
        self.online = false;
    }

    pub fn has_capacity(&self) -> bool {
        self.online && self.accepted < self.max_jobs
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// Count one accepted task against this node's capacity.
    pub fn accept(&mut self) {
        self.accepted += 1;
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodePool {
    slots: Vec<NodeSlot>,
}

impl NodePool {
    pub fn from_config(entries: &[NodeEntry]) -> Self {
        Self {
            slots: entries.iter().map(NodeSlot::new).collect(),
        }
    }

    /// Reset accepted counts and give every node a fresh online chance.
    pub fn begin_pass(&mut self) {
        for slot in &mut self.slots {
            slot.accepted = 0;
            slot.online = true;
        }
    }

    pub fn slots_mut(&mut self) -> &mut [NodeSlot] {
        &mut self.slots
    }

    pub fn slots(&self) -> &[NodeSlot] {
        &self.slots
    }

    pub fn has_any_capacity(&self) -> bool {
        self.slots.iter().any(|s| s.has_capacity())
    }
}
