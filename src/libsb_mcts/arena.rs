// Copyright 2024 Sable Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashSet;

use crate::cache::PosId;
use crate::node::{Node, NodeId};

/// A fixed-capacity pool of node slots. Slots are deinitialized in place
/// and recycled through a free list rather than returned to the allocator;
/// indices stay stable for the lifetime of the arena, which is what lets
/// edges and position records refer to nodes by `NodeId`.
pub struct NodeArena {
    slots: Vec<Node>,
    free: Vec<u32>,
    capacity: usize,
    used: usize
}

impl NodeArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec! [],
            free: vec! [],
            capacity,
            used: 0
        }
    }

    /// Claim a slot for a fresh node. Returns `None` when the arena is at
    /// capacity with nothing on the free list; the caller is expected to
    /// abandon its playout, not to wait.
    pub fn new_node(&mut self, parent: Option<NodeId>, position: PosId) -> Option<NodeId> {
        if let Some(index) = self.free.pop() {
            self.slots[index as usize].reinit(parent, position);
            self.used += 1;
            return Some(NodeId(index));
        }

        if self.slots.len() < self.capacity {
            self.slots.push(Node::new(parent, position));
            self.used += 1;
            return Some(NodeId(self.slots.len() as u32 - 1));
        }

        None
    }

    /// Return a slot to the free list.
    pub fn unlink(&mut self, id: NodeId) {
        debug_assert!(self.slots[id.index()].in_use);
        self.slots[id.index()].deinit();
        self.free.push(id.0);
        self.used -= 1;
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.slots[id.index()]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.slots[id.index()]
    }

    pub fn is_live(&self, id: NodeId) -> bool {
        id.index() < self.slots.len() && self.slots[id.index()].in_use
    }

    /// Every live node id, in slot order.
    pub fn live_ids(&self) -> Vec<NodeId> {
        self.slots.iter()
            .enumerate()
            .filter(|(_, slot)| slot.in_use)
            .map(|(i, _)| NodeId(i as u32))
            .collect()
    }

    /// Partition the live nodes: those in `keep` stay linked, everything
    /// else is released. Used between searches to retain the reusable
    /// subtree. Returns the released ids with their position links so the
    /// caller can detach them from the position cache.
    pub fn reset_retaining(&mut self, keep: &HashSet<NodeId>) -> Vec<(NodeId, PosId)> {
        let mut released = vec! [];

        for index in 0..self.slots.len() {
            let id = NodeId(index as u32);
            if self.slots[index].in_use && !keep.contains(&id) {
                released.push((id, self.slots[index].position));
                self.unlink(id);
            }
        }

        released
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn percent_full(&self) -> f32 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f32 / self.capacity as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(index: u32) -> PosId {
        PosId(index)
    }

    #[test]
    fn allocates_up_to_capacity() {
        let mut arena = NodeArena::new(3);

        let a = arena.new_node(None, pos(0)).unwrap();
        let b = arena.new_node(Some(a), pos(1)).unwrap();
        let _c = arena.new_node(Some(b), pos(2)).unwrap();

        assert_eq!(arena.used(), 3);
        assert!(arena.new_node(None, pos(3)).is_none());
    }

    #[test]
    fn unlink_recycles_slots() {
        let mut arena = NodeArena::new(2);

        let a = arena.new_node(None, pos(0)).unwrap();
        let _b = arena.new_node(Some(a), pos(1)).unwrap();
        arena.unlink(a);

        let c = arena.new_node(None, pos(2)).unwrap();
        assert_eq!(c, a, "freed slot is reused");
        assert_eq!(arena.used(), 2);
        assert!(arena.new_node(None, pos(3)).is_none());
    }

    #[test]
    fn reset_retains_only_kept_nodes() {
        let mut arena = NodeArena::new(4);

        let a = arena.new_node(None, pos(0)).unwrap();
        let b = arena.new_node(Some(a), pos(1)).unwrap();
        let c = arena.new_node(Some(a), pos(2)).unwrap();
        let d = arena.new_node(Some(b), pos(3)).unwrap();

        let keep: HashSet<NodeId> = [b, d].into_iter().collect();
        let released = arena.reset_retaining(&keep);

        assert_eq!(released.len(), 2);
        assert!(arena.is_live(b) && arena.is_live(d));
        assert!(!arena.is_live(a) && !arena.is_live(c));
        assert_eq!(arena.used(), 2);
    }

    #[test]
    fn reused_slot_is_reinitialized() {
        let mut arena = NodeArena::new(1);

        let a = arena.new_node(None, pos(0)).unwrap();
        arena.get_mut(a).visits = 42;
        arena.unlink(a);

        let b = arena.new_node(None, pos(5)).unwrap();
        assert_eq!(arena.get(b).visits, 0);
        assert_eq!(arena.get(b).position, pos(5));
    }
}
