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

use std::collections::HashMap;

use sb_chess::Game;

use crate::node::NodeId;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PosId(pub(crate) u32);

impl PosId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

const NIL: u32 = u32::MAX;

/// A chess state shared by every node that reached it, keyed by Zobrist
/// hash. The `nodes` list enables transposition coalescing and the
/// eviction cascade; `unique` marks entries re-keyed after a hash
/// collision so later visitors do not coalesce with them.
pub struct PositionRecord {
    pub game: Game,
    pub nodes: Vec<NodeId>,
    pub unique: bool,
    pub key: u64
}

struct Slot {
    record: PositionRecord,
    previous: u32,
    next: u32,
    pinned: bool,
    in_use: bool
}

/// A bounded Zobrist-keyed store of `PositionRecord`s with LRU eviction.
/// Pinned entries are never evicted; when every entry is pinned a new
/// allocation fails and the caller aborts its playout.
pub struct PositionCache {
    slots: Vec<Slot>,
    map: HashMap<u64, u32>,
    free: Vec<u32>,
    capacity: usize,
    used: usize,
    head: u32, // most recently used
    tail: u32  // least recently used
}

impl PositionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec! [],
            map: HashMap::new(),
            free: vec! [],
            capacity,
            used: 0,
            head: NIL,
            tail: NIL
        }
    }

    pub fn contains(&self, key: u64) -> bool {
        self.map.contains_key(&key)
    }

    /// Look up an entry and move it to the MRU end.
    pub fn get(&mut self, key: u64) -> Option<PosId> {
        let index = *self.map.get(&key)?;
        self.detach(index);
        self.attach_front(index);
        Some(PosId(index))
    }

    /// Look up without disturbing the LRU order.
    pub fn peek(&self, key: u64) -> Option<PosId> {
        self.map.get(&key).map(|&index| PosId(index))
    }

    pub fn record(&self, id: PosId) -> &PositionRecord {
        debug_assert!(self.slots[id.index()].in_use);
        &self.slots[id.index()].record
    }

    pub fn record_mut(&mut self, id: PosId) -> &mut PositionRecord {
        debug_assert!(self.slots[id.index()].in_use);
        &mut self.slots[id.index()].record
    }

    /// Re-key an entry under an address-perturbed key that cannot collide
    /// with any real Zobrist hash, freeing its original key for a
    /// different position. Returns the new key.
    pub fn make_unique(&mut self, id: PosId) -> u64 {
        let index = id.index();
        let old_key = self.slots[index].record.key;
        let new_key = old_key ^ perturbation(id);

        if self.map.get(&old_key) == Some(&id.0) {
            self.map.remove(&old_key);
        }
        self.map.insert(new_key, id.0);
        self.slots[index].record.key = new_key;
        self.slots[index].record.unique = true;
        new_key
    }

    /// Allocate a fresh entry for `key`, evicting from the LRU end if
    /// needed. Returns `None` when the cache is full of pinned entries.
    /// Evicted entries must have been unpinned, which implies no live
    /// nodes still point at them; any stale ids are returned so the caller
    /// can collapse them.
    pub fn new_entry(&mut self, key: u64, game: Game, make_unique: bool) -> Option<(PosId, Vec<NodeId>)> {
        debug_assert!(!self.map.contains_key(&key) || make_unique);

        let mut orphans = vec! [];
        let index = match self.allocate_slot() {
            Some(index) => index,
            None => {
                let (index, stale) = self.evict_lru_unpinned()?;
                orphans = stale;
                index
            }
        };

        self.slots[index as usize].record = PositionRecord {
            game,
            nodes: vec! [],
            unique: false,
            key
        };
        self.slots[index as usize].pinned = false;
        self.slots[index as usize].in_use = true;
        self.attach_front(index);
        self.used += 1;

        let id = PosId(index);
        if make_unique {
            self.make_unique(id);
        } else {
            self.map.insert(key, index);
        }

        Some((id, orphans))
    }

    /// Drop an entry outright, returning its slot to the free list. Pinned
    /// entries are left alone.
    pub fn unlink(&mut self, key: u64) {
        let index = match self.map.get(&key) {
            Some(&index) => index,
            None => return
        };
        if self.slots[index as usize].pinned {
            return;
        }

        self.map.remove(&key);
        self.detach(index);
        self.release_slot(index);
    }

    pub fn pin(&mut self, id: PosId) {
        self.slots[id.index()].pinned = true;
    }

    pub fn unpin(&mut self, id: PosId) {
        self.slots[id.index()].pinned = false;
    }

    pub fn is_pinned(&self, id: PosId) -> bool {
        self.slots[id.index()].pinned
    }

    pub fn clear_pins(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.pinned = false;
        }
    }

    /// Register a node as pointing at this record. The record becomes
    /// pinned: entries with live nodes are never evicted.
    pub fn attach_node(&mut self, id: PosId, node: NodeId) {
        let slot = &mut self.slots[id.index()];
        slot.record.nodes.push(node);
        slot.pinned = true;
    }

    /// Remove a node from the record's list; the record unpins once no
    /// nodes remain, making it an evictable transposition entry.
    pub fn detach_node(&mut self, id: PosId, node: NodeId) {
        let slot = &mut self.slots[id.index()];
        slot.record.nodes.retain(|&n| n != node);
        if slot.record.nodes.is_empty() {
            slot.pinned = false;
        }
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

    fn allocate_slot(&mut self) -> Option<u32> {
        if let Some(index) = self.free.pop() {
            return Some(index);
        }
        if self.slots.len() < self.capacity {
            self.slots.push(Slot {
                record: PositionRecord {
                    game: Game::default(),
                    nodes: vec! [],
                    unique: false,
                    key: 0
                },
                previous: NIL,
                next: NIL,
                pinned: false,
                in_use: false
            });
            return Some(self.slots.len() as u32 - 1);
        }
        None
    }

    /// Walk the LRU tail past pinned entries and evict the first unpinned
    /// one found.
    fn evict_lru_unpinned(&mut self) -> Option<(u32, Vec<NodeId>)> {
        let mut cursor = self.tail;
        while cursor != NIL && self.slots[cursor as usize].pinned {
            cursor = self.slots[cursor as usize].previous;
        }
        if cursor == NIL {
            return None;
        }

        let key = self.slots[cursor as usize].record.key;
        self.map.remove(&key);
        self.detach(cursor);
        let stale = std::mem::take(&mut self.slots[cursor as usize].record.nodes);
        self.slots[cursor as usize].in_use = false;
        self.used -= 1;

        Some((cursor, stale))
    }

    fn release_slot(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.record.nodes.clear();
        slot.in_use = false;
        slot.pinned = false;
        self.free.push(index);
        self.used -= 1;
    }

    fn attach_front(&mut self, index: u32) {
        self.slots[index as usize].previous = NIL;
        self.slots[index as usize].next = self.head;
        if self.head != NIL {
            self.slots[self.head as usize].previous = index;
        }
        self.head = index;
        if self.tail == NIL {
            self.tail = index;
        }
    }

    fn detach(&mut self, index: u32) {
        let (previous, next) = {
            let slot = &self.slots[index as usize];
            (slot.previous, slot.next)
        };

        if previous != NIL {
            self.slots[previous as usize].next = next;
        } else if self.head == index {
            self.head = next;
        }
        if next != NIL {
            self.slots[next as usize].previous = previous;
        } else if self.tail == index {
            self.tail = previous;
        }

        self.slots[index as usize].previous = NIL;
        self.slots[index as usize].next = NIL;
    }
}

/// A slot-derived constant with high bits no Zobrist key collides into
/// cache lookups with, mixed the splitmix64 way.
fn perturbation(id: PosId) -> u64 {
    (u64::from(id.0) + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game() -> Game {
        Game::starting_position()
    }

    #[test]
    fn insert_and_get() {
        let mut cache = PositionCache::new(4);
        let (id, orphans) = cache.new_entry(1, game(), false).unwrap();

        assert!(orphans.is_empty());
        assert!(cache.contains(1));
        assert_eq!(cache.get(1), Some(id));
        assert_eq!(cache.used(), 1);
    }

    #[test]
    fn lru_entry_is_evicted_first() {
        let mut cache = PositionCache::new(2);
        cache.new_entry(1, game(), false).unwrap();
        cache.new_entry(2, game(), false).unwrap();

        // touch 1 so 2 becomes least recently used
        cache.get(1);
        cache.new_entry(3, game(), false).unwrap();

        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
    }

    #[test]
    fn pinned_entries_survive_eviction() {
        let capacity = 8;
        let pinned_count = 3;
        let mut cache = PositionCache::new(capacity);

        let mut pinned = vec! [];
        for key in 0..capacity as u64 {
            let (id, _) = cache.new_entry(key, game(), false).unwrap();
            if key < pinned_count as u64 {
                cache.pin(id);
                pinned.push(key);
            }
        }

        // allocate past capacity; only unpinned slots may be recycled
        for key in 100..100 + (capacity - pinned_count + 1) as u64 {
            assert!(cache.new_entry(key, game(), false).is_some());
        }

        for key in pinned {
            assert!(cache.contains(key), "pinned key {} was evicted", key);
        }
        assert_eq!(cache.used(), capacity);
    }

    #[test]
    fn all_pinned_fails_allocation() {
        let mut cache = PositionCache::new(2);
        for key in 0..2 {
            let (id, _) = cache.new_entry(key, game(), false).unwrap();
            cache.pin(id);
        }

        assert!(cache.new_entry(9, game(), false).is_none());

        // unpinning one makes room again
        let id = cache.peek(0).unwrap();
        cache.unpin(id);
        assert!(cache.new_entry(9, game(), false).is_some());
        assert!(!cache.contains(0));
    }

    #[test]
    fn make_unique_frees_the_original_key() {
        let mut cache = PositionCache::new(4);
        let (id, _) = cache.new_entry(7, game(), false).unwrap();

        let new_key = cache.make_unique(id);
        assert_ne!(new_key, 7);
        assert!(!cache.contains(7));
        assert!(cache.contains(new_key));
        assert!(cache.record(id).unique);

        // the original key is free for a different position
        let (other, _) = cache.new_entry(7, game(), false).unwrap();
        assert_ne!(other, id);
    }

    #[test]
    fn attach_detach_drives_pinning() {
        let mut cache = PositionCache::new(2);
        let (id, _) = cache.new_entry(1, game(), false).unwrap();

        cache.attach_node(id, NodeId(0));
        cache.attach_node(id, NodeId(1));
        assert!(cache.is_pinned(id));

        cache.detach_node(id, NodeId(0));
        assert!(cache.is_pinned(id));
        cache.detach_node(id, NodeId(1));
        assert!(!cache.is_pinned(id));
    }

    #[test]
    fn unlink_skips_pinned() {
        let mut cache = PositionCache::new(2);
        let (id, _) = cache.new_entry(1, game(), false).unwrap();
        cache.pin(id);

        cache.unlink(1);
        assert!(cache.contains(1));

        cache.unpin(id);
        cache.unlink(1);
        assert!(!cache.contains(1));
    }

    #[test]
    fn eviction_returns_stale_node_ids() {
        let mut cache = PositionCache::new(1);
        let (id, _) = cache.new_entry(1, game(), false).unwrap();
        cache.attach_node(id, NodeId(4));
        // simulate the search releasing the node without detaching
        cache.unpin(id);

        let (_, orphans) = cache.new_entry(2, game(), false).unwrap();
        assert_eq!(orphans, vec! [NodeId(4)]);
    }
}
