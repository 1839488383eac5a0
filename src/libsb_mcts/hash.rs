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
use std::sync::Mutex;

use sb_chess::Move;

/// Approximate memory footprint of one entry, used to translate the `Hash`
/// option (MiB) into an entry budget.
const BYTES_PER_ENTRY: usize = 416;

const NIL: u32 = u32::MAX;

fn move_code(mv: &Move) -> u16 {
    let from = mv.from().map(u8::from).unwrap_or(0);
    let to = u8::from(mv.to());
    let promotion = mv.promotion().map(|role| role as u16).unwrap_or(0);

    u16::from(from) | u16::from(to) << 6 | promotion << 12
}

/// A network evaluation remembered across transpositions: the raw value
/// plus the prior of every candidate move.
#[derive(Clone, Debug, PartialEq)]
pub struct HashEntry {
    pub q: f32,
    priors: Vec<(u16, f32)>
}

impl HashEntry {
    pub fn new(q: f32, priors: Vec<(Move, f32)>) -> Self {
        Self {
            q,
            priors: priors.into_iter()
                .map(|(mv, p)| (move_code(&mv), p))
                .collect()
        }
    }

    pub fn prior(&self, mv: &Move) -> Option<f32> {
        let code = move_code(mv);
        self.priors.iter()
            .find(|&&(c, _)| c == code)
            .map(|&(_, p)| p)
    }
}

struct HashSlot {
    key: u64,
    entry: HashEntry,
    previous: u32,
    next: u32,
    pinned: bool,
    in_use: bool
}

struct HashState {
    slots: Vec<HashSlot>,
    map: HashMap<u64, u32>,
    free: Vec<u32>,
    capacity: usize,
    used: usize,
    head: u32,
    tail: u32
}

/// The process-wide transposition hash: Zobrist key to cached
/// (value, priors). Bounded, LRU-evicting, pin-aware; `reset` sizes it
/// from the `Hash` option at `ucinewgame`.
pub struct Hash {
    state: Mutex<HashState>
}

lazy_static! {
    static ref HASH: Hash = Hash {
        state: Mutex::new(HashState::new(0))
    };
}

impl HashState {
    fn new(capacity: usize) -> Self {
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

    fn allocate(&mut self) -> Option<u32> {
        if let Some(index) = self.free.pop() {
            return Some(index);
        }
        if self.slots.len() < self.capacity {
            self.slots.push(HashSlot {
                key: 0,
                entry: HashEntry { q: 0.0, priors: vec! [] },
                previous: NIL,
                next: NIL,
                pinned: false,
                in_use: false
            });
            return Some(self.slots.len() as u32 - 1);
        }

        // recycle the least recently used unpinned entry
        let mut cursor = self.tail;
        while cursor != NIL && self.slots[cursor as usize].pinned {
            cursor = self.slots[cursor as usize].previous;
        }
        if cursor == NIL {
            return None;
        }

        let key = self.slots[cursor as usize].key;
        self.map.remove(&key);
        self.detach(cursor);
        self.slots[cursor as usize].in_use = false;
        self.used -= 1;
        Some(cursor)
    }
}

impl Hash {
    pub fn global() -> &'static Hash {
        &HASH
    }

    /// Size the table to hold `mib` mebibytes worth of entries, dropping
    /// everything currently stored.
    pub fn reset(&self, mib: usize) {
        let capacity = (mib * 1024 * 1024 / BYTES_PER_ENTRY).max(1);
        *self.state.lock().unwrap() = HashState::new(capacity);
    }

    pub fn contains(&self, key: u64) -> bool {
        self.state.lock().unwrap().map.contains_key(&key)
    }

    /// Fetch a copy of the cached evaluation, refreshing its LRU slot.
    pub fn get(&self, key: u64) -> Option<HashEntry> {
        let mut state = self.state.lock().unwrap();
        let index = *state.map.get(&key)?;
        state.detach(index);
        state.attach_front(index);
        Some(state.slots[index as usize].entry.clone())
    }

    /// Store an evaluation. Overwrites any previous entry for the key;
    /// silently drops the insert when the table is fully pinned.
    pub fn insert(&self, key: u64, entry: HashEntry) {
        let mut state = self.state.lock().unwrap();

        if let Some(&index) = state.map.get(&key) {
            state.slots[index as usize].entry = entry;
            state.detach(index);
            state.attach_front(index);
            return;
        }

        let index = match state.allocate() {
            Some(index) => index,
            None => return
        };
        state.slots[index as usize].key = key;
        state.slots[index as usize].entry = entry;
        state.slots[index as usize].pinned = false;
        state.slots[index as usize].in_use = true;
        state.map.insert(key, index);
        state.attach_front(index);
        state.used += 1;
    }

    pub fn pin(&self, key: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(&index) = state.map.get(&key) {
            state.slots[index as usize].pinned = true;
        }
    }

    pub fn unpin(&self, key: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(&index) = state.map.get(&key) {
            state.slots[index as usize].pinned = false;
        }
    }

    pub fn clear_pins(&self) {
        let mut state = self.state.lock().unwrap();
        for slot in state.slots.iter_mut() {
            slot.pinned = false;
        }
    }

    pub fn used(&self) -> usize {
        self.state.lock().unwrap().used
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().capacity
    }

    /// Occupancy in permille, for the `hashfull` info field.
    pub fn permille_full(&self) -> u32 {
        let state = self.state.lock().unwrap();
        if state.capacity == 0 {
            return 0;
        }
        (state.used * 1000 / state.capacity) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_chess::Game;

    fn hash_with_capacity(capacity: usize) -> Hash {
        Hash { state: Mutex::new(HashState::new(capacity)) }
    }

    fn entry_for(game: &Game, q: f32) -> HashEntry {
        let moves = game.legal_moves();
        let p = 1.0 / moves.len() as f32;
        HashEntry::new(q, moves.into_iter().map(|mv| (mv, p)).collect())
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let hash = hash_with_capacity(8);
        let game = Game::starting_position();
        let entry = entry_for(&game, 0.125);

        hash.insert(game.zobrist(), entry.clone());
        let cached = hash.get(game.zobrist()).unwrap();

        assert_eq!(cached.q.to_bits(), entry.q.to_bits());
        for mv in game.legal_moves() {
            assert_eq!(cached.prior(&mv), entry.prior(&mv));
        }
    }

    #[test]
    fn unknown_key_misses() {
        let hash = hash_with_capacity(4);

        assert!(!hash.contains(42));
        assert!(hash.get(42).is_none());
    }

    #[test]
    fn lru_eviction_under_pressure() {
        let hash = hash_with_capacity(2);
        let game = Game::starting_position();

        hash.insert(1, entry_for(&game, 0.0));
        hash.insert(2, entry_for(&game, 0.0));
        hash.get(1); // 2 is now least recently used
        hash.insert(3, entry_for(&game, 0.0));

        assert!(hash.contains(1));
        assert!(!hash.contains(2));
        assert!(hash.contains(3));
    }

    #[test]
    fn pinned_entries_are_not_recycled() {
        let hash = hash_with_capacity(2);
        let game = Game::starting_position();

        hash.insert(1, entry_for(&game, 0.0));
        hash.insert(2, entry_for(&game, 0.0));
        hash.pin(1);
        hash.pin(2);
        hash.insert(3, entry_for(&game, 0.0));

        assert!(!hash.contains(3));
        hash.unpin(2);
        hash.insert(3, entry_for(&game, 0.0));
        assert!(hash.contains(3));
    }

    #[test]
    fn unknown_move_has_no_prior() {
        let game = Game::starting_position();
        let after = game.apply_uci("e2e4").unwrap();
        let entry = entry_for(&game, 0.0);

        let reply = after.legal_moves()[0];
        assert_eq!(entry.prior(&reply), None);
    }
}
