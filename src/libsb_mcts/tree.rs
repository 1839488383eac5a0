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
use std::sync::{Mutex, MutexGuard};

use sb_chess::Game;

use crate::arena::NodeArena;
use crate::cache::{PosId, PositionCache};
use crate::history::History;
use crate::node::{Edge, Node, NodeId};
use crate::search::SearchSettings;

/// The shared search state: node arena, position cache, and the current
/// root, all guarded by one tree-level mutex. Workers hold the lock for
/// the duration of a playout descent or a batch write-back.
pub struct Tree {
    data: Mutex<TreeData>
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(TreeData::new(0))
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, TreeData> {
        self.data.lock().expect("tree lock poisoned")
    }
}

pub struct TreeData {
    pub arena: NodeArena,
    pub cache: PositionCache,
    pub root: Option<NodeId>,
    pub settings: SearchSettings
}

impl TreeData {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            arena: NodeArena::new(capacity),
            cache: PositionCache::new(capacity),
            root: None,
            settings: SearchSettings::default()
        }
    }

    /// Drop everything and re-size both pools. The arena and the cache
    /// share one capacity, the way one node references one position.
    pub fn reset(&mut self, capacity: usize) {
        self.arena = NodeArena::new(capacity);
        self.cache = PositionCache::new(capacity);
        self.root = None;
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.arena.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.arena.get_mut(id)
    }

    pub fn game_of(&self, id: NodeId) -> &Game {
        &self.cache.record(self.node(id).position).game
    }

    pub fn depth_of(&self, id: NodeId) -> i32 {
        let mut depth = 0;
        let mut parent = self.node(id).parent;
        while let Some(id) = parent {
            depth += 1;
            parent = self.node(id).parent;
        }
        depth
    }

    /// Allocate a position record, evicting unpinned LRU entries as
    /// needed. Any nodes still referencing an evicted record are
    /// collapsed back into potential edges on their parents.
    pub fn new_position(&mut self, key: u64, game: Game) -> Option<PosId> {
        let (id, orphans) = self.cache.new_entry(key, game, false)?;
        for orphan in orphans {
            self.collapse_node(orphan);
        }
        Some(id)
    }

    /// Find or create the record for `game`, coalescing transpositions
    /// and re-keying genuine hash collisions.
    fn position_for(&mut self, game: Game) -> Option<PosId> {
        let key = game.zobrist();

        match self.cache.get(key) {
            Some(existing)
                if !self.cache.record(existing).unique
                    && self.cache.record(existing).game.is_same_position(&game) =>
            {
                Some(existing)
            },
            Some(existing) => {
                // two different positions under one key: keep both, the
                // resident entry moves to a perturbed key
                self.cache.make_unique(existing);
                self.new_position(key, game)
            },
            None => self.new_position(key, game)
        }
    }

    /// Start a fresh tree rooted at `game`.
    pub fn new_root(&mut self, game: Game) -> Option<NodeId> {
        debug_assert!(self.root.is_none());

        let repetitions = game.repetitions();
        let position = self.position_for(game)?;
        self.cache.record_mut(position).game.set_repetitions(repetitions);

        let id = self.arena.new_node(None, position)?;
        self.cache.attach_node(position, id);
        self.root = Some(id);
        Some(id)
    }

    /// Materialize the potential edge at `edge_index` of `parent` into a
    /// real node. Returns `None` when the arena or cache is exhausted.
    pub fn embody(&mut self, parent: NodeId, edge_index: usize) -> Option<NodeId> {
        let (mv, p) = match self.node(parent).edges[edge_index] {
            Edge::Potential { mv, p } => (mv, p),
            Edge::Embodied { node, .. } => return Some(node)
        };

        let parent_position = self.node(parent).position;
        let game = self.cache.record(parent_position).game.make_move(mv);
        let position = self.position_for(game)?;

        let node = self.arena.new_node(Some(parent), position)?;
        self.cache.attach_node(position, node);
        self.node_mut(node).p_value = p;
        self.node_mut(parent).edges[edge_index] = Edge::Embodied { mv, p, node };
        Some(node)
    }

    /// Revert the parent's reference to a potential edge, then release
    /// the node and everything below it.
    pub fn collapse_node(&mut self, id: NodeId) {
        if !self.arena.is_live(id) {
            return;
        }

        if let Some(parent) = self.node(id).parent {
            if self.arena.is_live(parent) {
                for edge in self.node_mut(parent).edges.iter_mut() {
                    if let Edge::Embodied { mv, p, node } = *edge {
                        if node == id {
                            *edge = Edge::Potential { mv, p };
                            break;
                        }
                    }
                }
            }
        }

        self.release_subtree(id);
    }

    /// Return a whole subtree to the arena, detaching every node from its
    /// position record on the way.
    pub fn release_subtree(&mut self, id: NodeId) {
        let mut stack = vec! [id];
        while let Some(current) = stack.pop() {
            if !self.arena.is_live(current) {
                continue;
            }

            let edges = self.node(current).edges.clone();
            for edge in edges {
                if let Some(child) = edge.node() {
                    stack.push(child);
                }
            }

            let position = self.node(current).position;
            self.cache.detach_node(position, current);
            self.arena.unlink(current);
        }
    }

    /// Make `new_root` the root, retaining only its subtree. Everything
    /// else goes back to the free lists; orphaned position records unpin
    /// and age out of the cache on their own.
    pub fn rebase(&mut self, new_root: NodeId) {
        if let Some(parent) = self.node(new_root).parent {
            self.node_mut(parent).edges.retain(|edge| edge.node() != Some(new_root));
            self.node_mut(new_root).parent = None;
        }

        let mut keep = HashSet::new();
        let mut stack = vec! [new_root];
        while let Some(current) = stack.pop() {
            if !keep.insert(current) {
                continue;
            }
            for edge in &self.node(current).edges {
                if let Some(child) = edge.node() {
                    stack.push(child);
                }
            }
        }

        let released = self.arena.reset_retaining(&keep);
        for (node, position) in released {
            self.cache.detach_node(position, node);
        }
        self.root = Some(new_root);
    }

    /// Drop the whole tree, keeping the cache contents around as
    /// transposition fodder.
    pub fn clear_tree(&mut self) {
        let released = self.arena.reset_retaining(&HashSet::new());
        for (node, position) in released {
            self.cache.detach_node(position, node);
        }
        self.root = None;
    }

    /// How often this node's position occurred before it, walking the
    /// tree path first and the game history beyond the root. Capped at 2,
    /// cached on the position record.
    pub fn repetitions(&mut self, id: NodeId) -> i8 {
        let position = self.node(id).position;
        let cached = self.cache.record(position).game.repetitions();
        if cached != -1 {
            return cached;
        }

        let me = self.cache.record(position).game.clone();
        let mut count: i8 = 0;
        let mut stopped = false;

        let mut parent = self.node(id).parent;
        while let Some(pid) = parent {
            let game = self.game_of(pid);
            if me.is_same_position(game) {
                count += 1;
            }
            if count >= 2 || game.half_move_clock() == 0 {
                stopped = true;
                break;
            }
            parent = self.node(pid).parent;
        }

        if !stopped {
            let history = History::global().games();
            // the last history entry is the root itself
            let shared = history.len().saturating_sub(1);
            for game in history[..shared].iter().rev() {
                if me.is_same_position(game) {
                    count += 1;
                }
                if count >= 2 || game.half_move_clock() == 0 {
                    break;
                }
            }
        }

        self.cache.record_mut(position).game.set_repetitions(count);
        count
    }

    /// The games feeding the NN history planes: this node's position
    /// first, then its predecessors from the tree path and the game
    /// history.
    pub fn history_games(&self, id: NodeId, limit: usize) -> Vec<Game> {
        let mut games = vec! [self.game_of(id).clone()];

        let mut parent = self.node(id).parent;
        while let Some(pid) = parent {
            if games.len() >= limit {
                return games;
            }
            games.push(self.game_of(pid).clone());
            parent = self.node(pid).parent;
        }

        let history = History::global().games();
        let shared = history.len().saturating_sub(1);
        for game in history[..shared].iter().rev() {
            if games.len() >= limit {
                break;
            }
            games.push(game.clone());
        }

        games
    }

    pub fn percent_full(&self) -> f32 {
        self.arena.percent_full()
    }

    /// Depth-limited dump of the tree for the `tree` debug command.
    pub fn format_tree(&self, max_depth: i32) -> String {
        let mut out = String::new();
        if let Some(root) = self.root {
            self.format_node(root, 0, max_depth, &mut out);
        }
        out
    }

    fn format_node(&self, id: NodeId, depth: i32, max_depth: i32, out: &mut String) {
        use std::fmt::Write;

        let node = self.node(id);
        let game = self.game_of(id);
        let mv = match game.last_move() {
            Some(_) => game.last_move_uci(),
            None => "start".into()
        };
        writeln!(
            out,
            "{}{} n: {} p: {:.2}% q: {:.5} v: {:.4}",
            "      |".repeat(depth as usize),
            mv,
            node.visits + node.virtual_loss,
            node.p_value.max(0.0) * 100.0,
            node.q_value,
            node.raw_q_value
        ).unwrap();

        if depth < max_depth {
            let mut children: Vec<NodeId> = node.edges.iter()
                .filter_map(|edge| edge.node())
                .collect();
            children.sort_by(|&a, &b| {
                self.node(b).visits.cmp(&self.node(a).visits)
            });
            for child in children {
                self.format_node(child, depth + 1, max_depth, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::UNSCORED;

    fn scored_root(data: &mut TreeData, game: Game) -> NodeId {
        let mut game = game;
        if game.repetitions() == -1 {
            game.set_repetitions(0);
        }
        let root = data.new_root(game).unwrap();
        data.node_mut(root).set_scoring_or_scored();
        data.generate_edges(root);
        let count = data.node(root).edges.len().max(1);
        let p = 1.0 / count as f32;
        data.node_mut(root).raw_q_value = 0.0;
        for edge in data.node_mut(root).edges.iter_mut() {
            edge.set_p(p);
        }
        data.set_q_and_propagate(root);
        root
    }

    #[test]
    fn embodied_child_position_follows_the_move() {
        let tree = Tree::new();
        let mut data = tree.lock();
        data.reset(256);
        let root = scored_root(&mut data, Game::starting_position());

        let mv = data.node(root).edges[0].mv();
        let child = data.embody(root, 0).unwrap();

        let expected = Game::starting_position().make_move(mv);
        let actual = data.game_of(child);
        assert!(expected.is_same_position(actual));
        assert_eq!(expected.zobrist(), actual.zobrist());
        assert_eq!(data.node(child).parent, Some(root));
    }

    #[test]
    fn transpositions_share_a_record() {
        let tree = Tree::new();
        let mut data = tree.lock();
        data.reset(256);
        let root = scored_root(&mut data, Game::starting_position());

        // e2e4/e7e5/g1f3 and g1f3/e7e5/e2e4 reach the same position
        let mut a = root;
        for mv in ["e2e4", "e7e5", "g1f3"] {
            let index = edge_index_of(&data, a, mv);
            let child = data.embody(a, index).unwrap();
            prime(&mut data, child);
            a = child;
        }
        let mut b = root;
        for mv in ["g1f3", "e7e5", "e2e4"] {
            let index = edge_index_of(&data, b, mv);
            let child = data.embody(b, index).unwrap();
            prime(&mut data, child);
            b = child;
        }

        assert_ne!(a, b);
        assert_eq!(data.node(a).position, data.node(b).position);
        assert_eq!(data.cache.record(data.node(a).position).nodes.len(), 2);
    }

    #[test]
    fn rebase_retains_the_subtree() {
        let tree = Tree::new();
        let mut data = tree.lock();
        data.reset(256);
        let root = scored_root(&mut data, Game::starting_position());

        let child_index = edge_index_of(&data, root, "e2e4");
        let child = data.embody(root, child_index).unwrap();
        prime(&mut data, child);
        let reply_index = edge_index_of(&data, child, "e7e5");
        let grandchild = data.embody(child, reply_index).unwrap();
        prime(&mut data, grandchild);
        data.node_mut(grandchild).visits = 5;

        let other_index = edge_index_of(&data, root, "d2d4");
        let other = data.embody(root, other_index).unwrap();

        data.rebase(grandchild);

        assert_eq!(data.root, Some(grandchild));
        assert!(data.node(grandchild).is_root());
        assert_eq!(data.node(grandchild).visits, 5, "visit counts survive the rebase");
        assert!(!data.arena.is_live(root));
        assert!(!data.arena.is_live(child));
        assert!(!data.arena.is_live(other));
        assert_eq!(data.arena.used(), 1);
    }

    #[test]
    fn collapse_reverts_the_parent_edge() {
        let tree = Tree::new();
        let mut data = tree.lock();
        data.reset(256);
        let root = scored_root(&mut data, Game::starting_position());

        let index = edge_index_of(&data, root, "e2e4");
        let p_before = data.node(root).edges[index].p();
        let child = data.embody(root, index).unwrap();
        data.collapse_node(child);

        let edge = data.node(root).edges[index];
        assert!(edge.is_potential());
        assert_eq!(edge.p(), p_before);
        assert!(!data.arena.is_live(child));
    }

    #[test]
    fn repetitions_count_across_tree_and_history() {
        let history = History::global();
        history.clear();

        let mut game = Game::starting_position();
        history.add_game(game.clone());
        for mv in ["g1f3", "g8f6", "f3g1", "f6g8"] {
            game = game.apply_uci(mv).unwrap();
            history.add_game(game.clone());
        }

        let tree = Tree::new();
        let mut data = tree.lock();
        data.reset(256);
        let root = scored_root(&mut data, History::global().current_game());

        // shuffle the knights once more inside the tree
        let mut current = root;
        for mv in ["g1f3", "g8f6", "f3g1", "f6g8"] {
            let index = edge_index_of(&data, current, mv);
            let child = data.embody(current, index).unwrap();
            prime(&mut data, child);
            current = child;
        }

        assert_eq!(data.repetitions(current), 2);
        history.clear();
    }

    fn edge_index_of(data: &TreeData, id: NodeId, uci: &str) -> usize {
        let game = data.game_of(id).clone();
        data.node(id).edges.iter()
            .position(|edge| sb_chess::move_to_uci(&game, edge.mv()) == uci)
            .unwrap()
    }

    /// Score a node with uniform priors so selection can pass through it.
    fn prime(data: &mut TreeData, id: NodeId) {
        data.node_mut(id).set_scoring_or_scored();
        if data.node(id).edges.is_empty() {
            data.generate_edges(id);
        }
        let count = data.node(id).edges.len().max(1);
        let p = 1.0 / count as f32;
        if data.node(id).raw_q_value == UNSCORED {
            data.node_mut(id).raw_q_value = 0.0;
        }
        for edge in data.node_mut(id).edges.iter_mut() {
            edge.set_p(p);
        }
        data.set_q_and_propagate(id);
    }
}
