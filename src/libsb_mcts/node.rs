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

use std::sync::atomic::{AtomicBool, Ordering};

use ordered_float::OrderedFloat;
use sb_chess::tb::{Probe, TB};
use sb_chess::{move_to_uci, Move};

use crate::cache::PosId;
use crate::hash::HashEntry;
use crate::search::SearchSettings;
use crate::tree::TreeData;

pub const MAX_DEPTH: i32 = 127;

/// Sentinel for "no value yet". Every q/p field starts here and is only
/// ever assigned real values in `[-1 - ε, +1 + ε]`.
pub const UNSCORED: f32 = -2.0;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A child record: the move is always known, the node is materialized
/// lazily. The prior lives on the edge so selection never has to chase the
/// child; embodiment replaces the variant in place.
#[derive(Clone, Copy, Debug)]
pub enum Edge {
    Potential { mv: Move, p: f32 },
    Embodied { mv: Move, p: f32, node: NodeId }
}

impl Edge {
    pub fn mv(&self) -> Move {
        match *self {
            Edge::Potential { mv, .. } | Edge::Embodied { mv, .. } => mv
        }
    }

    pub fn p(&self) -> f32 {
        match *self {
            Edge::Potential { p, .. } | Edge::Embodied { p, .. } => p
        }
    }

    pub fn has_p(&self) -> bool {
        self.p() != UNSCORED
    }

    pub fn set_p(&mut self, value: f32) {
        match self {
            Edge::Potential { p, .. } | Edge::Embodied { p, .. } => *p = value
        }
    }

    pub fn node(&self) -> Option<NodeId> {
        match *self {
            Edge::Embodied { node, .. } => Some(node),
            Edge::Potential { .. } => None
        }
    }

    pub fn is_potential(&self) -> bool {
        matches!(self, Edge::Potential { .. })
    }
}

/// A vertex of the search tree. Values are stored from the perspective of
/// the side that just moved into this position; the sign flips on every
/// level of back-propagation.
#[derive(Debug)]
pub struct Node {
    pub parent: Option<NodeId>,
    pub position: PosId,
    pub edges: Vec<Edge>,
    pub visits: u32,
    pub virtual_loss: u32,
    pub q_value: f32,
    pub raw_q_value: f32,
    pub p_value: f32,
    /// Sum of the priors of children visited at least once; feeds the
    /// first-play-urgency reduction.
    pub policy_sum: f32,
    pub is_exact: bool,
    pub is_tb: bool,
    pub(crate) in_use: bool,
    scoring_or_scored: AtomicBool
}

impl Node {
    pub(crate) fn new(parent: Option<NodeId>, position: PosId) -> Self {
        Self {
            parent,
            position,
            edges: vec! [],
            visits: 0,
            virtual_loss: 0,
            q_value: UNSCORED,
            raw_q_value: UNSCORED,
            p_value: UNSCORED,
            policy_sum: 0.0,
            is_exact: false,
            is_tb: false,
            in_use: true,
            scoring_or_scored: AtomicBool::new(false)
        }
    }

    pub(crate) fn reinit(&mut self, parent: Option<NodeId>, position: PosId) {
        *self = Node::new(parent, position);
    }

    pub(crate) fn deinit(&mut self) {
        self.edges.clear();
        self.in_use = false;
    }

    pub fn has_q_value(&self) -> bool {
        self.q_value != UNSCORED
    }

    pub fn has_raw_q_value(&self) -> bool {
        self.raw_q_value != UNSCORED
    }

    pub fn has_p_value(&self) -> bool {
        self.p_value != UNSCORED
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Claim this node for evaluation. Returns the previous state of the
    /// flag: the thread that observes `false` owns the evaluation, every
    /// other thread skips.
    pub fn set_scoring_or_scored(&self) -> bool {
        self.scoring_or_scored.swap(true, Ordering::AcqRel)
    }

    /// A node another worker has claimed but not yet scored.
    pub fn is_already_playing_out(&self) -> bool {
        self.virtual_loss > 0 && !self.has_q_value()
    }

    /// A node with no candidate edges carrying priors: nothing to select
    /// into until an evaluation lands.
    pub fn is_not_extendable(&self) -> bool {
        !self.edges.iter().any(|edge| edge.has_p())
    }

    pub(crate) fn increment_visited(&mut self) {
        self.virtual_loss = 0;
        self.visits += 1;
    }
}

/// Budgets one batch-building pass is allowed to burn before giving up on
/// the tree. Persist across the playouts of a single batch.
pub struct PlayoutLimits {
    pub vld_max: i32,
    pub try_playout_limit: i32
}

impl PlayoutLimits {
    pub fn from_settings(settings: &SearchSettings) -> Self {
        Self {
            vld_max: settings.vld_max,
            try_playout_limit: settings.try_playout_limit
        }
    }
}

pub enum PlayoutOutcome {
    /// A claimed leaf to evaluate, with its depth and whether any node was
    /// created on the way down.
    Found { node: NodeId, depth: i32, created: bool },
    /// Try or virtual-loss budget exhausted; other workers already cover
    /// this subtree.
    Exhausted,
    /// Arena or cache full of pinned entries; the playout was rolled back.
    AllocFailed
}

#[derive(Clone, Copy)]
struct EdgeView {
    index: usize,
    q: f32,
    p: f32,
    score: f32
}

/// The number of virtual-loss increments that would drop the leader below
/// the runner-up, from
/// `score = q + u_coeff * p / (n + 1)` solved for `n`.
fn virtual_loss_distance(best_score: f32, u_coeff: f32, second: &EdgeView) -> i32 {
    let q = second.q;
    let p = second.p;

    if (best_score - q).abs() < 1e-6 {
        1
    } else if q > best_score {
        9999
    } else {
        let n = -(q + p * u_coeff - best_score) / (best_score - q);
        (n.ceil() as i32).max(0)
    }
}

impl TreeData {
    /// The exploration coefficient of a parent node,
    /// `(cpuct_init + cpuct_f * log((1 + N + base) / base)) * sqrt(N)`.
    pub fn u_coeff(&self, id: NodeId) -> f32 {
        let settings = &self.settings;
        let n = self.node(id).visits.max(1) as f32;
        let growth = settings.cpuct_f * ((1.0 + n + settings.cpuct_base) / settings.cpuct_base).ln();

        (settings.cpuct_init + growth) * n.sqrt()
    }

    /// First-play urgency: what an unvisited child of `id` is worth.
    pub fn q_value_default(&self, id: NodeId) -> f32 {
        let policy_sum = self.node(id).policy_sum.max(0.0);

        -self.q_value_of(id) - self.settings.fpu_reduction * policy_sum.sqrt()
    }

    /// The value of a node as selection sees it, falling back to the
    /// parent's first-play urgency while unvisited.
    pub fn q_value_of(&self, id: NodeId) -> f32 {
        let node = self.node(id);
        if node.is_root() || node.visits > 0 {
            return node.q_value;
        }

        let parent = node.parent.unwrap();
        if self.node(parent).is_root() {
            1.0
        } else {
            self.q_value_default(parent)
        }
    }

    fn select_edges(&self, id: NodeId) -> (Option<EdgeView>, Option<EdgeView>) {
        let u_coeff = self.u_coeff(id);
        let fpu = self.q_value_default(id);

        let mut best: Option<EdgeView> = None;
        let mut second: Option<EdgeView> = None;
        for (index, edge) in self.node(id).edges.iter().enumerate() {
            if !edge.has_p() {
                continue;
            }

            let p = edge.p();
            let (q, u) = match edge.node() {
                None => (fpu, u_coeff * p),
                Some(child) => {
                    let child_node = self.node(child);
                    let n = child_node.visits + child_node.virtual_loss;
                    (self.q_value_of(child), u_coeff * p / (n as f32 + 1.0))
                }
            };

            let view = EdgeView { index, q, p, score: q + u };
            match best {
                Some(current) if view.score <= current.score => {
                    if second.map_or(true, |s| view.score > s.score) {
                        second = Some(view);
                    }
                },
                _ => {
                    second = best;
                    best = Some(view);
                }
            }
        }

        (best, second)
    }

    /// One descent from the root: claim a leaf, inflating virtual loss on
    /// the way down so concurrent workers spread out. Restarts from the
    /// root when it runs into a subtree that is already being scored,
    /// skipping ahead by the virtual-loss distance.
    pub fn playout(&mut self, limits: &mut PlayoutLimits) -> PlayoutOutcome {
        let root = match self.root {
            Some(root) => root,
            None => return PlayoutOutcome::Exhausted
        };

        'restart: loop {
            let mut depth = 0;
            let mut vld = limits.vld_max;
            let mut current = root;
            let mut created_any = false;
            let mut path: Vec<(NodeId, u32)> = vec! [];

            loop {
                depth += 1;

                {
                    let node = self.node_mut(current);

                    // an unscored or exact node is our playout node
                    if !node.set_scoring_or_scored() || node.is_exact {
                        node.virtual_loss += 1;
                        return PlayoutOutcome::Found { node: current, depth, created: created_any };
                    }

                    let already = node.is_already_playing_out();
                    let increment = if already { (vld - 1).max(0) as u32 } else { 1 };
                    node.virtual_loss += increment;
                    path.push((current, increment));

                    if already || node.is_not_extendable() {
                        limits.try_playout_limit -= 1;
                        if limits.try_playout_limit <= 0 {
                            return PlayoutOutcome::Exhausted;
                        }
                        limits.vld_max -= node.virtual_loss as i32;
                        if limits.vld_max <= 0 {
                            return PlayoutOutcome::Exhausted;
                        }
                        continue 'restart;
                    }
                }

                let (best, second) = self.select_edges(current);
                let best = match best {
                    Some(best) => best,
                    None => return PlayoutOutcome::Exhausted
                };
                if let Some(second) = second {
                    let vld_new = virtual_loss_distance(best.score, self.u_coeff(current), &second);
                    vld = if vld == 0 { vld_new } else { vld.min(vld_new) };
                }

                current = match self.node(current).edges[best.index] {
                    Edge::Embodied { node, .. } => node,
                    Edge::Potential { .. } => {
                        match self.embody(current, best.index) {
                            Some(child) => {
                                created_any = true;
                                child
                            },
                            None => {
                                // roll back our virtual loss and give up
                                for (id, increment) in path {
                                    let node = self.node_mut(id);
                                    node.virtual_loss = node.virtual_loss.saturating_sub(increment);
                                }
                                return PlayoutOutcome::AllocFailed;
                            }
                        }
                    }
                };
            }
        }
    }

    /// Terminal detection and candidate generation for a claimed playout
    /// node. Returns true on a tablebase hit. Exactness is recorded on the
    /// node; the caller decides whether to propagate or fetch.
    pub fn generate_edges(&mut self, id: NodeId) -> bool {
        debug_assert!(self.node(id).edges.is_empty());
        let game = self.cache.record(self.node(id).position).game.clone();

        if game.half_move_clock() >= 100 || game.is_dead_position() || self.repetitions(id) >= 2 {
            let node = self.node_mut(id);
            node.raw_q_value = 0.0;
            node.is_exact = true;
            return false;
        }

        if !self.node(id).is_root() {
            let probe = TB::global().probe(&game);
            if probe != Probe::NotFound {
                let node = self.node_mut(id);
                node.raw_q_value = match probe {
                    Probe::Win => 1.0,
                    Probe::Loss => -1.0,
                    _ => 0.0
                };
                node.is_exact = true;
                node.is_tb = true;
                return true;
            }
        }

        let moves = game.legal_moves();
        if moves.is_empty() {
            let depth = self.depth_of(id);
            let node = self.node_mut(id);
            if game.is_in_check() {
                // checkmate, biased so nearer mates score higher
                node.raw_q_value = 1.0 + (MAX_DEPTH - depth) as f32 * 1e-4;
            } else {
                node.raw_q_value = 0.0;
            }
            node.is_exact = true;
            return false;
        }

        self.node_mut(id).edges = moves.into_iter()
            .map(|mv| Edge::Potential { mv, p: UNSCORED })
            .collect();
        false
    }

    /// Copy a cached evaluation onto this node. Returns false when the
    /// entry does not cover every candidate (a colliding position), in
    /// which case nothing is written.
    pub fn fill_out(&mut self, id: NodeId, entry: &HashEntry) -> bool {
        let mut priors = Vec::with_capacity(self.node(id).edges.len());
        for edge in &self.node(id).edges {
            match entry.prior(&edge.mv()) {
                Some(p) => priors.push(p),
                None => return false
            }
        }

        let q = entry.q;
        let node = self.node_mut(id);
        node.raw_q_value = q;
        for (edge, p) in node.edges.iter_mut().zip(priors) {
            edge.set_p(p);
        }

        let children: Vec<(NodeId, f32)> = self.node(id).edges.iter()
            .filter_map(|edge| edge.node().map(|child| (child, edge.p())))
            .collect();
        for (child, p) in children {
            self.node_mut(child).p_value = p;
        }
        true
    }

    pub fn sort_edges_by_p(&mut self, id: NodeId) {
        self.node_mut(id).edges
            .sort_by_key(|edge| std::cmp::Reverse(OrderedFloat(edge.p())));
    }

    fn back_propagate_value(&mut self, id: NodeId, v: f32) {
        let node = self.node_mut(id);
        let current = if node.has_q_value() { node.q_value } else { 0.0 };
        let n = node.visits.max(1) as f32;

        if !node.is_exact {
            node.q_value = (n * current + v) / (n + 1.0);
        }
        node.increment_visited();
    }

    /// Install the raw value as this node's first visit and propagate it
    /// to the root, flipping sign at each level.
    pub fn set_q_and_propagate(&mut self, id: NodeId) {
        debug_assert!(self.node(id).has_raw_q_value());

        let first_visit = self.node(id).visits == 0;
        {
            let node = self.node_mut(id);
            node.increment_visited();
            node.q_value = node.raw_q_value;
        }

        if first_visit {
            if let Some(parent) = self.node(id).parent {
                let p = self.node(id).p_value;
                if p != UNSCORED {
                    self.node_mut(parent).policy_sum += p;
                }
            }
        }

        let mut v = self.node(id).q_value;
        let mut parent = self.node(id).parent;
        while let Some(id) = parent {
            v = -v;
            self.back_propagate_value(id, v);
            parent = self.node(id).parent;
        }
    }

    /// The minimax overlay: walks the tree and marks every node whose
    /// children are all exact as itself exact, carrying the negated
    /// maximum child value. This is how mates and forced draws become
    /// proven instead of sampled.
    pub fn minimax(&mut self, id: NodeId) -> bool {
        let node = self.node(id);
        if !node.has_raw_q_value() {
            return false;
        }
        if node.edges.is_empty() {
            return node.is_exact;
        }

        let has_potential = node.edges.iter().any(|edge| edge.is_potential());
        let children: Vec<NodeId> = node.edges.iter()
            .filter_map(|edge| edge.node())
            .collect();

        let mut all_exact = !has_potential && !children.is_empty();
        let mut best = f32::NEG_INFINITY;
        for child in children {
            if self.minimax(child) {
                best = best.max(self.node(child).raw_q_value);
            } else {
                all_exact = false;
            }
        }

        if all_exact && !self.node(id).is_exact {
            let node = self.node_mut(id);
            node.is_exact = true;
            node.raw_q_value = -best;
            node.q_value = -best;
        }
        self.node(id).is_exact
    }

    /// Ordering for reporting: by visits, ties broken by prior for
    /// unvisited nodes and by value otherwise.
    fn greater_than(&self, a: NodeId, b: NodeId) -> bool {
        let (na, nb) = (self.node(a), self.node(b));
        if na.visits == nb.visits {
            if na.visits == 0 {
                na.p_value > nb.p_value
            } else {
                na.q_value > nb.q_value
            }
        } else {
            na.visits > nb.visits
        }
    }

    pub fn best_child(&self, id: NodeId) -> Option<NodeId> {
        let mut best: Option<NodeId> = None;
        for edge in &self.node(id).edges {
            if let Some(child) = edge.node() {
                if best.map_or(true, |current| self.greater_than(child, current)) {
                    best = Some(child);
                }
            }
        }
        best
    }

    pub fn top_two_children(&self, id: NodeId) -> (Option<NodeId>, Option<NodeId>) {
        let mut first: Option<NodeId> = None;
        let mut second: Option<NodeId> = None;
        for edge in &self.node(id).edges {
            if let Some(child) = edge.node() {
                if first.map_or(true, |f| self.greater_than(child, f)) {
                    second = first;
                    first = Some(child);
                } else if second.map_or(true, |s| self.greater_than(child, s)) {
                    second = Some(child);
                }
            }
        }
        (first, second)
    }

    /// The line the engine currently believes in, as UCI move text.
    /// `depth` counts the nodes along it (the root included); `is_tb` is
    /// set when the line runs through tablebase territory.
    pub fn principal_variation(&self, depth: &mut i32, is_tb: &mut bool) -> String {
        let mut out: Vec<String> = vec! [];
        let mut current = match self.root {
            Some(root) => root,
            None => return String::new()
        };
        *depth = 1;

        loop {
            *is_tb |= self.node(current).is_tb;

            let best = self.best_child(current);
            let child = match best {
                Some(child) if self.node(child).has_p_value() => child,
                _ => break
            };

            let mv = self.node(current).edges.iter()
                .find(|edge| edge.node() == Some(child))
                .map(|edge| edge.mv())
                .unwrap();
            let game = &self.cache.record(self.node(current).position).game;
            out.push(move_to_uci(game, mv));
            *depth += 1;
            current = child;
        }

        out.join(" ")
    }
}
