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
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;
use sb_chess::nn_index::move_to_index;
use sb_chess::Color;
use sb_nn::planes::{encode, InputPlanes, MOVE_HISTORY};
use sb_nn::{Computation, NeuralNet};
use sb_utils::math;
use tracing::{debug, error};

use crate::hash::{Hash, HashEntry};
use crate::node::{NodeId, PlayoutLimits, PlayoutOutcome};
use crate::search::WorkerInfo;
use crate::tree::Tree;

/// One worker's private sleep signal; the engine rings it on stop.
pub struct SleepCell {
    pub(crate) mutex: Mutex<bool>,
    pub(crate) condition: Condvar
}

impl Default for SleepCell {
    fn default() -> Self {
        Self {
            mutex: Mutex::new(false),
            condition: Condvar::new()
        }
    }
}

impl SleepCell {
    pub(crate) fn wake(&self) {
        let mut woken = self.mutex.lock().unwrap();
        *woken = true;
        self.condition.notify_all();
    }

    fn sleep(&self, timeout: Duration) {
        let woken = self.mutex.lock().unwrap();
        if !*woken {
            let _ = self.condition.wait_timeout(woken, timeout).unwrap();
        }
    }
}

/// Messages a worker sends the engine's collector.
pub enum WorkerMessage {
    Info(WorkerInfo),
    ReachedMaxBatch,
    Stopped
}

struct PlayoutItem {
    node: NodeId,
    planes: InputPlanes,
    flip: bool
}

enum Handled {
    /// The node needs a network evaluation.
    Fetch(Box<PlayoutItem>),
    /// Terminal, tablebase, or transposition: fully resolved in-tree.
    Resolved
}

/// Runs the playout loop on its own thread: select and claim leaves,
/// resolve what the tree already knows, batch the rest to the network,
/// and dispatch write-back tasks onto the executor.
pub struct SearchWorker {
    id: usize,
    search_id: u32,
    tree: Arc<Tree>,
    stop: Arc<AtomicBool>,
    sleep: Arc<SleepCell>,
    info_tx: Sender<WorkerMessage>,
    in_flight: Arc<(Mutex<usize>, Condvar)>,
    max_batch_size: usize,
    reached_max_batch: bool
}

impl SearchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        search_id: u32,
        tree: Arc<Tree>,
        stop: Arc<AtomicBool>,
        sleep: Arc<SleepCell>,
        info_tx: Sender<WorkerMessage>,
        max_batch_size: usize
    ) -> Self {
        Self {
            id,
            search_id,
            tree,
            stop,
            sleep,
            info_tx,
            in_flight: Arc::new((Mutex::new(0), Condvar::new())),
            max_batch_size,
            reached_max_batch: false
        }
    }

    pub fn run(mut self) {
        debug!(id = self.id, "search worker started");
        self.ensure_root_and_children_scored();

        while !self.stop.load(Ordering::Acquire) {
            let did_work = self.fill_out_tree();
            if !did_work {
                self.sleep.sleep(Duration::from_millis(*sb_utils::config::WORKER_SLEEP_MS));
            }
        }

        // outstanding write-back tasks must land before the engine reads
        // final state
        let (count, condition) = &*self.in_flight;
        let mut count = count.lock().unwrap();
        while *count > 0 {
            count = condition.wait(count).unwrap();
        }
        drop(count);

        debug!(id = self.id, "search worker stopped");
        let _ = self.info_tx.send(WorkerMessage::Stopped);
    }

    /// Root and every direct child are scored synchronously before any
    /// playouts start; selection needs the root's priors in place.
    fn ensure_root_and_children_scored(&mut self) {
        let root = match self.tree.lock().root {
            Some(root) => root,
            None => return
        };

        let mut info = WorkerInfo { search_id: self.search_id, ..Default::default() };

        let claimed = {
            let mut data = self.tree.lock();
            if !data.node(root).set_scoring_or_scored() {
                data.node_mut(root).virtual_loss += 1;
                true
            } else {
                false
            }
        };
        if claimed {
            info.nodes_searched += 1;
            match self.handle_playout(root, &mut info) {
                Handled::Fetch(item) => self.fetch_from_nn(vec! [*item], info.clone(), true),
                Handled::Resolved => self.minimax_and_report(info.clone())
            }
            info = WorkerInfo { search_id: self.search_id, ..Default::default() };
        }

        // embody and claim every unscored child of the root
        let children = {
            let mut data = self.tree.lock();
            let count = data.node(root).edges.len();
            let mut claimed = vec! [];
            for index in 0..count {
                if !data.node(root).edges[index].is_potential() {
                    continue;
                }
                let child = match data.embody(root, index) {
                    Some(child) => child,
                    None => break
                };
                if !data.node(child).set_scoring_or_scored() {
                    data.node_mut(child).virtual_loss += 1;
                    claimed.push(child);
                }
            }
            claimed
        };
        if children.is_empty() {
            return;
        }

        let mut batch = vec! [];
        for child in children {
            info.nodes_searched += 1;
            info.nodes_created += 1;
            info.sum_depths += 1;
            info.max_depth = info.max_depth.max(1);
            match self.handle_playout(child, &mut info) {
                Handled::Fetch(item) => batch.push(*item),
                Handled::Resolved => {}
            }
        }

        if batch.is_empty() {
            self.minimax_and_report(info);
        } else {
            self.fetch_from_nn(batch, info, true);
        }
    }

    /// One batch-building pass. Returns whether any playout made
    /// progress.
    fn fill_out_tree(&mut self) -> bool {
        let mut did_work = false;
        let mut info = WorkerInfo { search_id: self.search_id, ..Default::default() };
        let batch = self.playout_nodes(&mut did_work, &mut info);

        if !batch.is_empty() {
            self.fetch_from_nn(batch, info, false);
        } else if did_work {
            self.minimax_and_report(info);
        }

        did_work
    }

    fn playout_nodes(&mut self, did_work: &mut bool, info: &mut WorkerInfo) -> Vec<PlayoutItem> {
        let mut batch: Vec<PlayoutItem> = vec! [];
        let mut exact_or_cached = 0;
        let mut limits = {
            let data = self.tree.lock();
            PlayoutLimits::from_settings(&data.settings)
        };

        while batch.len() < self.max_batch_size && exact_or_cached < self.max_batch_size {
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let (node, depth, is_existing) = {
                let mut data = self.tree.lock();
                match data.playout(&mut limits) {
                    PlayoutOutcome::Found { node, depth, created } => {
                        if created {
                            info.nodes_created += 1;
                        }
                        (node, depth, data.node(node).virtual_loss > 1)
                    },
                    PlayoutOutcome::Exhausted => break,
                    PlayoutOutcome::AllocFailed => break
                }
            };

            *did_work = true;
            info.nodes_searched += 1;
            info.sum_depths += depth as u64;
            info.max_depth = info.max_depth.max(depth as u32);

            if is_existing {
                exact_or_cached += 1;
                continue;
            }

            match self.handle_playout(node, info) {
                Handled::Fetch(item) => {
                    exact_or_cached = 0;
                    batch.push(*item);
                },
                Handled::Resolved => {
                    exact_or_cached += 1;
                }
            }
        }

        batch
    }

    /// Resolve a freshly claimed playout node: terminal rules, tablebase,
    /// transposition hash, or hand it to the network.
    fn handle_playout(&mut self, node: NodeId, info: &mut WorkerInfo) -> Handled {
        let mut data = self.tree.lock();

        // a re-encountered exact node re-propagates its value
        if data.node(node).is_exact {
            data.set_q_and_propagate(node);
            info.nodes_cache_hits += 1;
            return Handled::Resolved;
        }

        if data.node(node).edges.is_empty() {
            let tb_hit = data.generate_edges(node);
            if tb_hit {
                info.nodes_tb_hits += 1;
            }
            if data.node(node).is_exact {
                data.set_q_and_propagate(node);
                return Handled::Resolved;
            }
        }

        let key = data.game_of(node).zobrist();
        if let Some(entry) = Hash::global().get(key) {
            if data.fill_out(node, &entry) {
                data.sort_edges_by_p(node);
                data.set_q_and_propagate(node);
                info.nodes_cache_hits += 1;
                return Handled::Resolved;
            }
        }

        let games = data.history_games(node, MOVE_HISTORY);
        let flip = games[0].active() == Color::Black;
        let planes = encode(&games);
        drop(data);

        Handled::Fetch(Box::new(PlayoutItem { node, planes, flip }))
    }

    /// Acquire a network handle and evaluate the batch, either inline or
    /// as a write-back task on the executor.
    fn fetch_from_nn(&mut self, batch: Vec<PlayoutItem>, info: WorkerInfo, sync: bool) {
        if !self.reached_max_batch && batch.len() >= self.max_batch_size {
            self.reached_max_batch = true;
            let _ = self.info_tx.send(WorkerMessage::ReachedMaxBatch);
        }

        let network = NeuralNet::global().acquire_network(); // blocks

        if sync {
            fetch_batch(&self.tree, network, batch, info, &self.info_tx);
            return;
        }

        let tree = self.tree.clone();
        let info_tx = self.info_tx.clone();
        let in_flight = self.in_flight.clone();
        {
            let (count, _) = &*in_flight;
            *count.lock().unwrap() += 1;
        }

        rayon::spawn(move || {
            fetch_batch(&tree, network, batch, info, &info_tx);

            let (count, condition) = &*in_flight;
            let mut count = count.lock().unwrap();
            *count -= 1;
            condition.notify_all();
        });
    }

    fn minimax_and_report(&self, mut info: WorkerInfo) {
        {
            let mut data = self.tree.lock();
            if let Some(root) = data.root {
                data.minimax(root);
            }
        }
        info.search_id = self.search_id;
        let _ = self.info_tx.send(WorkerMessage::Info(info));
    }
}

/// Run the forward pass and write the results back into the tree under
/// the tree lock: raw values (sign-flipped to the just-moved side),
/// tempered and normalized priors, transposition inserts, propagation,
/// and a minimax pass.
fn fetch_batch(
    tree: &Arc<Tree>,
    network: Arc<dyn sb_nn::Backend>,
    batch: Vec<PlayoutItem>,
    mut info: WorkerInfo,
    info_tx: &Sender<WorkerMessage>
) {
    let mut computation = Computation::new(network.clone());
    for item in &batch {
        computation.add_position(item.planes.clone());
    }

    if let Err(error) = computation.evaluate() {
        // the batch is lost; the claimed nodes stay unresolved and the
        // search keeps going
        error!(%error, "network evaluation failed, discarding batch");
        NeuralNet::global().release_network(network);
        return;
    }

    {
        let mut data = tree.lock();
        let settings = data.settings.clone();

        for (index, item) in batch.iter().enumerate() {
            if !data.arena.is_live(item.node) {
                continue;
            }

            data.node_mut(item.node).raw_q_value = -computation.q_val(index);

            let moves: Vec<_> = data.node(item.node).edges.iter()
                .map(|edge| edge.mv())
                .collect();
            if !moves.is_empty() {
                let mut priors: Vec<f32> = moves.iter()
                    .map(|mv| computation.p_val(index, move_to_index(mv, item.flip)))
                    .collect();
                math::softmax_with_temperature(&mut priors, 1.0 / settings.policy_softmax_temp);

                for (edge, &p) in data.node_mut(item.node).edges.iter_mut().zip(priors.iter()) {
                    edge.set_p(p);
                }
                let children: Vec<(NodeId, f32)> = data.node(item.node).edges.iter()
                    .filter_map(|edge| edge.node().map(|child| (child, edge.p())))
                    .collect();
                for (child, p) in children {
                    data.node_mut(child).p_value = p;
                }

                let key = data.game_of(item.node).zobrist();
                let raw_q = data.node(item.node).raw_q_value;
                Hash::global().insert(
                    key,
                    HashEntry::new(raw_q, moves.into_iter().zip(priors).collect())
                );
            }

            data.sort_edges_by_p(item.node);
            data.set_q_and_propagate(item.node);
        }

        if let Some(root) = data.root {
            data.minimax(root);
        }
    }

    NeuralNet::global().release_network(network);

    info.nodes_evaluated += batch.len() as u64;
    info.number_of_batches += 1;
    let _ = info_tx.send(WorkerMessage::Info(info));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchSettings;
    use crossbeam_channel::unbounded;
    use sb_chess::Game;

    lazy_static! {
        // the network pool and transposition hash are process-wide
        static ref TEST_LOCK: Mutex<()> = Mutex::new(());
    }

    fn guard() -> std::sync::MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn setup(fen: &str) -> (Arc<Tree>, NodeId) {
        NeuralNet::global().set_weights("auto").unwrap();
        NeuralNet::global().reset(1).unwrap();
        Hash::global().reset(16);

        let tree = Arc::new(Tree::new());
        let root = {
            let mut data = tree.lock();
            data.reset(4096);
            data.settings = SearchSettings::default();
            let mut game = if fen.is_empty() {
                Game::starting_position()
            } else {
                Game::from_fen(fen, false).unwrap()
            };
            game.set_repetitions(0);
            data.new_root(game).unwrap()
        };
        (tree, root)
    }

    fn worker(tree: &Arc<Tree>, stop: &Arc<AtomicBool>) -> (SearchWorker, crossbeam_channel::Receiver<WorkerMessage>) {
        let (tx, rx) = unbounded();
        let worker = SearchWorker::new(
            0,
            1,
            tree.clone(),
            stop.clone(),
            Arc::new(SleepCell::default()),
            tx,
            64
        );
        (worker, rx)
    }

    #[test]
    fn root_priming_scores_all_children() {
        let _guard = guard();
        let (tree, root) = setup("");
        let stop = Arc::new(AtomicBool::new(false));
        let (mut worker, rx) = worker(&tree, &stop);

        worker.ensure_root_and_children_scored();

        let data = tree.lock();
        assert!(data.node(root).has_q_value());
        assert_eq!(data.node(root).edges.len(), 20);
        for edge in &data.node(root).edges {
            let child = edge.node().expect("every root child embodied");
            assert!(data.node(child).has_q_value());
            assert!(edge.has_p());
        }
        assert_eq!(data.node(root).visits, 21);
        drop(data);

        // two synchronous batches were reported
        let mut batches = 0;
        while let Ok(message) = rx.try_recv() {
            if let WorkerMessage::Info(info) = message {
                batches += info.number_of_batches;
            }
        }
        assert_eq!(batches, 2);
    }

    #[test]
    fn mate_in_one_is_found_while_priming() {
        let _guard = guard();
        let (tree, root) = setup("8/8/5K2/3P3k/2P5/8/6Q1/8 w - - 12 68");
        let stop = Arc::new(AtomicBool::new(false));
        let (mut worker, _rx) = worker(&tree, &stop);

        worker.ensure_root_and_children_scored();

        let data = tree.lock();
        let best = data.best_child(root).unwrap();
        assert!(data.node(best).is_exact);
        assert!(data.node(best).q_value > 1.0);

        let game = data.game_of(best);
        let mv = game.last_move_uci();
        assert!(mv == "g2g5" || mv == "g2h3", "got {}", mv);
    }

    #[test]
    fn transposition_hits_skip_the_network() {
        let _guard = guard();
        let (tree, _root) = setup("");
        let stop = Arc::new(AtomicBool::new(false));
        let (mut worker, rx) = worker(&tree, &stop);

        worker.ensure_root_and_children_scored();
        while rx.try_recv().is_ok() {}

        // claim the next playout leaf, then plant its evaluation in the
        // transposition hash before the worker resolves it
        let node = {
            let mut data = tree.lock();
            let mut limits = PlayoutLimits::from_settings(&data.settings);
            match data.playout(&mut limits) {
                PlayoutOutcome::Found { node, .. } => node,
                _ => panic!("expected a playout node")
            }
        };
        {
            let data = tree.lock();
            let game = data.game_of(node).clone();
            let moves = game.legal_moves();
            let p = 1.0 / moves.len() as f32;
            Hash::global().insert(
                game.zobrist(),
                HashEntry::new(0.25, moves.into_iter().map(|mv| (mv, p)).collect())
            );
        }

        let mut info = WorkerInfo::default();
        match worker.handle_playout(node, &mut info) {
            Handled::Resolved => {},
            Handled::Fetch(_) => panic!("cached playout went to the network")
        }
        assert_eq!(info.nodes_cache_hits, 1);
        assert_eq!(tree.lock().node(node).raw_q_value, 0.25);
    }

    #[test]
    fn worker_thread_stops_on_flag() {
        let _guard = guard();
        let (tree, _root) = setup("");
        let stop = Arc::new(AtomicBool::new(false));
        let (worker, rx) = worker(&tree, &stop);

        let sleep = worker.sleep.clone();
        let handle = std::thread::spawn(move || worker.run());

        std::thread::sleep(Duration::from_millis(100));
        stop.store(true, Ordering::Release);
        sleep.wake();
        handle.join().unwrap();

        let mut stopped = false;
        while let Ok(message) = rx.try_recv() {
            if matches!(message, WorkerMessage::Stopped) {
                stopped = true;
            }
        }
        assert!(stopped);

        let data = tree.lock();
        let root = data.root.unwrap();
        assert!(data.node(root).visits > 1, "search made progress before stopping");
    }
}
