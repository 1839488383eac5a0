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

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use sb_chess::tb::{Probe, TB};
use sb_chess::{move_to_uci, Game};
use sb_utils::options::Options;
use tracing::{debug, error, info as log_info};

use crate::hash::Hash;
use crate::node::NodeId;
use crate::search::{mate_distance_or_score, Search, SearchInfo, SearchSettings, WorkerInfo};
use crate::tree::Tree;
use crate::worker::{SearchWorker, SleepCell, WorkerMessage};

/// What the engine tells the protocol front-end.
pub enum EngineEvent {
    Info { info: SearchInfo, is_partial: bool },
    /// The engine is confident (single reply, unassailable visit lead, or
    /// a tablebase answer); the front-end should emit `bestmove` now.
    RequestStop
}

struct WorkerHandle {
    sleep: Arc<SleepCell>,
    handle: JoinHandle<()>
}

/// Everything the collector needs to scale the worker pool up while a
/// search runs.
struct SpawnContext {
    tree: Arc<Tree>,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<WorkerHandle>>,
    started: AtomicUsize,
    worker_tx: Sender<WorkerMessage>,
    max_batch_size: usize,
    search_id: u32
}

fn spawn_worker(context: &Arc<SpawnContext>) {
    let id = context.started.fetch_add(1, Ordering::SeqCst);
    let sleep = Arc::new(SleepCell::default());
    let worker = SearchWorker::new(
        id,
        context.search_id,
        context.tree.clone(),
        context.stop.clone(),
        sleep.clone(),
        context.worker_tx.clone(),
        context.max_batch_size
    );

    let handle = thread::Builder::new()
        .name(format!("search{}", id))
        .spawn(move || worker.run())
        .expect("could not spawn search worker");
    context.workers.lock().unwrap().push(WorkerHandle { sleep, handle });
}

/// Owns the tree and the worker pool: starts and stops searches, reuses
/// the tree across moves, folds worker reports into one `SearchInfo`
/// stream, and decides early exits.
pub struct SearchEngine {
    tree: Arc<Tree>,
    stop: Arc<AtomicBool>,
    search_id: u32,
    event_tx: Sender<EngineEvent>,
    context: Option<Arc<SpawnContext>>,
    collector: Option<JoinHandle<()>>,
    searching: bool
}

impl SearchEngine {
    pub fn new(event_tx: Sender<EngineEvent>) -> Self {
        Self {
            tree: Arc::new(Tree::new()),
            stop: Arc::new(AtomicBool::new(true)),
            search_id: 0,
            event_tx,
            context: None,
            collector: None,
            searching: false
        }
    }

    pub fn tree(&self) -> Arc<Tree> {
        self.tree.clone()
    }

    /// Drop all search state and re-size the pools from the `Cache`
    /// option. Must not be called mid-search.
    pub fn reset(&mut self) {
        debug_assert!(!self.searching);
        let capacity = Options::global().value_i64("Cache").max(100_000) as usize;
        self.tree.lock().reset(capacity);
    }

    pub fn start_search(&mut self, search: Search) {
        debug_assert!(!self.searching);
        self.stop.store(false, Ordering::Release);
        self.search_id += 1;

        {
            let mut data = self.tree.lock();
            data.settings = SearchSettings::from_options();
            if data.arena.capacity() == 0 {
                let capacity = Options::global().value_i64("Cache").max(100_000) as usize;
                data.reset(capacity);
            }
        }

        // reuse the subtree two plies down when the new root was reached
        // through the old one
        let resumed = self.try_resume(&search.game);
        if resumed {
            log_info!("resuming the previous search tree");
        } else {
            let mut data = self.tree.lock();
            data.clear_tree();
            let mut game = search.game.clone();
            if game.repetitions() == -1 {
                game.set_repetitions(0);
            }
            if data.new_root(game).is_none() {
                error!("could not allocate a root node");
                let _ = self.event_tx.send(EngineEvent::RequestStop);
                return;
            }
        }

        self.filter_search_moves(&search);

        // a tablebase root needs no search at all
        if self.report_dtz(&search) {
            return;
        }

        let (worker_tx, worker_rx) = unbounded();
        let context = Arc::new(SpawnContext {
            tree: self.tree.clone(),
            stop: self.stop.clone(),
            workers: Mutex::new(vec! []),
            started: AtomicUsize::new(0),
            worker_tx,
            max_batch_size: Options::global().value_i64("MaxBatchSize").max(1) as usize,
            search_id: self.search_id
        });
        spawn_worker(&context);

        let collector = {
            let context = context.clone();
            let event_tx = self.event_tx.clone();
            let search = search.clone();
            thread::Builder::new()
                .name("collector".into())
                .spawn(move || collect(context, worker_rx, event_tx, search, resumed))
                .expect("could not spawn collector")
        };

        self.context = Some(context);
        self.collector = Some(collector);
        self.searching = true;
    }

    /// Signal stop and block until every worker and pending write-back
    /// has landed.
    pub fn stop_search(&mut self) {
        if !self.searching {
            return;
        }
        self.stop.store(true, Ordering::Release);

        let context = self.context.take().expect("searching without context");
        for worker in context.workers.lock().unwrap().iter() {
            worker.sleep.wake();
        }

        if let Some(collector) = self.collector.take() {
            let _ = collector.join();
        }
        for worker in context.workers.lock().unwrap().drain(..) {
            let _ = worker.handle.join();
        }

        self.searching = false;
        debug!("search stopped");
    }

    pub fn is_searching(&self) -> bool {
        self.searching
    }

    /// The best-effort move when the deadline fires before any report: the
    /// root's strongest edge by prior, or any edge at all.
    pub fn fallback_best_move(&self) -> Option<String> {
        let data = self.tree.lock();
        let root = data.root?;
        let game = data.game_of(root).clone();

        data.best_child(root)
            .and_then(|best| {
                data.node(root).edges.iter()
                    .find(|edge| edge.node() == Some(best))
                    .map(|edge| move_to_uci(&game, edge.mv()))
            })
            .or_else(|| {
                data.node(root).edges.first()
                    .map(|edge| move_to_uci(&game, edge.mv()))
            })
    }

    pub fn print_tree(&self, depth: i32) {
        let data = self.tree.lock();
        eprintln!("{}", data.format_tree(depth));
    }

    fn try_resume(&self, game: &Game) -> bool {
        let mut data = self.tree.lock();
        let root = match data.root {
            Some(root) => root,
            None => return false
        };

        let children: Vec<NodeId> = data.node(root).edges.iter()
            .filter_map(|edge| edge.node())
            .collect();
        for child in children {
            let grandchildren: Vec<NodeId> = data.node(child).edges.iter()
                .filter_map(|edge| edge.node())
                .collect();
            for grandchild in grandchildren {
                if data.game_of(grandchild).is_same_position(game)
                    && !data.node(grandchild).is_exact
                {
                    data.rebase(grandchild);
                    let position = data.node(grandchild).position;
                    data.cache.record_mut(position).game
                        .set_repetitions(game.repetitions().max(0));
                    return true;
                }
            }
        }
        false
    }

    /// Drop root candidates outside `searchmoves`.
    fn filter_search_moves(&self, search: &Search) {
        if search.search_moves.is_empty() {
            return;
        }

        let mut data = self.tree.lock();
        let root = match data.root {
            Some(root) => root,
            None => return
        };
        let game = data.game_of(root).clone();

        let dropped: Vec<NodeId> = data.node(root).edges.iter()
            .filter(|edge| !search.search_moves.contains(&move_to_uci(&game, edge.mv())))
            .filter_map(|edge| edge.node())
            .collect();
        for child in dropped {
            data.release_subtree(child);
        }
        data.node_mut(root).edges
            .retain(|edge| search.search_moves.contains(&move_to_uci(&game, edge.mv())));
    }

    /// When the root is covered by the tablebases, answer from them
    /// directly. Returns true when the search is already over.
    fn report_dtz(&mut self, search: &Search) -> bool {
        let (mv, dtz, outcome) = match TB::global().probe_dtz(&search.game) {
            Some(result) => result,
            None => return false
        };

        let value = match outcome {
            Probe::Win => 1.0,
            Probe::Loss => -1.0,
            _ => 0.0
        };
        let best_move = move_to_uci(&search.game, mv);

        let mut info = SearchInfo {
            is_dtz: true,
            depth: dtz as u32,
            seldepth: dtz as u32,
            nodes: dtz as u64,
            best_move: best_move.clone(),
            pv: best_move,
            score: mate_distance_or_score(value, dtz + 1, true),
            ..Default::default()
        };
        info.worker_info = WorkerInfo {
            nodes_searched: 1,
            nodes_tb_hits: 1,
            sum_depths: dtz as u64,
            max_depth: dtz as u32,
            search_id: self.search_id,
            ..Default::default()
        };

        let _ = self.event_tx.send(EngineEvent::Info { info, is_partial: false });
        let _ = self.event_tx.send(EngineEvent::RequestStop);
        true
    }
}

impl Drop for SearchEngine {
    fn drop(&mut self) {
        self.stop_search();
    }
}

/// Fold worker reports into the running `SearchInfo`, emit progress, and
/// watch for the early-exit conditions.
fn collect(
    context: Arc<SpawnContext>,
    worker_rx: Receiver<WorkerMessage>,
    event_tx: Sender<EngineEvent>,
    search: Search,
    resumed: bool
) {
    let started_at = Instant::now();
    let mut current = SearchInfo {
        is_resume: resumed,
        ..Default::default()
    };
    let mut stopped = 0usize;
    let mut exit_requested = false;

    while let Ok(message) = worker_rx.recv() {
        match message {
            WorkerMessage::Stopped => {
                stopped += 1;
                if stopped >= context.started.load(Ordering::Acquire)
                    && context.stop.load(Ordering::Acquire)
                {
                    break;
                }
            },
            WorkerMessage::ReachedMaxBatch => {
                let limit = *sb_utils::config::NUM_SEARCH_THREADS;
                if !context.stop.load(Ordering::Acquire)
                    && context.started.load(Ordering::Acquire) < limit
                {
                    debug!("scaling up: starting another search worker");
                    spawn_worker(&context);
                }
            },
            WorkerMessage::Info(worker_info) => {
                if context.stop.load(Ordering::Acquire)
                    || worker_info.search_id != context.search_id
                {
                    continue;
                }

                let should_stop = fold_info(
                    &context,
                    &mut current,
                    &worker_info,
                    &search,
                    started_at,
                    &event_tx
                );
                if should_stop && !exit_requested {
                    exit_requested = true;
                    let _ = event_tx.send(EngineEvent::RequestStop);
                }
            }
        }
    }
}

fn fold_info(
    context: &Arc<SpawnContext>,
    current: &mut SearchInfo,
    worker_info: &WorkerInfo,
    search: &Search,
    started_at: Instant,
    event_tx: &Sender<EngineEvent>
) -> bool {
    current.worker_info.fold(worker_info);

    let folded = &current.worker_info;
    let new_depth = (folded.sum_depths / folded.nodes_created.max(1)) as u32;
    let mut is_partial = new_depth <= current.depth;
    current.depth = current.depth.max(new_depth);

    if folded.max_depth > current.seldepth {
        is_partial = false;
    }
    current.seldepth = current.seldepth.max(folded.max_depth);
    current.nodes = folded.nodes_searched;

    let elapsed = started_at.elapsed().as_millis() as i64;

    let mut should_stop = false;
    {
        let data = context.tree.lock();
        let root = match data.root {
            Some(root) => root,
            None => return false
        };
        let best = match data.best_child(root) {
            Some(best) => best,
            None => return false
        };
        let root_game = data.game_of(root).clone();

        let best_move = data.node(root).edges.iter()
            .find(|edge| edge.node() == Some(best))
            .map(|edge| move_to_uci(&root_game, edge.mv()))
            .unwrap_or_default();
        if best_move != current.best_move {
            is_partial = false;
        }
        current.best_move = best_move;

        current.ponder_move = data.best_child(best)
            .and_then(|ponder| {
                let best_game = data.game_of(best).clone();
                data.node(best).edges.iter()
                    .find(|edge| edge.node() == Some(ponder))
                    .map(|edge| move_to_uci(&best_game, edge.mv()))
            })
            .unwrap_or_default();

        let mut pv_depth = 0;
        let mut is_tb = false;
        current.pv = data.principal_variation(&mut pv_depth, &mut is_tb);

        let score = if data.node(best).has_q_value() {
            data.node(best).q_value
        } else {
            -data.q_value_of(root)
        };
        current.score = mate_distance_or_score(score, pv_depth, is_tb);

        // early exit: a single reply, or a visit lead the runner-up can
        // no longer close in the remaining time
        let only_legal_move = !data.node(root).edges.iter().any(|edge| edge.is_potential())
            && data.node(root).edges.len() == 1;
        if only_legal_move {
            current.best_is_most_visited = true;
            should_stop = true;
        } else if let (Some(first), Some(second)) = data.top_two_children(root) {
            let diff = i64::from(data.node(first).visits) - i64::from(data.node(second).visits);
            let best_is_most_visited = diff >= 0
                || (data.node(first).q_value - data.node(second).q_value).abs() < 1e-6;
            current.best_is_most_visited = best_is_most_visited;

            let estimated = estimate_remaining_visits(current, search, elapsed, &data.settings);
            should_stop = best_is_most_visited && diff as u64 >= estimated;
        } else {
            current.best_is_most_visited = true;
        }
    }

    current.hashfull = Hash::global().permille_full();
    current.calculate_speeds(elapsed);

    if search.nodes != -1 && current.nodes >= search.nodes as u64 {
        should_stop = true;
    }

    let _ = event_tx.send(EngineEvent::Info { info: current.clone(), is_partial });
    should_stop
}

/// How many more visits the remaining time is worth, scaled by the early
/// exit factor. Unbounded searches never exit on the visit gap.
fn estimate_remaining_visits(
    current: &SearchInfo,
    search: &Search,
    elapsed: i64,
    settings: &SearchSettings
) -> u64 {
    if search.time_budget < 0 {
        return u64::MAX;
    }

    let remaining = (search.time_budget - elapsed).max(0) as f64;
    let nps = current.nodes as f64 / elapsed.max(1) as f64 * 1000.0;
    (nps * remaining / 1000.0 * f64::from(settings.early_exit_factor)) as u64
}
