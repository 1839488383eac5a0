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

use sb_chess::Game;
use sb_utils::options::Options;

/// The parameters of one `go` command, resolved against the current game
/// history by the protocol front-end.
#[derive(Clone, Debug)]
pub struct Search {
    pub game: Game,
    pub search_moves: Vec<String>,
    pub wtime: i64,
    pub btime: i64,
    pub winc: i64,
    pub binc: i64,
    pub movestogo: i64,
    pub depth: i64,
    pub nodes: i64,
    pub mate: i64,
    pub movetime: i64,
    pub infinite: bool,
    /// The clock's deadline for this move, in milliseconds; `-1` when the
    /// search is unbounded. Drives the early-exit visit estimate.
    pub time_budget: i64
}

impl Search {
    pub fn new(game: Game) -> Self {
        Self {
            game,
            search_moves: vec! [],
            wtime: -1,
            btime: -1,
            winc: -1,
            binc: -1,
            movestogo: -1,
            depth: -1,
            nodes: -1,
            mate: -1,
            movetime: -1,
            infinite: false,
            time_budget: -1
        }
    }
}

/// Selection constants and other knobs, snapshotted from the option
/// registry when a search starts. Read-only for the search's lifetime.
#[derive(Clone, Debug)]
pub struct SearchSettings {
    pub cpuct_init: f32,
    pub cpuct_base: f32,
    pub cpuct_f: f32,
    pub fpu_reduction: f32,
    pub policy_softmax_temp: f32,
    pub opening_time_factor: f32,
    pub early_exit_factor: f32,
    pub try_playout_limit: i32,
    pub vld_max: i32,
    pub chess960: bool
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            cpuct_init: 2.1,
            cpuct_base: 15000.0,
            cpuct_f: 2.817,
            fpu_reduction: 0.443,
            policy_softmax_temp: 1.607,
            opening_time_factor: 2.15,
            early_exit_factor: 0.72,
            try_playout_limit: 136,
            vld_max: 10000,
            chess960: false
        }
    }
}

impl SearchSettings {
    pub fn from_options() -> Self {
        let options = Options::global();
        let defaults = Self::default();

        Self {
            cpuct_init: options.value_f32("CpuctInit"),
            cpuct_base: options.value_f32("CpuctBase"),
            cpuct_f: options.value_f32("CpuctF"),
            opening_time_factor: options.value_f32("OpeningTimeFactor"),
            chess960: options.value_bool("UCI_Chess960"),
            ..defaults
        }
    }
}

/// Per-worker counters, folded by the engine into the running
/// `SearchInfo`.
#[derive(Clone, Debug, Default)]
pub struct WorkerInfo {
    pub sum_depths: u64,
    pub max_depth: u32,
    pub nodes_searched: u64,
    pub nodes_evaluated: u64,
    pub nodes_created: u64,
    pub nodes_cache_hits: u64,
    pub nodes_tb_hits: u64,
    pub number_of_batches: u32,
    pub search_id: u32
}

impl WorkerInfo {
    pub fn fold(&mut self, other: &WorkerInfo) {
        self.sum_depths += other.sum_depths;
        self.max_depth = self.max_depth.max(other.max_depth);
        self.nodes_searched += other.nodes_searched;
        self.nodes_evaluated += other.nodes_evaluated;
        self.nodes_created += other.nodes_created;
        self.nodes_cache_hits += other.nodes_cache_hits;
        self.nodes_tb_hits += other.nodes_tb_hits;
        self.number_of_batches += other.number_of_batches;
    }
}

/// The engine's running view of the search, rendered by the front-end as
/// `info` lines and the final `bestmove`.
#[derive(Clone, Debug)]
pub struct SearchInfo {
    pub depth: u32,
    pub seldepth: u32,
    pub time: i64,
    pub nodes: u64,
    pub nps: u64,
    pub batch_size: u32,
    pub score: String,
    pub pv: String,
    pub best_move: String,
    pub ponder_move: String,
    pub is_resume: bool,
    pub is_dtz: bool,
    pub best_is_most_visited: bool,
    pub hashfull: u32,
    pub worker_info: WorkerInfo
}

impl Default for SearchInfo {
    fn default() -> Self {
        Self {
            depth: 0,
            seldepth: 0,
            time: 0,
            nodes: 0,
            nps: 0,
            batch_size: 0,
            score: String::new(),
            pv: String::new(),
            best_move: String::new(),
            ponder_move: String::new(),
            is_resume: false,
            is_dtz: false,
            best_is_most_visited: true,
            hashfull: 0,
            worker_info: WorkerInfo::default()
        }
    }
}

impl SearchInfo {
    pub fn calculate_speeds(&mut self, time: i64) {
        self.time = time;
        self.nps = (self.nodes as f64 / time.max(1) as f64 * 1000.0).round() as u64;
        self.batch_size = if self.worker_info.number_of_batches > 0 {
            (self.worker_info.nodes_evaluated / u64::from(self.worker_info.number_of_batches)) as u32
        } else {
            0
        };
    }
}

/// Centipawn display of a `[-1, 1]` score, the same mapping lc0 uses.
pub fn score_to_cp(score: f32) -> i32 {
    (290.680623072 * (1.548090806 * f64::from(score)).tan()).round() as i32
}

pub fn cp_to_score(cp: i32) -> f32 {
    ((f64::from(cp) / 290.680623072).atan() / 1.548090806) as f32
}

/// Format a score for the `info` line: `cp N`, or `mate ±K` once the value
/// has saturated (tablebase wins stay `cp`, their distance is unknown).
///
/// # Arguments
///
/// * `score` -
/// * `pv_depth` - length of the principal variation
/// * `is_tb` -
///
pub fn mate_distance_or_score(score: f32, pv_depth: i32, is_tb: bool) -> String {
    if is_tb {
        return format!("cp {}", score_to_cp(score.clamp(-1.0, 1.0)));
    }

    if score >= 1.0 {
        format!("mate {}", (pv_depth - 1 + 1) / 2)
    } else if score <= -1.0 {
        format!("mate -{}", (pv_depth - 1 + 1) / 2)
    } else {
        format!("cp {}", score_to_cp(score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cp_conversion_round_trips() {
        for cp in [-900, -100, 0, 35, 250, 1200] {
            let back = score_to_cp(cp_to_score(cp));
            assert!((back - cp).abs() <= 1, "{} -> {}", cp, back);
        }
    }

    #[test]
    fn zero_score_is_zero_cp() {
        assert_eq!(score_to_cp(0.0), 0);
    }

    #[test]
    fn saturated_scores_read_as_mate() {
        assert_eq!(mate_distance_or_score(1.0002, 2, false), "mate 1");
        assert_eq!(mate_distance_or_score(1.0001, 4, false), "mate 2");
        assert_eq!(mate_distance_or_score(-1.0, 3, false), "mate -1");
    }

    #[test]
    fn tb_scores_stay_centipawns() {
        assert!(mate_distance_or_score(1.0, 1, true).starts_with("cp "));
    }

    #[test]
    fn worker_info_folds_counters() {
        let mut a = WorkerInfo { nodes_searched: 10, max_depth: 3, ..Default::default() };
        let b = WorkerInfo { nodes_searched: 5, max_depth: 7, ..Default::default() };
        a.fold(&b);

        assert_eq!(a.nodes_searched, 15);
        assert_eq!(a.max_depth, 7);
    }

    #[test]
    fn speeds_are_per_second() {
        let mut info = SearchInfo { nodes: 5000, ..Default::default() };
        info.worker_info.nodes_evaluated = 1200;
        info.worker_info.number_of_batches = 10;
        info.calculate_speeds(500);

        assert_eq!(info.nps, 10000);
        assert_eq!(info.batch_size, 120);
    }
}
