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

use crossbeam_channel::{select, unbounded, Receiver};
use regex::Regex;
use sb_chess::{Color, Game};
use sb_mcts::clock::Clock;
use sb_mcts::hash::Hash;
use sb_mcts::history::History;
use sb_mcts::{EngineEvent, Search, SearchEngine, SearchInfo};
use sb_nn::NeuralNet;
use sb_utils::options::Options;
use tracing::{debug, error, warn};

lazy_static! {
    static ref POSITION: Regex =
        Regex::new(r"^position\s+(?:startpos|fen\s+(?P<fen>.+?))(?:\s+moves\s+(?P<moves>.+))?$")
            .unwrap();
}

fn rolling_average(old: u64, new: u64, n: u64) -> u64 {
    ((old as f64 * (n - 1) as f64 + new as f64) / n as f64).round() as u64
}

/// The protocol front-end: parses commands from stdin, owns the clock and
/// the current game history, and renders the engine's reports as `info`
/// and `bestmove` lines on stdout.
pub struct UciEngine {
    engine: SearchEngine,
    clock: Clock,
    line_rx: Receiver<String>,
    engine_rx: Receiver<EngineEvent>,
    clock_rx: Receiver<()>,
    last_info: SearchInfo,
    average_info: SearchInfo,
    time_at_last_progress: i64,
    depth_target: i64,
    game_initialized: bool,
    debug: bool
}

impl UciEngine {
    pub fn new(line_rx: Receiver<String>) -> Self {
        let (engine_tx, engine_rx) = unbounded();
        let (clock_tx, clock_rx) = unbounded();

        Self {
            engine: SearchEngine::new(engine_tx),
            clock: Clock::new(clock_tx),
            line_rx,
            engine_rx,
            clock_rx,
            last_info: SearchInfo::default(),
            average_info: SearchInfo::default(),
            time_at_last_progress: 0,
            depth_target: -1,
            game_initialized: false,
            debug: false
        }
    }

    /// The main event loop. Returns the process exit code.
    pub fn run(&mut self) -> i32 {
        let line_rx = self.line_rx.clone();
        let engine_rx = self.engine_rx.clone();
        let clock_rx = self.clock_rx.clone();

        loop {
            select! {
                recv(line_rx) -> line => {
                    match line {
                        Ok(line) => {
                            if self.handle_line(line.trim()) {
                                break;
                            }
                        },
                        Err(_) => break
                    }
                },
                recv(engine_rx) -> event => {
                    if let Ok(event) = event {
                        self.handle_event(event);
                    }
                },
                recv(clock_rx) -> _ => {
                    self.handle_timeout();
                }
            }
        }

        0
    }

    /// Dispatch one input line. Returns true on `quit`.
    fn handle_line(&mut self, line: &str) -> bool {
        debug!(line, "input");

        if line == "uci" {
            self.send_id();
            self.send_options();
            println!("uciok");
        } else if let Some(rest) = line.strip_prefix("debug") {
            self.debug = rest.trim() != "off";
        } else if line == "isready" {
            println!("readyok");
        } else if line.starts_with("setoption") {
            self.parse_setoption(line);
        } else if line.starts_with("register") {
            // noop
        } else if line == "ucinewgame" {
            self.uci_new_game();
        } else if line.starts_with("position") {
            self.parse_position(line);
        } else if line.starts_with("go") {
            self.parse_go(line);
        } else if line == "stop" {
            self.send_best_move(true);
        } else if line == "ponderhit" {
            debug!("ponder search committed");
        } else if line == "quit" {
            self.quit();
            return true;
        } else if line == "board" {
            println!("{}", History::global().current_game().to_fen());
        } else if line.starts_with("tree") {
            let depth = line.split_whitespace().nth(1)
                .and_then(|d| d.parse::<i32>().ok())
                .unwrap_or(1);
            self.engine.print_tree(depth);
        } else if !line.is_empty() {
            warn!(line, "unrecognized command");
        }

        false
    }

    fn send_id(&self) {
        println!("id name Sable {}", env!("CARGO_PKG_VERSION"));
        println!("id author Sable Authors");
    }

    fn send_options(&self) {
        for option in Options::global().all() {
            println!("{}", option.to_uci());
        }
    }

    fn parse_setoption(&mut self, line: &str) {
        let rest = line.trim_start_matches("setoption").trim();
        let rest = match rest.strip_prefix("name") {
            Some(rest) => rest.trim(),
            None => {
                warn!(line, "malformed setoption");
                return;
            }
        };

        let (name, value) = match rest.split_once(" value ") {
            Some((name, value)) => (name.trim(), value.trim()),
            None => (rest, "")
        };
        Options::global().set(name, value);
    }

    /// Reset every process-wide collaborator for a fresh game. Invalid
    /// weights or tablebase paths are fatal here.
    fn uci_new_game(&mut self) {
        if self.engine.is_searching() {
            self.send_best_move(true);
        }
        self.game_initialized = true;

        let syzygy = Options::global().value("SyzygyPath");
        if let Err(error) = sb_chess::tb::TB::global().reset(&syzygy) {
            error!(%error, "tablebase initialization failed");
            std::process::exit(2);
        }

        let weights = Options::global().value("WeightsFile");
        if let Err(error) = NeuralNet::global().set_weights(&weights) {
            error!(%error, "could not load weights");
            std::process::exit(1);
        }
        let cores = Options::global().value_i64("GPUCores").max(0) as usize;
        if let Err(error) = NeuralNet::global().reset(cores) {
            error!(%error, "could not build the network pool");
            std::process::exit(1);
        }

        Hash::global().reset(Options::global().value_i64("Hash").max(1) as usize);
        self.engine.reset();
        self.average_info = SearchInfo::default();
    }

    /// Rebuild the game history from a `position` command. An illegal move
    /// in the list stops the replay; the moves up to it stand.
    fn parse_position(&mut self, line: &str) {
        let captures = match POSITION.captures(line) {
            Some(captures) => captures,
            None => {
                warn!(line, "malformed position command");
                return;
            }
        };

        let chess960 = Options::global().value_bool("UCI_Chess960");
        let mut game = match captures.name("fen") {
            Some(fen) => match Game::from_fen(fen.as_str(), chess960) {
                Ok(game) => game,
                Err(error) => {
                    warn!(%error, "ignoring position command");
                    return;
                }
            },
            None => Game::starting_position()
        };

        History::global().clear();
        History::global().add_game(game.clone());

        if let Some(moves) = captures.name("moves") {
            for text in moves.as_str().split_whitespace() {
                match game.apply_uci(text) {
                    Ok(next) => {
                        game = next;
                        History::global().add_game(game.clone());
                    },
                    Err(error) => {
                        debug_assert!(false, "illegal move in position command: {}", error);
                        warn!(%error, "stopping at illegal move");
                        break;
                    }
                }
            }
        }
    }

    fn parse_go(&mut self, line: &str) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let next_int = |keyword: &str| -> i64 {
            tokens.iter()
                .position(|&t| t == keyword)
                .and_then(|i| tokens.get(i + 1))
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(-1)
        };

        let mut search = Search::new(History::global().current_game());
        search.wtime = next_int("wtime");
        search.btime = next_int("btime");
        search.winc = next_int("winc");
        search.binc = next_int("binc");
        search.movestogo = next_int("movestogo");
        search.depth = next_int("depth");
        search.nodes = next_int("nodes");
        search.mate = next_int("mate");
        search.movetime = next_int("movetime");
        search.infinite = tokens.contains(&"infinite");

        if let Some(index) = tokens.iter().position(|&t| t == "searchmoves") {
            for &token in &tokens[index + 1..] {
                if token.len() < 4 || !token.as_bytes()[0].is_ascii_alphabetic() {
                    break;
                }
                search.search_moves.push(token.to_string());
            }
        }

        self.go(search);
    }

    fn go(&mut self, mut search: Search) {
        if !self.game_initialized {
            self.uci_new_game();
        }
        if self.engine.is_searching() {
            warn!("go while searching, stopping the previous search");
            self.send_best_move(true);
        }

        let game = &search.game;
        self.clock.set_time(Color::White, search.wtime);
        self.clock.set_time(Color::Black, search.btime);
        self.clock.set_increment(Color::White, search.winc);
        self.clock.set_increment(Color::Black, search.binc);
        self.clock.set_move_time(search.movetime);
        self.clock.set_infinite(search.infinite || search.depth != -1 || search.nodes != -1);
        self.clock.set_material_score(
            game.material_score(Color::White) + game.material_score(Color::Black)
        );
        self.clock.set_half_move_number(game.half_move_number());
        self.clock.start_deadline(game.active());

        self.depth_target = search.depth;
        search.time_budget = self.clock.deadline();
        self.time_at_last_progress = 0;
        self.last_info = SearchInfo::default();

        self.engine.start_search(search);
    }

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Info { info, is_partial } => self.send_info(info, is_partial),
            EngineEvent::RequestStop => self.send_best_move(true)
        }
    }

    fn handle_timeout(&mut self) {
        if !self.clock.is_active() {
            return;
        }
        self.send_best_move(false);
    }

    fn send_info(&mut self, info: SearchInfo, is_partial: bool) {
        if !self.clock.is_active() {
            return;
        }
        self.last_info = info;

        if self.clock.has_expired() {
            self.send_best_move(true);
            return;
        }

        let msecs = self.clock.elapsed();
        self.last_info.time = msecs;
        self.clock.update_deadline(&self.last_info);

        if is_partial && (msecs - self.time_at_last_progress) < 2500 {
            return;
        }
        self.time_at_last_progress = msecs;
        self.last_info.calculate_speeds(msecs);

        if self.debug {
            println!(
                "info string isResume {} nodesSearched {} nodesEvaluated {} nodesCreated {} nodesCacheHits {}",
                self.last_info.is_resume,
                self.last_info.worker_info.nodes_searched,
                self.last_info.worker_info.nodes_evaluated,
                self.last_info.worker_info.nodes_created,
                self.last_info.worker_info.nodes_cache_hits
            );
        }

        println!(
            "info depth {} seldepth {} nodes {} nps {} batchSize {} score {} time {} hashfull {} tbhits {} pv {}",
            self.last_info.depth,
            self.last_info.seldepth,
            self.last_info.nodes,
            self.last_info.nps,
            self.last_info.batch_size,
            self.last_info.score,
            self.last_info.time,
            self.last_info.hashfull,
            self.last_info.worker_info.nodes_tb_hits,
            self.last_info.pv
        );

        if self.depth_target != -1 && i64::from(self.last_info.depth) >= self.depth_target {
            self.send_best_move(true);
        }
    }

    /// Emit `bestmove` and wind the search down. When nothing has been
    /// scored yet a non-forced call waits for the next report instead.
    fn send_best_move(&mut self, force: bool) {
        if !self.clock.is_active() && !self.engine.is_searching() {
            return;
        }

        if self.last_info.best_move.is_empty() {
            warn!(force, "deadline reached without a scored move");
            if !force {
                return;
            }
            self.last_info.best_move = self.engine.fallback_best_move()
                .unwrap_or_else(|| "0000".into());
        }

        self.clock.stop();

        if self.last_info.ponder_move.is_empty() {
            println!("bestmove {}", self.last_info.best_move);
        } else {
            println!("bestmove {} ponder {}", self.last_info.best_move, self.last_info.ponder_move);
        }

        self.calculate_rolling_average();
        self.engine.stop_search();
    }

    fn calculate_rolling_average(&mut self) {
        let n = u64::from(History::global().current_game().half_move_number() / 2);
        if n == 0 {
            return;
        }

        let average = &mut self.average_info;
        average.depth = rolling_average(u64::from(average.depth), u64::from(self.last_info.depth), n) as u32;
        average.seldepth = rolling_average(u64::from(average.seldepth), u64::from(self.last_info.seldepth), n) as u32;
        average.nodes = rolling_average(average.nodes, self.last_info.nodes, n);
        average.nps = rolling_average(average.nps, self.last_info.nps, n);

        let averaged = &mut average.worker_info;
        let latest = &self.last_info.worker_info;
        averaged.nodes_searched = rolling_average(averaged.nodes_searched, latest.nodes_searched, n);
        averaged.nodes_evaluated = rolling_average(averaged.nodes_evaluated, latest.nodes_evaluated, n);
        averaged.nodes_created = rolling_average(averaged.nodes_created, latest.nodes_created, n);
        averaged.nodes_tb_hits = rolling_average(averaged.nodes_tb_hits, latest.nodes_tb_hits, n);
        averaged.nodes_cache_hits = rolling_average(averaged.nodes_cache_hits, latest.nodes_cache_hits, n);
    }

    fn quit(&mut self) {
        if self.engine.is_searching() {
            self.send_best_move(true);
        }
        if self.debug {
            println!(
                "info string averages depth {} seldepth {} nodes {} nps {}",
                self.average_info.depth,
                self.average_info.seldepth,
                self.average_info.nodes,
                self.average_info.nps
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_regex_parses_startpos() {
        let captures = POSITION.captures("position startpos").unwrap();
        assert!(captures.name("fen").is_none());
        assert!(captures.name("moves").is_none());
    }

    #[test]
    fn position_regex_parses_startpos_with_moves() {
        let captures = POSITION.captures("position startpos moves e2e4 e7e5").unwrap();
        assert!(captures.name("fen").is_none());
        assert_eq!(captures.name("moves").unwrap().as_str(), "e2e4 e7e5");
    }

    #[test]
    fn position_regex_parses_fen() {
        let line = "position fen 8/8/5K2/3P3k/2P5/8/6Q1/8 w - - 12 68 moves g2g5";
        let captures = POSITION.captures(line).unwrap();
        assert_eq!(captures.name("fen").unwrap().as_str(), "8/8/5K2/3P3k/2P5/8/6Q1/8 w - - 12 68");
        assert_eq!(captures.name("moves").unwrap().as_str(), "g2g5");
    }

    #[test]
    fn rolling_average_converges() {
        let mut average = 0;
        for n in 1..=10 {
            average = rolling_average(average, 100, n);
        }
        assert_eq!(average, 100);
    }
}
