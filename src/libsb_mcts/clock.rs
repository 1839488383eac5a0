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

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use sb_chess::Color;
use sb_utils::options::Options;
use tracing::debug;

use crate::search::SearchInfo;

/// Where the clock is in its move-budget lifecycle. A deadline that fires
/// while the best move is not also the most visited gets one extension up
/// to the full remaining time; the second firing is final.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockState {
    Idle,
    Running,
    Extended,
    Expired
}

struct ClockData {
    state: ClockState,
    white_time: i64,
    white_increment: i64,
    black_time: i64,
    black_increment: i64,
    move_time: i64,
    infinite: bool,
    extra_budget: f32,
    material_score: i32,
    half_move_number: u32,
    on_clock: Color,
    started: Instant,
    deadline: i64,
    best_is_most_visited: bool
}

impl ClockData {
    fn time(&self, color: Color) -> i64 {
        match color {
            Color::White => self.white_time,
            Color::Black => self.black_time
        }
    }

    fn increment(&self, color: Color) -> i64 {
        match color {
            Color::White => self.white_increment,
            Color::Black => self.black_increment
        }
    }

    fn elapsed(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    /// Remaining half moves to the end of the game, from the combined
    /// material count.
    fn expected_half_moves_till_eog(&self) -> i64 {
        let material = i64::from(self.material_score.max(0));
        if material < 20 {
            material + 10
        } else if material <= 60 {
            (0.375 * material as f64).round() as i64 + 22
        } else {
            (1.25 * material as f64).round() as i64 - 30
        }
    }

    fn calculate_deadline(&mut self) {
        if self.infinite {
            self.deadline = -1;
            return;
        }

        let overhead = Options::global().value_i64("MoveOverhead");
        let time = self.time(self.on_clock);
        let increment = self.increment(self.on_clock).max(0);
        let maximum = time - overhead;

        let ideal_base = time / self.expected_half_moves_till_eog().max(1) + increment;
        let ideal_plus_extra = ideal_base + (ideal_base as f64 * f64::from(self.extra_budget)).floor() as i64;
        let opening_factor = f64::from(Options::global().value_f32("OpeningTimeFactor")).max(1.0);
        let ideal = (ideal_plus_extra as f64 * opening_factor).round() as i64;

        let deadline = if self.move_time != -1 {
            self.move_time - overhead
        } else if time != -1 {
            maximum.min(ideal)
        } else {
            5000
        };
        self.deadline = deadline.max(0);
    }
}

struct ClockShared {
    data: Mutex<ClockData>,
    condition: Condvar,
    timeout_tx: Sender<()>
}

/// The time manager. Computes a deadline when a search starts, re-checks
/// it as progress reports arrive, and signals timeout over a channel. One
/// background thread arms the deadline; it never busy-waits.
pub struct Clock {
    shared: Arc<ClockShared>
}

impl Clock {
    pub fn new(timeout_tx: Sender<()>) -> Self {
        let shared = Arc::new(ClockShared {
            data: Mutex::new(ClockData {
                state: ClockState::Idle,
                white_time: -1,
                white_increment: -1,
                black_time: -1,
                black_increment: -1,
                move_time: -1,
                infinite: false,
                extra_budget: 0.0,
                material_score: 0,
                half_move_number: 0,
                on_clock: Color::White,
                started: Instant::now(),
                deadline: -1,
                best_is_most_visited: true
            }),
            condition: Condvar::new(),
            timeout_tx
        });

        {
            let shared = shared.clone();
            thread::Builder::new()
                .name("clock".into())
                .spawn(move || Clock::run_timer(shared))
                .expect("could not spawn clock thread");
        }

        Self { shared }
    }

    fn run_timer(shared: Arc<ClockShared>) {
        let mut data = shared.data.lock().unwrap();
        loop {
            let armed = matches!(data.state, ClockState::Running | ClockState::Extended)
                && data.deadline >= 0;

            if !armed {
                data = shared.condition.wait(data).unwrap();
                continue;
            }

            let remaining = data.deadline - data.elapsed();
            if remaining > 0 {
                let (next, _) = shared.condition
                    .wait_timeout(data, Duration::from_millis(remaining as u64))
                    .unwrap();
                data = next;
                continue;
            }

            Clock::maybe_timeout(&mut data, &shared.timeout_tx);
        }
    }

    /// The deadline fired. Fire the timeout signal, unless the current
    /// best move is not also the most visited and we have not yet been
    /// extended, in which case the deadline grows to the full remaining
    /// time.
    fn maybe_timeout(data: &mut ClockData, timeout_tx: &Sender<()>) {
        if data.best_is_most_visited || data.state == ClockState::Extended {
            data.state = ClockState::Expired;
            let _ = timeout_tx.send(());
            return;
        }

        let overhead = Options::global().value_i64("MoveOverhead");
        let maximum = (data.time(data.on_clock) - overhead).max(0);
        if maximum == 0 || maximum <= data.elapsed() {
            data.state = ClockState::Expired;
            let _ = timeout_tx.send(());
            return;
        }

        debug!(maximum, "extending the deadline, best is not most visited");
        data.state = ClockState::Extended;
        data.deadline = maximum;
    }

    pub fn set_time(&self, color: Color, time: i64) {
        let mut data = self.shared.data.lock().unwrap();
        match color {
            Color::White => data.white_time = time,
            Color::Black => data.black_time = time
        }
    }

    pub fn set_increment(&self, color: Color, increment: i64) {
        let mut data = self.shared.data.lock().unwrap();
        match color {
            Color::White => data.white_increment = increment,
            Color::Black => data.black_increment = increment
        }
    }

    pub fn set_move_time(&self, time: i64) {
        self.shared.data.lock().unwrap().move_time = time;
    }

    pub fn set_infinite(&self, infinite: bool) {
        self.shared.data.lock().unwrap().infinite = infinite;
    }

    pub fn set_extra_budget(&self, extra: f32) {
        self.shared.data.lock().unwrap().extra_budget = extra;
    }

    pub fn set_material_score(&self, score: i32) {
        self.shared.data.lock().unwrap().material_score = score;
    }

    pub fn set_half_move_number(&self, half_move: u32) {
        self.shared.data.lock().unwrap().half_move_number = half_move;
    }

    /// Arm the deadline for the side to move. Resets any extension from
    /// the previous move.
    pub fn start_deadline(&self, on_clock: Color) {
        let mut data = self.shared.data.lock().unwrap();
        data.on_clock = on_clock;
        data.started = Instant::now();
        data.best_is_most_visited = true;
        data.state = ClockState::Running;
        data.calculate_deadline();
        debug!(deadline = data.deadline, half_move = data.half_move_number, "deadline armed");
        self.shared.condition.notify_all();
    }

    /// Fold a progress report into the deadline decision.
    pub fn update_deadline(&self, info: &SearchInfo) {
        let mut data = self.shared.data.lock().unwrap();
        if data.state == ClockState::Idle {
            return;
        }
        data.best_is_most_visited = info.best_is_most_visited;
        if data.state == ClockState::Running {
            data.calculate_deadline();
        }
        self.shared.condition.notify_all();
    }

    pub fn stop(&self) {
        let mut data = self.shared.data.lock().unwrap();
        data.state = ClockState::Idle;
        self.shared.condition.notify_all();
    }

    pub fn state(&self) -> ClockState {
        self.shared.data.lock().unwrap().state
    }

    pub fn is_active(&self) -> bool {
        self.state() != ClockState::Idle
    }

    pub fn is_extended(&self) -> bool {
        self.state() == ClockState::Extended
    }

    pub fn elapsed(&self) -> i64 {
        self.shared.data.lock().unwrap().elapsed()
    }

    pub fn deadline(&self) -> i64 {
        self.shared.data.lock().unwrap().deadline
    }

    pub fn time_to_deadline(&self) -> i64 {
        let data = self.shared.data.lock().unwrap();
        if data.infinite || data.deadline < 0 {
            return -1;
        }
        data.deadline - data.elapsed()
    }

    pub fn has_expired(&self) -> bool {
        let data = self.shared.data.lock().unwrap();
        if data.infinite || data.deadline < 0 {
            return false;
        }
        data.elapsed() >= data.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn clock() -> (Clock, crossbeam_channel::Receiver<()>) {
        let (tx, rx) = unbounded();
        (Clock::new(tx), rx)
    }

    #[test]
    fn infinite_never_fires() {
        let (clock, rx) = clock();
        clock.set_infinite(true);
        clock.start_deadline(Color::White);

        assert_eq!(clock.deadline(), -1);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(!clock.has_expired());
        clock.stop();
    }

    #[test]
    fn move_time_sets_the_deadline() {
        let (clock, _rx) = clock();
        clock.set_move_time(1000);
        clock.start_deadline(Color::White);

        let overhead = Options::global().value_i64("MoveOverhead");
        assert_eq!(clock.deadline(), 1000 - overhead);
        clock.stop();
    }

    #[test]
    fn short_move_time_fires_timeout() {
        let (clock, rx) = clock();
        clock.set_move_time(1);
        clock.start_deadline(Color::Black);

        assert!(rx.recv_timeout(Duration::from_millis(500)).is_ok());
        assert_eq!(clock.state(), ClockState::Expired);
        clock.stop();
    }

    #[test]
    fn unconvincing_best_move_extends_once() {
        let (clock, rx) = clock();
        clock.set_time(Color::White, 10_000);
        clock.set_increment(Color::White, 0);
        clock.set_move_time(350);
        clock.start_deadline(Color::White);

        let info = SearchInfo {
            best_is_most_visited: false,
            ..Default::default()
        };
        clock.update_deadline(&info);

        // first firing extends instead of timing out
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(clock.state(), ClockState::Extended);
        assert!(rx.try_recv().is_err());
        clock.stop();
    }

    #[test]
    fn material_heuristic_matches_the_bands() {
        let (clock, _rx) = clock();
        {
            let mut data = clock.shared.data.lock().unwrap();
            data.material_score = 10;
            assert_eq!(data.expected_half_moves_till_eog(), 20);
            data.material_score = 40;
            assert_eq!(data.expected_half_moves_till_eog(), 37);
            data.material_score = 78;
            assert_eq!(data.expected_half_moves_till_eog(), 68);
        }
    }

    #[test]
    fn remaining_time_bounds_the_ideal_budget() {
        let (clock, _rx) = clock();
        clock.set_time(Color::White, 2_000);
        clock.set_increment(Color::White, 0);
        clock.set_material_score(78);
        clock.start_deadline(Color::White);

        let overhead = Options::global().value_i64("MoveOverhead");
        // ideal = round(2000/68 * 2.15) = 62 < 2000 - overhead
        assert!(clock.deadline() <= 2_000 - overhead);
        assert!(clock.deadline() < 100);
        clock.stop();
    }
}
