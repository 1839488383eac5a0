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

use std::sync::Mutex;

use sb_chess::Game;

/// The append-only list of positions played so far this game. Repetition
/// counts are tallied once, on append, walking backwards until an
/// irreversible move resets the fifty-move clock. Shared by three-fold
/// detection across root changes and by the NN history planes.
pub struct History {
    games: Mutex<Vec<Game>>
}

lazy_static! {
    static ref HISTORY: History = History {
        games: Mutex::new(vec! [])
    };
}

impl History {
    pub fn global() -> &'static History {
        &HISTORY
    }

    /// Append a position, storing how many times it occurred before.
    pub fn add_game(&self, game: Game) {
        let mut games = self.games.lock().unwrap();

        let mut repetitions: i8 = 0;
        for earlier in games.iter().rev() {
            if game.is_same_position(earlier) {
                repetitions += 1;
            }
            if repetitions >= 2 {
                break;
            }
            if earlier.half_move_clock() == 0 {
                break;
            }
        }

        let mut game = game;
        game.set_repetitions(repetitions);
        games.push(game);
    }

    pub fn current_game(&self) -> Game {
        self.games.lock().unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
    }

    /// The stored games, most recent last.
    pub fn games(&self) -> Vec<Game> {
        self.games.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.games.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.games.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> History {
        History { games: Mutex::new(vec! []) }
    }

    #[test]
    fn empty_history_yields_startpos() {
        let history = fresh();

        assert!(history.is_empty());
        assert!(history.current_game().is_same_position(&Game::starting_position()));
    }

    #[test]
    fn knight_shuffle_counts_repetitions() {
        let history = fresh();
        let mut game = Game::starting_position();
        history.add_game(game.clone());

        for mv in ["g1f3", "g8f6", "f3g1", "f6g8", "g1f3", "g8f6", "f3g1", "f6g8"] {
            game = game.apply_uci(mv).unwrap();
            history.add_game(game.clone());
        }

        // the final position is the start position for the third time
        assert_eq!(history.current_game().repetitions(), 2);
    }

    #[test]
    fn irreversible_move_resets_counting() {
        let history = fresh();
        let mut game = Game::starting_position();
        history.add_game(game.clone());

        for mv in ["g1f3", "g8f6", "f3g1", "f6g8", "e2e4"] {
            game = game.apply_uci(mv).unwrap();
            history.add_game(game.clone());
        }

        // the pawn push zeroed the clock; nothing before it counts
        for mv in ["b8c6", "b1c3", "c6b8", "c3b1"] {
            game = game.apply_uci(mv).unwrap();
            history.add_game(game.clone());
        }

        assert_eq!(history.current_game().repetitions(), 1);
    }

    #[test]
    fn clear_empties_the_list() {
        let history = fresh();
        history.add_game(Game::starting_position());
        history.clear();

        assert!(history.is_empty());
    }
}
