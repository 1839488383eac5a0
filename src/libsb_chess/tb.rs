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

use shakmaty::{Chess, Move};
use shakmaty_syzygy::{Tablebase, Wdl};
use thiserror::Error;
use tracing::info;

use crate::Game;

#[derive(Debug, Error)]
pub enum TbError {
    #[error("invalid syzygy path `{0}`")]
    InvalidPath(String),

    #[error("no tablebase files found in `{0}`")]
    Empty(String)
}

/// The outcome of a tablebase probe, from the perspective of the side that
/// just moved. The syzygy files answer for the side to move, so results are
/// inverted at this boundary and nowhere else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    NotFound,
    Win,
    Loss,
    Draw
}

struct TbInner {
    tables: Option<Tablebase<Chess>>
}

/// Process-wide Syzygy endgame tablebase access. Configured from the
/// `SyzygyPath` option at `ucinewgame`; disabled when the path is empty.
pub struct TB {
    inner: Mutex<TbInner>
}

lazy_static! {
    static ref TB_INSTANCE: TB = TB {
        inner: Mutex::new(TbInner { tables: None })
    };
}

fn invert(wdl: Wdl) -> Probe {
    match wdl {
        Wdl::Loss => Probe::Win,
        Wdl::Win => Probe::Loss,
        Wdl::CursedWin | Wdl::BlessedLoss | Wdl::Draw => Probe::Draw
    }
}

impl TB {
    pub fn global() -> &'static TB {
        &TB_INSTANCE
    }

    /// Re-initialize from the given directory. An empty path disables
    /// probing.
    pub fn reset(&self, path: &str) -> Result<(), TbError> {
        let mut inner = self.inner.lock().unwrap();

        if path.is_empty() {
            inner.tables = None;
            return Ok(());
        }

        let mut tables = Tablebase::new();
        tables.add_directory(path)
            .map_err(|_| TbError::InvalidPath(path.into()))?;
        if tables.max_pieces() == 0 {
            return Err(TbError::Empty(path.into()));
        }

        info!(max_pieces = tables.max_pieces(), path, "using syzygy tablebases");
        inner.tables = Some(tables);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().tables.is_some()
    }

    /// WDL probe for search leaves. Positions with castling rights, a
    /// non-zero fifty-move clock, or too many pieces are not probed.
    pub fn probe(&self, game: &Game) -> Probe {
        let inner = self.inner.lock().unwrap();
        let tables = match &inner.tables {
            Some(tables) => tables,
            None => return Probe::NotFound
        };

        if game.half_move_clock() != 0 || game.has_castling_rights() {
            return Probe::NotFound;
        }
        if game.piece_count() as usize > tables.max_pieces() as usize {
            return Probe::NotFound;
        }

        match tables.probe_wdl_after_zeroing(game.chess()) {
            Ok(wdl) => invert(wdl),
            Err(_) => Probe::NotFound
        }
    }

    /// Root probe: picks the best move by WDL class (then shortest distance
    /// to zeroing among wins) and returns it with a distance estimate and
    /// the outcome from the mover's perspective. Returns `None` when the
    /// root is not a tablebase position.
    pub fn probe_dtz(&self, game: &Game) -> Option<(Move, i32, Probe)> {
        let inner = self.inner.lock().unwrap();
        let tables = inner.tables.as_ref()?;

        if game.has_castling_rights() || game.piece_count() as usize > tables.max_pieces() as usize {
            return None;
        }

        let mut best: Option<(Move, Wdl, i32)> = None;
        for mv in game.legal_moves() {
            let after = game.make_move(mv);
            let wdl = match tables.probe_wdl_after_zeroing(after.chess()) {
                Ok(wdl) => -wdl, // back to the mover's perspective
                Err(_) => return None
            };
            let dtz = tables.probe_dtz(after.chess())
                .map(|d| d.ignore_rounding().0.abs())
                .unwrap_or(0);

            let better = match &best {
                None => true,
                Some((_, best_wdl, best_dtz)) => {
                    wdl > *best_wdl || (wdl == *best_wdl && dtz < *best_dtz)
                }
            };
            if better {
                best = Some((mv, wdl, dtz));
            }
        }

        best.map(|(mv, wdl, dtz)| {
            let outcome = match wdl {
                Wdl::Win => Probe::Win,
                Wdl::Loss => Probe::Loss,
                _ => Probe::Draw
            };
            (mv, dtz.max(1), outcome)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_probe_finds_nothing() {
        let tb = TB {
            inner: Mutex::new(TbInner { tables: None })
        };
        let game = Game::from_fen("4k3/8/8/8/8/1R6/8/4K3 b - - 0 40", false).unwrap();

        assert!(!tb.is_enabled());
        assert_eq!(tb.probe(&game), Probe::NotFound);
        assert!(tb.probe_dtz(&game).is_none());
    }

    #[test]
    fn empty_path_disables() {
        let tb = TB {
            inner: Mutex::new(TbInner { tables: None })
        };

        assert!(tb.reset("").is_ok());
        assert!(!tb.is_enabled());
    }

    #[test]
    fn bogus_path_is_an_error() {
        let tb = TB {
            inner: Mutex::new(TbInner { tables: None })
        };

        assert!(tb.reset("/definitely/not/a/real/path").is_err());
    }
}
