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

//! Encoding of a position and its history into the 112 input planes the
//! network consumes: 8 history positions of 13 planes each (six piece
//! planes per side plus a repetition plane), then castling rights, side to
//! move, the fifty-move clock, one spare plane, and an all-ones plane so
//! the network can find the board edge. Everything is encoded from the
//! perspective of the side to move; when Black is to move the boards are
//! mirrored vertically.

use sb_chess::{Color, Game, Role};

pub const MOVE_HISTORY: usize = 8;
pub const PLANES_PER_POSITION: usize = 13;
const PLANE_BASE: usize = MOVE_HISTORY * PLANES_PER_POSITION;
pub const INPUT_PLANES: usize = PLANE_BASE + 8;

const ROLES: [Role; 6] = [
    Role::Pawn,
    Role::Knight,
    Role::Bishop,
    Role::Rook,
    Role::Queen,
    Role::King
];

/// One input plane: a 64-bit occupancy mask scaled by `value`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Plane {
    pub mask: u64,
    pub value: f32
}

impl Default for Plane {
    fn default() -> Self {
        Self { mask: 0, value: 1.0 }
    }
}

impl Plane {
    fn set_all(&mut self) {
        self.mask = !0;
        self.value = 1.0;
    }

    fn fill(&mut self, value: f32) {
        self.mask = !0;
        self.value = value;
    }
}

#[derive(Clone, Debug)]
pub struct InputPlanes {
    pub planes: [Plane; INPUT_PLANES]
}

impl Default for InputPlanes {
    fn default() -> Self {
        Self { planes: [Plane::default(); INPUT_PLANES] }
    }
}

/// Vertical mirror of a bitboard (rank 1 becomes rank 8).
fn mirror(mask: u64) -> u64 {
    mask.swap_bytes()
}

fn encode_position(result: &mut InputPlanes, i: usize, game: &Game, us: Color, flip: bool) {
    let base = i * PLANES_PER_POSITION;
    let them = !us;

    for (j, &role) in ROLES.iter().enumerate() {
        let ours = game.bitboard(us, role);
        let theirs = game.bitboard(them, role);

        result.planes[base + j].mask = if flip { mirror(ours) } else { ours };
        result.planes[base + 6 + j].mask = if flip { mirror(theirs) } else { theirs };
    }

    if game.repetitions() >= 1 {
        result.planes[base + 12].set_all();
    }
}

/// Encode a position and its history.
///
/// # Arguments
///
/// * `games` - the position to evaluate first, then its predecessors in
///   reverse order of play; anything past the plane history is ignored
///
pub fn encode(games: &[Game]) -> InputPlanes {
    let mut result = InputPlanes::default();
    let current = &games[0];
    let us = current.active();
    let flip = us == Color::Black;

    let mut encoded = 0;
    for game in games.iter().take(MOVE_HISTORY) {
        encode_position(&mut result, encoded, game, us, flip);
        encoded += 1;
    }

    // repeat the oldest position so short games still fill all eight
    // slots, unless the history genuinely starts at the initial position
    let last = &games[encoded - 1];
    if !last.is_same_position(&Game::starting_position()) {
        while encoded < MOVE_HISTORY {
            encode_position(&mut result, encoded, last, us, flip);
            encoded += 1;
        }
    }

    use sb_chess::CastlingSide::{KingSide, QueenSide};
    if current.can_castle(us, QueenSide) {
        result.planes[PLANE_BASE].set_all();
    }
    if current.can_castle(us, KingSide) {
        result.planes[PLANE_BASE + 1].set_all();
    }
    if current.can_castle(!us, QueenSide) {
        result.planes[PLANE_BASE + 2].set_all();
    }
    if current.can_castle(!us, KingSide) {
        result.planes[PLANE_BASE + 3].set_all();
    }
    if us == Color::Black {
        result.planes[PLANE_BASE + 4].set_all();
    }
    result.planes[PLANE_BASE + 5].fill(current.half_move_clock() as f32);
    // plane PLANE_BASE + 6 stays empty
    result.planes[PLANE_BASE + 7].set_all();

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startpos_planes() {
        let game = Game::starting_position();
        let planes = encode(&[game]);

        // our pawns on rank 2
        assert_eq!(planes.planes[0].mask, 0x0000_0000_0000_ff00);
        // their pawns on rank 7
        assert_eq!(planes.planes[6].mask, 0x00ff_0000_0000_0000);
        // all four castling planes set, white to move
        for i in 0..4 {
            assert_eq!(planes.planes[PLANE_BASE + i].mask, !0);
        }
        assert_eq!(planes.planes[PLANE_BASE + 4].mask, 0);
        // edge-finder plane
        assert_eq!(planes.planes[PLANE_BASE + 7].mask, !0);
    }

    #[test]
    fn startpos_does_not_fake_history() {
        let game = Game::starting_position();
        let planes = encode(&[game]);

        // the second history slot stays empty
        assert_eq!(planes.planes[PLANES_PER_POSITION].mask, 0);
    }

    #[test]
    fn black_perspective_is_mirrored() {
        let game = Game::starting_position().apply_uci("e2e4").unwrap();
        let planes = encode(&[game.clone()]);

        // black to move: "our" pawns are black's, mirrored onto rank 2
        assert_eq!(planes.planes[0].mask, 0x0000_0000_0000_ff00);
        assert_eq!(planes.planes[PLANE_BASE + 4].mask, !0);

        // the white e-pawn shows up among "their" pawns
        let theirs = planes.planes[6].mask;
        assert_eq!(theirs.count_ones(), 8);
        assert_ne!(theirs, 0x0000_0000_0000_ff00u64.swap_bytes());
    }

    #[test]
    fn history_fills_with_oldest_position() {
        let a = Game::from_fen("4k3/8/8/8/8/1R6/8/4K3 w - - 4 40", false).unwrap();
        let b = a.apply_uci("b3b4").unwrap();
        let planes = encode(&[b, a.clone()]);

        // slots 2.. repeat position `a`
        let rook_in_slot_1 = planes.planes[PLANES_PER_POSITION + 9].mask;
        let rook_in_slot_7 = planes.planes[7 * PLANES_PER_POSITION + 9].mask;
        assert_eq!(rook_in_slot_1, rook_in_slot_7);
        assert_ne!(rook_in_slot_1, 0);
    }

    #[test]
    fn rule_fifty_plane_carries_the_clock() {
        let game = Game::from_fen("8/8/5K2/3P3k/2P5/8/6Q1/8 w - - 12 68", false).unwrap();
        let planes = encode(&[game]);

        assert_eq!(planes.planes[PLANE_BASE + 5].value, 12.0);
    }
}
