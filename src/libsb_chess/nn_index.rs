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

//! Canonical indexing of the network's policy head. Every chess move maps
//! into one of 1858 slots: 1792 queen-like or knight-like from/to pairs,
//! plus 66 under-promotions. Queen promotions share the slot of the plain
//! pawn move. Moves are always indexed from White's perspective; a position
//! with Black to move mirrors the move vertically first.

use std::collections::HashMap;

use shakmaty::{Move, Role, Square};

/// The size of the policy head.
pub const POLICY_SIZE: usize = 1858;

/// A packed (from, to, promotion) key. Promotion uses 0 for none.
fn pack(from: u8, to: u8, promotion: u8) -> u32 {
    u32::from(from) | u32::from(to) << 6 | u32::from(promotion) << 12
}

fn promotion_code(role: Role) -> u8 {
    match role {
        Role::Knight => 1,
        Role::Bishop => 2,
        Role::Rook => 3,
        _ => 0
    }
}

struct PolicyMap {
    index_of: HashMap<u32, u16>,
    squares_of: Vec<(u8, u8, Option<Role>)>
}

impl PolicyMap {
    fn build() -> Self {
        let mut squares_of = Vec::with_capacity(POLICY_SIZE);

        // queen-like rays and knight jumps from every square
        const RAYS: [(i32, i32); 8] = [
            (0, 1), (0, -1), (1, 0), (-1, 0),
            (1, 1), (1, -1), (-1, 1), (-1, -1)
        ];
        const JUMPS: [(i32, i32); 8] = [
            (1, 2), (2, 1), (2, -1), (1, -2),
            (-1, -2), (-2, -1), (-2, 1), (-1, 2)
        ];

        for from in 0..64i32 {
            let (file, rank) = (from % 8, from / 8);

            for &(df, dr) in &RAYS {
                let (mut f, mut r) = (file + df, rank + dr);
                while (0..8).contains(&f) && (0..8).contains(&r) {
                    squares_of.push((from as u8, (r * 8 + f) as u8, None));
                    f += df;
                    r += dr;
                }
            }

            for &(df, dr) in &JUMPS {
                let (f, r) = (file + df, rank + dr);
                if (0..8).contains(&f) && (0..8).contains(&r) {
                    squares_of.push((from as u8, (r * 8 + f) as u8, None));
                }
            }
        }

        // under-promotions, White's frame only (rank 7 to rank 8)
        for file in 0..8i32 {
            let from = 48 + file;
            for df in [-1, 0, 1] {
                let f = file + df;
                if !(0..8).contains(&f) {
                    continue;
                }
                let to = 56 + f;
                for role in [Role::Knight, Role::Bishop, Role::Rook] {
                    squares_of.push((from as u8, to as u8, Some(role)));
                }
            }
        }

        debug_assert_eq!(squares_of.len(), POLICY_SIZE);

        let mut index_of = HashMap::with_capacity(POLICY_SIZE);
        for (i, &(from, to, promotion)) in squares_of.iter().enumerate() {
            let code = promotion.map(promotion_code).unwrap_or(0);
            index_of.insert(pack(from, to, code), i as u16);
        }

        Self { index_of, squares_of }
    }
}

lazy_static! {
    static ref POLICY_MAP: PolicyMap = PolicyMap::build();
}

/// The king's destination square for a castling move, in the standard
/// encoding the policy head expects.
fn castle_king_to(king: Square, rook: Square) -> Square {
    let rank_base = u8::from(king) & !7;
    if u8::from(rook) > u8::from(king) {
        Square::new(u32::from(rank_base) + 6) // g-file
    } else {
        Square::new(u32::from(rank_base) + 2) // c-file
    }
}

/// Returns the policy index of the given move.
///
/// # Arguments
///
/// * `mv` -
/// * `flip` - mirror the move vertically first (Black to move)
///
pub fn move_to_index(mv: &Move, flip: bool) -> usize {
    let (from, to) = match *mv {
        Move::Castle { king, rook } => (king, castle_king_to(king, rook)),
        _ => (mv.from().expect("drops are not reachable"), mv.to())
    };

    let (from, to) = if flip {
        (from.flip_vertical(), to.flip_vertical())
    } else {
        (from, to)
    };

    let code = match mv.promotion() {
        Some(Role::Queen) | None => 0,
        Some(role) => promotion_code(role)
    };

    let key = pack(u8::from(from), u8::from(to), code);
    usize::from(*POLICY_MAP.index_of.get(&key).expect("move outside policy space"))
}

/// Returns the (from, to, promotion) triple a policy slot denotes, in
/// White's frame. Used by backends that score moves geometrically.
pub fn index_to_squares(index: usize) -> (u8, u8, Option<Role>) {
    POLICY_MAP.squares_of[index]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Game;

    #[test]
    fn policy_space_is_exactly_1858() {
        let map = PolicyMap::build();

        assert_eq!(map.squares_of.len(), POLICY_SIZE);
        assert_eq!(map.index_of.len(), POLICY_SIZE);
    }

    #[test]
    fn every_legal_move_has_an_index() {
        let game = Game::starting_position();
        for mv in game.legal_moves() {
            let index = move_to_index(&mv, false);
            assert!(index < POLICY_SIZE);
        }
    }

    #[test]
    fn mirrored_moves_share_an_index() {
        // e2e4 for White and e7e5 for Black are the same move in the
        // network's frame.
        let white = Game::starting_position();
        let e2e4 = white.legal_moves().into_iter()
            .find(|mv| move_to_uci_plain(mv) == "e2e4").unwrap();

        let black = white.make_move(e2e4);
        let e7e5 = black.legal_moves().into_iter()
            .find(|mv| move_to_uci_plain(mv) == "e7e5").unwrap();

        assert_eq!(move_to_index(&e2e4, false), move_to_index(&e7e5, true));
    }

    #[test]
    fn queen_promotion_shares_the_pawn_slot() {
        let game = Game::from_fen("8/4P1k1/8/8/8/8/8/4K3 w - - 0 1", false).unwrap();
        let moves = game.legal_moves();

        let queen = moves.iter().find(|mv| mv.promotion() == Some(Role::Queen)).unwrap();
        let knight = moves.iter().find(|mv| mv.promotion() == Some(Role::Knight)).unwrap();

        let queen_index = move_to_index(queen, false);
        let knight_index = move_to_index(knight, false);

        assert_ne!(queen_index, knight_index);
        assert!(queen_index < 1792);
        assert!(knight_index >= 1792);
    }

    #[test]
    fn castling_is_a_king_ray_move() {
        let game = Game::from_fen("r3k2r/pppppppp/8/8/8/8/PPPPPPPP/R3K2R w KQkq - 0 1", false).unwrap();
        let castle = game.legal_moves().into_iter()
            .find(|mv| mv.is_castle() && mv.to() > mv.from().unwrap())
            .unwrap();

        // e1g1 in the policy frame
        let plain = (4u8, 6u8, None);
        let index = move_to_index(&castle, false);
        assert_eq!(index_to_squares(index), plain);
    }

    fn move_to_uci_plain(mv: &Move) -> String {
        mv.to_uci(shakmaty::CastlingMode::Standard).to_string()
    }
}
