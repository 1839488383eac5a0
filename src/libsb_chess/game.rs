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

use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::zobrist::{Zobrist64, ZobristHash};
use shakmaty::{CastlingMode, CastlingSide, Chess, Color, EnPassantMode, Move, Position, Role};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GameError {
    #[error("invalid fen `{0}`")]
    InvalidFen(String),

    #[error("unparsable move `{0}`")]
    InvalidMove(String),

    #[error("illegal move `{0}`")]
    IllegalMove(String)
}

/// An immutable snapshot of the chessboard, together with the move that
/// produced it and a lazily tallied repetition count (`-1` = unknown).
///
/// All rules questions (legality, check, draws by material) are answered by
/// the embedded `shakmaty` position; this type adds the identity and history
/// semantics the search cares about.
#[derive(Clone, Debug)]
pub struct Game {
    chess: Chess,
    last_move: Option<Move>,
    repetitions: i8
}

impl Default for Game {
    fn default() -> Self {
        Self::starting_position()
    }
}

impl Game {
    pub fn starting_position() -> Self {
        Self {
            chess: Chess::default(),
            last_move: None,
            repetitions: -1
        }
    }

    /// Build a game from a FEN string.
    ///
    /// # Arguments
    ///
    /// * `fen` -
    /// * `chess960` - interpret castling rights with Chess960 semantics
    ///
    pub fn from_fen(fen: &str, chess960: bool) -> Result<Self, GameError> {
        let mode = if chess960 { CastlingMode::Chess960 } else { CastlingMode::Standard };
        let parsed: Fen = fen.trim().parse()
            .map_err(|_| GameError::InvalidFen(fen.into()))?;
        let chess: Chess = parsed.into_position(mode)
            .map_err(|_| GameError::InvalidFen(fen.into()))?;

        Ok(Self { chess, last_move: None, repetitions: -1 })
    }

    pub fn to_fen(&self) -> String {
        Fen::from_position(&self.chess, EnPassantMode::Legal).to_string()
    }

    /// Returns the position that results from playing `mv`, which must be a
    /// legal move in this position.
    pub fn make_move(&self, mv: Move) -> Game {
        let mut chess = self.chess.clone();
        chess.play_unchecked(mv);

        Game {
            chess,
            last_move: Some(mv),
            repetitions: -1
        }
    }

    /// Parse a move in UCI notation and apply it, checking legality.
    pub fn apply_uci(&self, text: &str) -> Result<Game, GameError> {
        let uci: UciMove = text.parse()
            .map_err(|_| GameError::InvalidMove(text.into()))?;
        let mv = uci.to_move(&self.chess)
            .map_err(|_| GameError::IllegalMove(text.into()))?;

        Ok(self.make_move(mv))
    }

    pub fn legal_moves(&self) -> Vec<Move> {
        self.chess.legal_moves().to_vec()
    }

    pub fn chess(&self) -> &Chess {
        &self.chess
    }

    pub fn last_move(&self) -> Option<Move> {
        self.last_move
    }

    pub fn last_move_uci(&self) -> String {
        match self.last_move {
            Some(mv) => mv.to_uci(self.chess.castles().mode()).to_string(),
            None => String::new()
        }
    }

    pub fn active(&self) -> Color {
        self.chess.turn()
    }

    pub fn zobrist(&self) -> u64 {
        self.chess.zobrist_hash::<Zobrist64>(EnPassantMode::Legal).0
    }

    pub fn half_move_clock(&self) -> u32 {
        self.chess.halfmoves()
    }

    /// The number of half moves played since the start of the game.
    pub fn half_move_number(&self) -> u32 {
        let full = u32::from(self.chess.fullmoves());
        (full - 1) * 2 + if self.chess.turn() == Color::Black { 1 } else { 0 }
    }

    pub fn is_checkmate(&self) -> bool {
        self.chess.is_checkmate()
    }

    pub fn is_stalemate(&self) -> bool {
        self.chess.is_stalemate()
    }

    pub fn is_in_check(&self) -> bool {
        self.chess.is_check()
    }

    /// A position in which no sequence of legal moves can lead to mate.
    pub fn is_dead_position(&self) -> bool {
        self.chess.is_insufficient_material()
    }

    pub fn repetitions(&self) -> i8 {
        self.repetitions
    }

    pub fn set_repetitions(&mut self, repetitions: i8) {
        self.repetitions = repetitions;
    }

    /// Whether the two snapshots denote the same position for repetition
    /// purposes: the same placement, side to move, castling rights, and
    /// en-passant possibilities. Clocks are deliberately excluded.
    pub fn is_same_position(&self, other: &Game) -> bool {
        self.chess.board() == other.chess.board()
            && self.chess.turn() == other.chess.turn()
            && self.chess.castles().castling_rights() == other.chess.castles().castling_rights()
            && self.chess.ep_square(EnPassantMode::Legal) == other.chess.ep_square(EnPassantMode::Legal)
    }

    pub fn has_castling_rights(&self) -> bool {
        self.chess.castles().any()
    }

    pub fn can_castle(&self, color: Color, side: CastlingSide) -> bool {
        self.chess.castles().has(color, side)
    }

    pub fn piece_count(&self) -> u32 {
        self.chess.board().occupied().count() as u32
    }

    /// The occupancy of the given color and role, as a bitboard.
    pub fn bitboard(&self, color: Color, role: Role) -> u64 {
        (self.chess.board().by_color(color) & self.chess.board().by_role(role)).0
    }

    pub fn occupied_by(&self, color: Color) -> u64 {
        self.chess.board().by_color(color).0
    }

    /// The classic 1/3/3/5/9 material count for one side, in pawns.
    pub fn material_score(&self, color: Color) -> i32 {
        const VALUES: [(Role, i32); 5] = [
            (Role::Pawn, 1),
            (Role::Knight, 3),
            (Role::Bishop, 3),
            (Role::Rook, 5),
            (Role::Queen, 9)
        ];

        VALUES.iter()
            .map(|&(role, value)| {
                let pieces = self.chess.board().by_color(color) & self.chess.board().by_role(role);
                pieces.count() as i32 * value
            })
            .sum()
    }
}

/// Format a move in the UCI notation the given game expects (castling is
/// rendered differently under Chess960).
pub fn move_to_uci(game: &Game, mv: Move) -> String {
    mv.to_uci(game.chess().castles().mode()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startpos_has_twenty_moves() {
        let game = Game::starting_position();

        assert_eq!(game.legal_moves().len(), 20);
        assert_eq!(game.active(), Color::White);
        assert_eq!(game.half_move_number(), 0);
    }

    #[test]
    fn fen_round_trip() {
        let fen = "8/8/5K2/3P3k/2P5/8/6Q1/8 w - - 12 68";
        let game = Game::from_fen(fen, false).unwrap();

        assert_eq!(game.to_fen(), fen);
        assert_eq!(game.half_move_clock(), 12);
    }

    #[test]
    fn invalid_fen_is_rejected() {
        assert!(Game::from_fen("not a fen", false).is_err());
    }

    #[test]
    fn make_move_switches_side() {
        let game = Game::starting_position();
        let next = game.apply_uci("e2e4").unwrap();

        assert_eq!(next.active(), Color::Black);
        assert_eq!(next.last_move_uci(), "e2e4");
        assert_eq!(next.half_move_number(), 1);
    }

    #[test]
    fn illegal_move_is_rejected() {
        let game = Game::starting_position();

        assert!(game.apply_uci("e2e5").is_err());
        assert!(game.apply_uci("zz99").is_err());
    }

    #[test]
    fn zobrist_matches_for_transposition() {
        let a = Game::starting_position()
            .apply_uci("e2e4").unwrap()
            .apply_uci("e7e5").unwrap()
            .apply_uci("g1f3").unwrap();
        let b = Game::starting_position()
            .apply_uci("g1f3").unwrap()
            .apply_uci("e7e5").unwrap()
            .apply_uci("e2e4").unwrap();

        assert_eq!(a.zobrist(), b.zobrist());
        assert!(a.is_same_position(&b));
    }

    #[test]
    fn same_position_ignores_clocks() {
        let a = Game::from_fen("4k3/8/8/8/8/8/8/4K3 w - - 0 1", false).unwrap();
        let b = Game::from_fen("4k3/8/8/8/8/8/8/4K3 w - - 30 60", false).unwrap();

        assert!(a.is_same_position(&b));
    }

    #[test]
    fn material_score_of_startpos() {
        let game = Game::starting_position();

        assert_eq!(game.material_score(Color::White), 8 + 6 + 6 + 10 + 9);
        assert_eq!(game.material_score(Color::White), game.material_score(Color::Black));
    }

    #[test]
    fn mate_is_detected() {
        let game = Game::from_fen("rnb1kbnr/pppp1ppp/4p3/8/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3", false).unwrap();

        assert!(game.is_checkmate());
        assert!(game.legal_moves().is_empty());
    }

    #[test]
    fn bare_kings_are_dead() {
        let game = Game::from_fen("4k3/8/8/8/8/8/8/4K3 w - - 0 1", false).unwrap();

        assert!(game.is_dead_position());
    }
}
