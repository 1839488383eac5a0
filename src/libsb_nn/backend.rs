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

use std::sync::Arc;

use sb_chess::nn_index::{index_to_squares, POLICY_SIZE};
use sb_utils::math;

use crate::loader::{NetError, Weights};
use crate::planes::InputPlanes;

/// The value and policy produced for one position. `q` is in `[-1, +1]`
/// from the perspective of the side to move; `policy` covers the full
/// policy space and is positive everywhere.
pub struct Output {
    pub q: f32,
    pub policy: Vec<f32>
}

/// A network implementation. Implementations are shared by the pool and
/// must be callable from any thread.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run a forward pass over a batch of encoded positions.
    fn forward(&self, inputs: &[InputPlanes]) -> Vec<Output>;
}

/// One batched evaluation in flight: positions are added one by one, then
/// evaluated together with a single blocking call.
pub struct Computation {
    backend: Arc<dyn Backend>,
    inputs: Vec<InputPlanes>,
    outputs: Vec<Output>
}

impl Computation {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            inputs: vec! [],
            outputs: vec! []
        }
    }

    /// Queue a position, returning its index within the batch.
    pub fn add_position(&mut self, planes: InputPlanes) -> usize {
        self.inputs.push(planes);
        self.inputs.len() - 1
    }

    pub fn positions(&self) -> usize {
        self.inputs.len()
    }

    /// Run the forward pass. Blocks until every queued position has been
    /// evaluated.
    pub fn evaluate(&mut self) -> Result<(), NetError> {
        let outputs = self.backend.forward(&self.inputs);

        if outputs.len() != self.inputs.len() {
            return Err(NetError::PositionCountMismatch {
                expected: self.inputs.len(),
                actual: outputs.len()
            });
        }

        self.outputs = outputs;
        Ok(())
    }

    pub fn q_val(&self, index: usize) -> f32 {
        self.outputs[index].q
    }

    pub fn p_val(&self, index: usize, move_index: usize) -> f32 {
        self.outputs[index].policy[move_index]
    }
}

/// The built-in CPU backend: a shallow material-and-geometry evaluation
/// computed straight from the input planes. It stands where a GPU inference
/// graph would otherwise plug into `Backend`, and it is deterministic,
/// which the reproducibility guarantees lean on.
pub struct CpuBackend {
    weights: Weights
}

impl CpuBackend {
    pub fn new(weights: Weights) -> Self {
        Self { weights }
    }

    fn value_of(&self, input: &InputPlanes) -> f32 {
        // history slot 0 is the position being evaluated; planes 0-5 are
        // the side to move
        let mut material = 0.0f32;
        for role in 0..6 {
            let ours = input.planes[role].mask.count_ones() as f32;
            let theirs = input.planes[role + 6].mask.count_ones() as f32;
            material += self.weights.piece_values[role] * (ours - theirs);
        }

        (material / self.weights.material_scale).tanh()
    }

    fn policy_of(&self, input: &InputPlanes) -> Vec<f32> {
        let ours = (0..6).fold(0u64, |acc, role| acc | input.planes[role].mask);
        let theirs = (0..6).fold(0u64, |acc, role| acc | input.planes[role + 6].mask);

        let mut policy = Vec::with_capacity(POLICY_SIZE);
        for index in 0..POLICY_SIZE {
            let (from, to, promotion) = index_to_squares(index);
            let mut weight = 0.05f32;

            if ours & (1u64 << from) != 0 {
                weight = 1.0;
                if theirs & (1u64 << to) != 0 {
                    weight += self.weights.capture_bonus;
                }
                weight += self.weights.center_bonus * center_proximity(to);
                if promotion.is_some() {
                    weight += self.weights.promotion_bonus;
                }
            }

            policy.push(weight);
        }

        let total = math::sum_finite(&policy);
        math::normalize_finite(&mut policy, total);
        policy
    }
}

/// How close a square sits to the four center squares, in `[0, 1]`.
fn center_proximity(square: u8) -> f32 {
    let file = f32::from(square & 7);
    let rank = f32::from(square >> 3);
    let distance = (file - 3.5).abs().max((rank - 3.5).abs());

    1.0 - (distance - 0.5) / 3.0
}

impl Backend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn forward(&self, inputs: &[InputPlanes]) -> Vec<Output> {
        inputs.iter()
            .map(|input| {
                Output {
                    q: self.value_of(input),
                    policy: self.policy_of(input)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planes::encode;
    use sb_chess::nn_index::move_to_index;
    use sb_chess::{Color, Game};

    fn evaluate_one(game: &Game) -> Output {
        let backend = CpuBackend::new(Weights::default());
        let mut outputs = backend.forward(&[encode(&[game.clone()])]);
        outputs.pop().unwrap()
    }

    #[test]
    fn balanced_position_is_even() {
        let output = evaluate_one(&Game::starting_position());

        assert!(output.q.abs() < 1e-6);
        assert!((output.policy.iter().sum::<f32>() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn material_advantage_raises_q() {
        // white to move, up a queen
        let game = Game::from_fen("8/8/5K2/3P3k/2P5/8/6Q1/8 w - - 12 68", false).unwrap();
        let output = evaluate_one(&game);

        assert!(output.q > 0.3, "q = {}", output.q);
    }

    #[test]
    fn q_is_from_side_to_move() {
        let game = Game::from_fen("8/8/5K2/3P3k/2P5/8/6Q1/8 b - - 12 68", false).unwrap();
        let output = evaluate_one(&game);

        assert!(output.q < -0.3, "q = {}", output.q);
    }

    #[test]
    fn captures_attract_policy() {
        // white queen can take the undefended rook on d5
        let game = Game::from_fen("4k3/8/8/3r4/8/8/3Q4/4K3 w - - 0 1", false).unwrap();
        let moves = game.legal_moves();
        let capture = moves.iter().find(|mv| mv.is_capture()).unwrap();
        let quiet = moves.iter().find(|mv| !mv.is_capture()).unwrap();

        let output = evaluate_one(&game);
        let flip = game.active() == Color::Black;

        assert!(
            output.policy[move_to_index(capture, flip)] > output.policy[move_to_index(quiet, flip)]
        );
    }

    #[test]
    fn mismatched_batch_is_an_error() {
        struct Broken;
        impl Backend for Broken {
            fn name(&self) -> &'static str { "broken" }
            fn forward(&self, _inputs: &[InputPlanes]) -> Vec<Output> { vec! [] }
        }

        let mut computation = Computation::new(Arc::new(Broken));
        computation.add_position(InputPlanes::default());

        assert!(matches!(
            computation.evaluate(),
            Err(NetError::PositionCountMismatch { expected: 1, actual: 0 })
        ));
    }

    #[test]
    fn computation_round_trip() {
        let backend: Arc<dyn Backend> = Arc::new(CpuBackend::new(Weights::default()));
        let mut computation = Computation::new(backend);

        let a = computation.add_position(encode(&[Game::starting_position()]));
        assert_eq!(a, 0);
        assert_eq!(computation.positions(), 1);

        computation.evaluate().unwrap();
        assert!(computation.q_val(0).abs() < 1e-6);
    }
}
