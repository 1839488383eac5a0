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

use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("could not read weights file `{0}`")]
    WeightsNotFound(String),

    #[error("malformed weights file: {0}")]
    WeightsFormat(String),

    #[error("network returned {actual} positions, expected {expected}")]
    PositionCountMismatch { expected: usize, actual: usize }
}

/// The tunable parameters of the evaluation backend. The weights file is a
/// plain `key value` text format; anything not mentioned keeps its built-in
/// default, which is also what `WeightsFile=auto` resolves to.
#[derive(Clone, Debug, PartialEq)]
pub struct Weights {
    /// Pawn, knight, bishop, rook, queen, king.
    pub piece_values: [f32; 6],
    pub capture_bonus: f32,
    pub center_bonus: f32,
    pub promotion_bonus: f32,
    /// Material difference, in pawns, that saturates the value head.
    pub material_scale: f32
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            piece_values: [1.0, 3.0, 3.0, 5.0, 9.0, 0.0],
            capture_bonus: 2.0,
            center_bonus: 0.25,
            promotion_bonus: 1.0,
            material_scale: 15.0
        }
    }
}

impl Weights {
    /// Load weights from a file.
    ///
    /// # Arguments
    ///
    /// * `path` -
    ///
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, NetError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|_| NetError::WeightsNotFound(path.display().to_string()))?;

        let mut weights = Weights::default();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let key = parts.next().unwrap_or_default();
            let value = parts.next()
                .and_then(|v| v.parse::<f32>().ok())
                .ok_or_else(|| NetError::WeightsFormat(format!("line {}: `{}`", number + 1, line)))?;

            match key {
                "pawn" => weights.piece_values[0] = value,
                "knight" => weights.piece_values[1] = value,
                "bishop" => weights.piece_values[2] = value,
                "rook" => weights.piece_values[3] = value,
                "queen" => weights.piece_values[4] = value,
                "king" => weights.piece_values[5] = value,
                "capture_bonus" => weights.capture_bonus = value,
                "center_bonus" => weights.center_bonus = value,
                "promotion_bonus" => weights.promotion_bonus = value,
                "material_scale" => weights.material_scale = value,
                other => {
                    return Err(NetError::WeightsFormat(format!("unknown key `{}`", other)));
                }
            }
        }

        info!(path = %path.display(), "loaded weights");
        Ok(weights)
    }

    /// Resolve the `WeightsFile` option value: `auto` means the built-in
    /// parameters, anything else must name a readable file.
    pub fn resolve(option_value: &str) -> Result<Self, NetError> {
        if option_value.is_empty() || option_value == "auto" {
            Ok(Weights::default())
        } else {
            Weights::load(option_value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn auto_resolves_to_defaults() {
        assert_eq!(Weights::resolve("auto").unwrap(), Weights::default());
        assert_eq!(Weights::resolve("").unwrap(), Weights::default());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            Weights::resolve("/no/such/weights"),
            Err(NetError::WeightsNotFound(_))
        ));
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# test weights").unwrap();
        writeln!(file, "queen 8.5").unwrap();
        writeln!(file, "capture_bonus 3").unwrap();
        file.flush().unwrap();

        let weights = Weights::load(file.path()).unwrap();
        assert_eq!(weights.piece_values[4], 8.5);
        assert_eq!(weights.capture_bonus, 3.0);
        assert_eq!(weights.material_scale, Weights::default().material_scale);
    }

    #[test]
    fn unknown_key_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "flux_capacitor 1.21").unwrap();
        file.flush().unwrap();

        assert!(matches!(
            Weights::load(file.path()),
            Err(NetError::WeightsFormat(_))
        ));
    }
}
