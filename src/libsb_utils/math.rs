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

/// Returns the sum of all finite elements in `xs`.
pub fn sum_finite(xs: &[f32]) -> f32 {
    xs.iter().filter(|x| x.is_finite()).sum()
}

/// Scale all finite elements of `xs` in-place so that they sum to `1.0`,
/// where `total` is their current sum. Does nothing if `total` is too close
/// to zero to divide by.
///
/// # Arguments
///
/// * `xs` - the vector to normalize in-place
/// * `total` -
///
pub fn normalize_finite(xs: &mut [f32], total: f32) {
    if total < 1e-6 {
        return;
    }

    let recip = total.recip();
    for x in xs.iter_mut() {
        if x.is_finite() {
            *x *= recip;
        }
    }
}

/// Softmax over `xs` in-place with the given temperature, where each element
/// is first raised to `1 / temperature`.
///
/// # Arguments
///
/// * `xs` -
/// * `temperature` -
///
pub fn softmax_with_temperature(xs: &mut [f32], temperature: f32) {
    let inv = temperature.max(1e-3).recip();
    for x in xs.iter_mut() {
        if x.is_finite() {
            *x = x.max(0.0).powf(inv);
        }
    }

    let total = sum_finite(xs);
    normalize_finite(xs, total);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_skips_non_finite() {
        let xs = [1.0, f32::NEG_INFINITY, 2.0, f32::NAN];
        assert_eq!(sum_finite(&xs), 3.0);
    }

    #[test]
    fn normalize_sums_to_one() {
        let mut xs = [1.0, 3.0, f32::NEG_INFINITY];
        let total = sum_finite(&xs);
        normalize_finite(&mut xs, total);

        assert!((sum_finite(&xs) - 1.0).abs() < 1e-6);
        assert!((xs[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn normalize_ignores_zero_total() {
        let mut xs = [0.0, 0.0];
        normalize_finite(&mut xs, 0.0);
        assert_eq!(xs, [0.0, 0.0]);
    }

    #[test]
    fn softmax_keeps_ordering() {
        let mut xs = [0.1, 0.6, 0.3];
        softmax_with_temperature(&mut xs, 1.607);

        assert!(xs[1] > xs[2] && xs[2] > xs[0]);
        assert!((sum_finite(&xs) - 1.0).abs() < 1e-6);
    }
}
