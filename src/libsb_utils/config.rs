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

use std::env;
use std::str::FromStr;

/// Returns the value of the environment variable with the given `name`, or
/// `default` if it is unset or does not parse.
///
/// # Arguments
///
/// * `name` -
/// * `default` -
///
fn env_or_default<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(value) => value.parse::<T>().unwrap_or(default),
        Err(_) => default
    }
}

lazy_static! {
    /// The number of search worker threads the engine may scale up to.
    pub static ref NUM_SEARCH_THREADS: usize = env_or_default("SB_SEARCH_THREADS", 2);

    /// How long a worker sleeps, in milliseconds, when the tree has no work.
    pub static ref WORKER_SLEEP_MS: u64 = env_or_default("SB_WORKER_SLEEP_MS", 10);
}
