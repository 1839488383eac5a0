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

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use crate::backend::{Backend, CpuBackend};
use crate::loader::{NetError, Weights};

struct PoolState {
    available: VecDeque<Arc<dyn Backend>>,
    weights: Option<Weights>,
    configured_cores: usize
}

/// The process-wide pool of network handles. Search workers `acquire` a
/// handle (blocking, FIFO fair) for the duration of one batched forward
/// pass and `release` it afterwards.
pub struct NeuralNet {
    state: Mutex<PoolState>,
    condition: Condvar
}

lazy_static! {
    static ref NEURAL_NET: NeuralNet = NeuralNet {
        state: Mutex::new(PoolState {
            available: VecDeque::new(),
            weights: None,
            configured_cores: 0
        }),
        condition: Condvar::new()
    };
}

impl NeuralNet {
    pub fn global() -> &'static NeuralNet {
        &NEURAL_NET
    }

    /// Load (or re-load) the weights named by the `WeightsFile` option
    /// value. Must succeed before `reset` builds any handles.
    pub fn set_weights(&self, option_value: &str) -> Result<(), NetError> {
        let weights = Weights::resolve(option_value)?;
        let mut state = self.state.lock().unwrap();

        state.weights = Some(weights);
        state.configured_cores = 0; // force a rebuild on the next reset
        Ok(())
    }

    /// (Re)build the pool to hold one handle per configured core. A no-op
    /// when already configured to the requested size.
    pub fn reset(&self, cores: usize) -> Result<(), NetError> {
        let cores = cores.max(1);
        let mut state = self.state.lock().unwrap();

        if state.configured_cores == cores {
            return Ok(());
        }

        let weights = state.weights.clone()
            .ok_or_else(|| NetError::WeightsNotFound("<unset>".into()))?;

        state.available.clear();
        for _ in 0..cores {
            state.available.push_back(Arc::new(CpuBackend::new(weights.clone())));
        }
        state.configured_cores = cores;
        debug!(cores, "network pool rebuilt");

        self.condition.notify_all();
        Ok(())
    }

    /// Take a handle out of the pool, blocking until one is available.
    pub fn acquire_network(&self) -> Arc<dyn Backend> {
        let mut state = self.state.lock().unwrap();

        loop {
            if let Some(backend) = state.available.pop_front() {
                return backend;
            }
            state = self.condition.wait(state).unwrap();
        }
    }

    /// Return a handle to the pool and wake one waiter.
    pub fn release_network(&self, backend: Arc<dyn Backend>) {
        let mut state = self.state.lock().unwrap();
        state.available.push_back(backend);
        self.condition.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn fresh_pool() -> NeuralNet {
        NeuralNet {
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                weights: None,
                configured_cores: 0
            }),
            condition: Condvar::new()
        }
    }

    #[test]
    fn reset_requires_weights() {
        let pool = fresh_pool();

        assert!(pool.reset(1).is_err());
        pool.set_weights("auto").unwrap();
        assert!(pool.reset(1).is_ok());
    }

    #[test]
    fn acquire_release_round_trip() {
        let pool = fresh_pool();
        pool.set_weights("auto").unwrap();
        pool.reset(2).unwrap();

        let a = pool.acquire_network();
        let _b = pool.acquire_network();
        assert_eq!(pool.state.lock().unwrap().available.len(), 0);

        pool.release_network(a);
        assert_eq!(pool.state.lock().unwrap().available.len(), 1);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = Arc::new(fresh_pool());
        pool.set_weights("auto").unwrap();
        pool.reset(1).unwrap();

        let held = pool.acquire_network();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let backend = pool.acquire_network();
                pool.release_network(backend);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        pool.release_network(held);
        waiter.join().unwrap();
    }

    #[test]
    fn reset_is_idempotent() {
        let pool = fresh_pool();
        pool.set_weights("auto").unwrap();
        pool.reset(2).unwrap();
        let _held = pool.acquire_network();

        // same size: pool untouched, handle still out
        pool.reset(2).unwrap();
        assert_eq!(pool.state.lock().unwrap().available.len(), 1);
    }
}
