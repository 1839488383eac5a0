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

#[macro_use]
extern crate lazy_static;

pub mod arena;
pub mod cache;
pub mod clock;
pub mod engine;
pub mod hash;
pub mod history;
pub mod node;
pub mod search;
pub mod tree;
pub mod worker;

pub use self::engine::{EngineEvent, SearchEngine};
pub use self::search::{Search, SearchInfo, SearchSettings, WorkerInfo};
