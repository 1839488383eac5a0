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

//! End-to-end scenarios that cross the crate boundaries: whole searches
//! through the engine, tree reuse across moves, and the transposition
//! round trip. Everything here shares the process-wide singletons, so the
//! tests serialize on one lock.

#[cfg(test)]
#[macro_use]
extern crate lazy_static;
