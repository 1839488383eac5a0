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

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Mutex;

use tracing::warn;

/// The UCI type of a tunable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionType {
    Check,
    Spin,
    Combo,
    Button,
    Text
}

/// A single engine tunable as exposed over the `setoption` / `uci`
/// commands. The registry is written by the protocol front-end and read by
/// everyone else; it is never written while a search is running.
#[derive(Clone, Debug)]
pub struct UciOption {
    pub name: &'static str,
    pub option_type: OptionType,
    pub default: String,
    pub min: String,
    pub max: String,
    pub var: Vec<String>,
    pub value: String,
    pub description: &'static str
}

impl UciOption {
    fn spin(name: &'static str, default: &str, min: &str, max: &str, description: &'static str) -> Self {
        Self {
            name,
            option_type: OptionType::Spin,
            default: default.into(),
            min: min.into(),
            max: max.into(),
            var: vec! [],
            value: default.into(),
            description
        }
    }

    fn check(name: &'static str, default: bool, description: &'static str) -> Self {
        let default = if default { "true" } else { "false" };

        Self {
            name,
            option_type: OptionType::Check,
            default: default.into(),
            min: String::new(),
            max: String::new(),
            var: vec! [],
            value: default.into(),
            description
        }
    }

    fn text(name: &'static str, default: &str, description: &'static str) -> Self {
        Self {
            name,
            option_type: OptionType::Text,
            default: default.into(),
            min: String::new(),
            max: String::new(),
            var: vec! [],
            value: default.into(),
            description
        }
    }

    /// Returns this option formatted as one `option name ...` line of the
    /// `uci` handshake.
    pub fn to_uci(&self) -> String {
        let mut out = String::new();

        write!(out, "option name {} type ", self.name).unwrap();
        match self.option_type {
            OptionType::Check => write!(out, "check default {}", self.default).unwrap(),
            OptionType::Spin => write!(out, "spin default {} min {} max {}", self.default, self.min, self.max).unwrap(),
            OptionType::Combo => {
                write!(out, "combo default {}", self.default).unwrap();
                for v in &self.var {
                    write!(out, " var {}", v).unwrap();
                }
            },
            OptionType::Button => write!(out, "button").unwrap(),
            OptionType::Text => write!(out, "string default {}", self.default).unwrap()
        }

        out
    }
}

/// The process-wide registry of tunables. There is exactly one, obtained
/// with `Options::global()`.
pub struct Options {
    entries: Mutex<BTreeMap<&'static str, UciOption>>
}

lazy_static! {
    static ref OPTIONS: Options = Options::new();
}

impl Options {
    fn new() -> Self {
        let mut entries = BTreeMap::new();
        let all = vec! [
            UciOption::spin("Hash", "256", "1", "65536", "Size of the NN transposition table in MiB"),
            UciOption::spin("Cache", "20000000", "100000", "999999999", "Maximum number of chess positions stored in memory"),
            UciOption::spin("GPUCores", "1", "0", "256", "Number of NN worker objects"),
            UciOption::spin("MaxBatchSize", "256", "1", "65536", "Largest batch to send to the network"),
            UciOption::spin("MoveOverhead", "300", "0", "5000", "Overhead to avoid timing out"),
            UciOption::text("OpeningTimeFactor", "2.15", "Time factor for extra time in the opening"),
            UciOption::text("CpuctInit", "2.1", "Cpuct initial value"),
            UciOption::text("CpuctBase", "15000", "Cpuct base"),
            UciOption::text("CpuctF", "2.817", "Cpuct growth factor"),
            UciOption::text("WeightsFile", "auto", "Provides a weights file to use"),
            UciOption::text("SyzygyPath", "", "Path to the syzygy tablebases"),
            UciOption::check("UCI_Chess960", false, "Play Chess960"),
            UciOption::check("Ponder", false, "Whether to ponder")
        ];

        for option in all {
            entries.insert(option.name, option);
        }

        Self { entries: Mutex::new(entries) }
    }

    pub fn global() -> &'static Options {
        &OPTIONS
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().unwrap().contains_key(name)
    }

    /// Set the value of the named option. Unknown names and values that do
    /// not fit the option type are logged and ignored.
    pub fn set(&self, name: &str, value: &str) {
        let mut entries = self.entries.lock().unwrap();

        match entries.get_mut(name) {
            Some(option) => {
                let acceptable = match option.option_type {
                    OptionType::Check => value == "true" || value == "false",
                    OptionType::Spin => value.parse::<i64>().is_ok(),
                    _ => true
                };

                if acceptable {
                    option.value = value.into();
                } else {
                    warn!(name, value, "rejected option value");
                }
            },
            None => {
                warn!(name, "unrecognized option");
            }
        }
    }

    pub fn value(&self, name: &str) -> String {
        self.entries.lock().unwrap()
            .get(name)
            .map(|option| option.value.clone())
            .unwrap_or_default()
    }

    pub fn value_i64(&self, name: &str) -> i64 {
        self.value(name).parse::<i64>().unwrap_or(0)
    }

    pub fn value_f32(&self, name: &str) -> f32 {
        self.value(name).parse::<f32>().unwrap_or(0.0)
    }

    pub fn value_bool(&self, name: &str) -> bool {
        self.value(name) == "true"
    }

    /// Returns every registered option, for the `uci` handshake.
    pub fn all(&self) -> Vec<UciOption> {
        self.entries.lock().unwrap().values().cloned().collect()
    }

    /// Restore every option to its default. Used by tests; a running engine
    /// keeps `setoption` values across games.
    pub fn reset(&self) {
        for option in self.entries.lock().unwrap().values_mut() {
            option.value = option.default.clone();
        }
    }
}
