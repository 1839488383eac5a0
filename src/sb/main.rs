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

mod uci;

use std::io::{self, BufRead};
use std::thread;

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::unbounded;
use sb_utils::options::Options;
use tracing_subscriber::EnvFilter;

use crate::uci::UciEngine;

/// A neural-network-guided UCI chess engine.
#[derive(Parser, Debug)]
#[command(name = "sable", version, about, long_about = None)]
struct Args {
    /// Path to a weights file (overrides the WeightsFile option)
    #[arg(long)]
    weights: Option<String>,

    /// Path to the syzygy tablebases (overrides the SyzygyPath option)
    #[arg(long)]
    syzygy: Option<String>
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    if let Some(weights) = args.weights {
        Options::global().set("WeightsFile", &weights);
    }
    if let Some(syzygy) = args.syzygy {
        Options::global().set("SyzygyPath", &syzygy);
    }

    // stdin is read on its own thread so the main loop can also watch the
    // clock and the search
    let (line_tx, line_rx) = unbounded();
    thread::Builder::new()
        .name("io".into())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(_) => break
                };
                let quit = line.trim() == "quit";
                if line_tx.send(line).is_err() || quit {
                    break;
                }
            }
        })?;

    let code = UciEngine::new(line_rx).run();
    std::process::exit(code);
}
