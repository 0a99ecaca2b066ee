// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use clap::Parser;
use iprof::config::{RankSelection, TraceMode};
use iprof::env_probe::ProcessEnv;
use iprof::workload::ProcessLauncher;
use iprof::{command::SystemRunner, logger, Config, RankContext, Registry, SessionOrchestrator};

use log::error;

/// Trace a command with LTTng on every rank of a parallel job.
///
/// Settings not given on the command line are read from `IPROF_*`
/// variables.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Backends to trace, comma separated
    #[arg(short, long, value_delimiter = ',')]
    backends: Option<Vec<String>>,

    /// minimal, default or full
    #[arg(short = 'm', long)]
    trace_mode: Option<TraceMode>,

    /// Global ranks to trace, -1 for all
    #[arg(short = 'r', long, value_delimiter = ',', allow_negative_numbers = true)]
    traced_ranks: Option<Vec<i64>>,

    /// Do not collect device profiling events
    #[arg(long)]
    no_profile: bool,

    /// Write the trace here instead of the per-job directory
    #[arg(short = 'o', long)]
    trace_output: Option<String>,

    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

fn config_from(args: &Args, env: &ProcessEnv) -> Result<Config, String> {
    let mut config = Config::from_env(env);
    if let Some(backends) = &args.backends {
        config.backends = backends.clone();
    }
    if let Some(mode) = args.trace_mode {
        config.trace_mode = mode;
    }
    if let Some(ranks) = &args.traced_ranks {
        config.traced_ranks = RankSelection::from_values(ranks.iter().copied())?;
    }
    if args.no_profile {
        config.profile = false;
    }
    if let Some(dir) = &args.trace_output {
        config.trace_output = Some(dir.clone());
    }
    Ok(config)
}

fn main() {
    let args = Args::parse();
    let env = ProcessEnv;
    let config = match config_from(&args, &env) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("iprof: {}", e);
            std::process::exit(2);
        }
    };
    let ctx = RankContext::from_env(&env);
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    logger::init(&config.log, &hostname, &ctx);

    let registry = Registry::builtin();
    let runner = SystemRunner;
    let launcher = ProcessLauncher;
    let mut orchestrator =
        SessionOrchestrator::new(&config, &ctx, &env, &runner, &launcher, &registry, &hostname);
    match orchestrator.run(&args.command) {
        Ok(outcome) => {
            if let Some(dir) = outcome.trace_dir {
                eprintln!("iprof: trace written to {}", dir.display());
            }
            std::process::exit(outcome.exit_code);
        }
        Err(e) => {
            error!("{} (in phase {:?})", e, orchestrator.phase());
            std::process::exit(1);
        }
    }
}
