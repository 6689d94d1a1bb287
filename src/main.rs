// Copyright 2025 dentsusoken
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

use clap::{Parser, Subcommand};
use keylock::commands::config::ConfigCommand;
use keylock::commands::scenario::ScenarioCommand;
use keylock::commands::stress::{StressCommand, StressOptions};
use keylock::config::{KeylockConfig, LOCK_TIMEOUT_ENV, LockingConfig};
use keylock::error::{KeylockError, Result, format_error_chain, get_exit_code};
use keylock::locking::{
    LockManager, LockTimeoutResolution, LockTimeoutResolver, WaitStrategyKind, signal_token,
};
use keylock::logging;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "keylock")]
#[command(author, version, about = "Keyed mutual-exclusion lock manager", long_about = None)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (defaults to the user config directory)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// How long to wait for a contended key ("30", "5s", "250ms" or "infinite")
    #[arg(long, value_name = "VALUE", global = true)]
    lock_timeout: Option<String>,

    /// Override the configured wait strategy (condvar or entry-unit)
    #[arg(long, value_name = "STRATEGY", global = true)]
    wait_strategy: Option<WaitStrategyKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hammer a set of keys from many threads and verify mutual exclusion
    Stress {
        /// Number of worker threads
        #[arg(short, long, default_value_t = 8)]
        threads: usize,

        /// Number of distinct keys
        #[arg(short, long, default_value_t = 4)]
        keys: usize,

        /// Acquisitions per thread
        #[arg(short, long, default_value_t = 50)]
        iterations: usize,

        /// Lease granted per acquisition in milliseconds
        #[arg(long, value_name = "MS", default_value_t = 5_000)]
        lease_ms: u64,

        /// Longest time a worker holds a key, in microseconds
        #[arg(long, value_name = "US", default_value_t = 2_000)]
        max_hold_us: u64,

        /// Disable progress indicators
        #[arg(long)]
        no_progress: bool,

        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Walk two owners through acquire, contend, release and re-acquire
    Scenario {
        /// Key both owners contend for
        #[arg(default_value = "id1")]
        key: String,

        /// Lease held by the first owner in milliseconds
        #[arg(long, value_name = "MS", default_value_t = 5_000)]
        lease_ms: u64,
    },

    /// Print the effective configuration
    Config {
        /// Output in JSON format instead of TOML
        #[arg(long)]
        json: bool,
    },
}

fn setup_logger(cli: &Cli) {
    logging::setup_logger(cli.verbose);
}

fn load_config(cli: &Cli) -> Result<(KeylockConfig, LockTimeoutResolution)> {
    let mut config = KeylockConfig::load(cli.config.as_deref())?;
    if let Some(strategy) = cli.wait_strategy {
        config.locking.wait_strategy = strategy;
    }

    let env_timeout = env::var(LOCK_TIMEOUT_ENV).ok();
    let resolution = LockTimeoutResolver::new(
        cli.lock_timeout.as_deref(),
        env_timeout.as_deref(),
        config.locking.timeout,
        LockingConfig::default().timeout,
    )
    .resolve()
    .map_err(|e| KeylockError::InvalidConfig(e.to_string()))?;

    log::debug!(
        "Lock timeout {} resolved from {}",
        resolution.value,
        resolution.source
    );
    config.locking.timeout = resolution.value;
    Ok((config, resolution))
}

fn main() {
    let cli = Cli::parse();

    // Initialize logger based on CLI flags and environment
    setup_logger(&cli);

    let (config, timeout) = match load_config(&cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{}", format_error_chain(&e));
            std::process::exit(get_exit_code(&e));
        }
    };

    let manager = LockManager::new(&config.locking);

    let result: Result<()> = (|| match cli.command {
        Commands::Stress {
            threads,
            keys,
            iterations,
            lease_ms,
            max_hold_us,
            no_progress,
            json,
        } => {
            let command = StressCommand::new(&manager, timeout.value, signal_token())?;
            command.execute(&StressOptions {
                threads,
                keys,
                iterations,
                lease: Duration::from_millis(lease_ms),
                max_hold: Duration::from_micros(max_hold_us),
                no_progress,
                json,
            })
        }
        Commands::Scenario { key, lease_ms } => {
            let command = ScenarioCommand::new(&manager)?;
            command.execute(&key, Duration::from_millis(lease_ms))
        }
        Commands::Config { json } => {
            let command = ConfigCommand::new(&config, &timeout)?;
            command.execute(json)
        }
    })();

    if let Err(e) = result {
        eprintln!("{}", format_error_chain(&e));
        std::process::exit(get_exit_code(&e));
    }
}
