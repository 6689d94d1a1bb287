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

use crate::error::{KeylockError, Result};
use crate::locking::{
    CancellationToken, LockManager, LockRequest, LockTimeoutValue, LockWaitObserver,
    LoggingWaitObserver, OwnerId, RetryPolicy, acquire_with_retry,
};
use colored::*;
use comfy_table::{Cell, Table};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Parameters of one contention run.
#[derive(Debug, Clone)]
pub struct StressOptions {
    pub threads: usize,
    pub keys: usize,
    pub iterations: usize,
    pub lease: Duration,
    pub max_hold: Duration,
    pub no_progress: bool,
    pub json: bool,
}

impl Default for StressOptions {
    fn default() -> Self {
        Self {
            threads: 8,
            keys: 4,
            iterations: 50,
            lease: Duration::from_secs(5),
            max_hold: Duration::from_millis(2),
            no_progress: false,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Acquired(usize),
    Released(usize),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct KeyStats {
    pub acquisitions: usize,
    pub contended: usize,
    pub max_wait_ms: u128,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct StressReport {
    pub keys: BTreeMap<String, KeyStats>,
    pub timeouts: usize,
    pub interrupted: bool,
    pub elapsed_ms: u128,
}

impl StressReport {
    pub fn total_acquisitions(&self) -> usize {
        self.keys.values().map(|stats| stats.acquisitions).sum()
    }
}

#[derive(Default)]
struct RunState {
    events: BTreeMap<String, Vec<Event>>,
    report: StressReport,
}

pub struct StressCommand<'a> {
    manager: &'a LockManager,
    timeout: LockTimeoutValue,
    cancellation: CancellationToken,
    observer: Arc<dyn LockWaitObserver>,
}

impl<'a> StressCommand<'a> {
    pub fn new(
        manager: &'a LockManager,
        timeout: LockTimeoutValue,
        cancellation: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            manager,
            timeout,
            cancellation,
            observer: Arc::new(LoggingWaitObserver::default()),
        })
    }

    pub fn execute(&self, options: &StressOptions) -> Result<()> {
        let report = self.run(options)?;

        if options.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_summary(&report);
        }
        Ok(())
    }

    /// Runs the workload and checks every key's event log for overlapping owners.
    pub fn run(&self, options: &StressOptions) -> Result<StressReport> {
        if options.threads == 0 || options.keys == 0 {
            return Err(KeylockError::InvalidConfig(
                "stress needs at least one thread and one key".to_string(),
            ));
        }
        if options.lease <= options.max_hold {
            return Err(KeylockError::InvalidConfig(format!(
                "lease ({}ms) must be longer than the maximum hold ({}us)",
                options.lease.as_millis(),
                options.max_hold.as_micros()
            )));
        }

        let progress = if options.no_progress || options.json {
            ProgressBar::hidden()
        } else {
            create_progress_bar(total_steps(options))
        };

        let state = Mutex::new(RunState::default());
        let keys: Vec<String> = (0..options.keys).map(|index| format!("key-{index}")).collect();
        let start = Instant::now();

        let spawned = thread::scope(|scope| {
            (0..options.threads).try_for_each(|worker| {
                let state = &state;
                let keys = &keys;
                let progress = &progress;
                thread::Builder::new()
                    .name(format!("stress-{worker}"))
                    .spawn_scoped(scope, move || {
                        self.worker(worker, keys, options, state, progress);
                    })
                    .map(|_| ())
                    .map_err(|err| spawn_failure(worker, err))
            })
        });
        if let Err(err) = spawned {
            progress.abandon();
            return Err(err);
        }

        let mut state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        state.report.elapsed_ms = start.elapsed().as_millis();
        state.report.interrupted = self.cancellation.is_cancelled();
        progress.finish_with_message("done");

        for (key, events) in &state.events {
            verify_exclusion(key, events)?;
        }

        let leftover = self.manager.active_lock_count();
        if leftover != 0 {
            return Err(KeylockError::InternalInconsistency {
                key: "*".to_string(),
                details: format!("{leftover} entries remain after every handle was released"),
            });
        }

        Ok(state.report)
    }

    fn worker(
        &self,
        worker: usize,
        keys: &[String],
        options: &StressOptions,
        state: &Mutex<RunState>,
        progress: &ProgressBar,
    ) {
        let mut rng = rand::thread_rng();
        let owner = OwnerId::token(format!("worker-{worker}"));
        let policy = RetryPolicy::default();

        for _ in 0..options.iterations {
            if self.cancellation.is_cancelled() {
                return;
            }

            let key = &keys[rng.gen_range(0..keys.len())];
            let request = LockRequest::new(key.clone())
                .lease(options.lease)
                .timeout(self.timeout)
                .owner(owner.clone())
                .cancellation(self.cancellation.clone())
                .observer(Arc::clone(&self.observer));

            let handle = match acquire_with_retry(self.manager, &request, &policy) {
                Ok(handle) => handle,
                Err(err) => {
                    debug!("{owner} gave up on '{key}': {err}");
                    if err.is_timeout() {
                        lock_state(state).report.timeouts += 1;
                    }
                    progress.inc(1);
                    continue;
                }
            };

            {
                let mut state = lock_state(state);
                state
                    .events
                    .entry(key.clone())
                    .or_default()
                    .push(Event::Acquired(worker));
                let stats = state.report.keys.entry(key.clone()).or_default();
                stats.acquisitions += 1;
                if !handle.waited().is_zero() {
                    stats.contended += 1;
                }
                stats.max_wait_ms = stats.max_wait_ms.max(handle.waited().as_millis());
            }

            if !options.max_hold.is_zero() {
                let hold_us = rng.gen_range(0..=micros(options.max_hold));
                thread::sleep(Duration::from_micros(hold_us));
            }

            lock_state(state)
                .events
                .entry(key.clone())
                .or_default()
                .push(Event::Released(worker));
            handle.release();
            progress.inc(1);
        }
    }
}

fn total_steps(options: &StressOptions) -> u64 {
    u64::try_from(options.threads.saturating_mul(options.iterations)).unwrap_or(u64::MAX)
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

fn spawn_failure(worker: usize, err: io::Error) -> KeylockError {
    warn!("Failed to spawn stress worker {worker}: {err}");
    KeylockError::Io(io::Error::new(
        err.kind(),
        format!("failed to spawn stress worker {worker}: {err}"),
    ))
}

fn lock_state(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}

/// Each acquisition must be followed by the same worker's release before
/// anyone else acquires the key.
fn verify_exclusion(key: &str, events: &[Event]) -> Result<()> {
    let mut holder: Option<usize> = None;
    for (position, event) in events.iter().enumerate() {
        match (*event, holder) {
            (Event::Acquired(worker), None) => holder = Some(worker),
            (Event::Released(worker), Some(current)) if worker == current => holder = None,
            (event, current) => {
                return Err(KeylockError::ExclusionViolated(format!(
                    "'{key}' event #{position} {event:?} while held by {current:?}"
                )));
            }
        }
    }
    Ok(())
}

fn print_summary(report: &StressReport) {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_BORDERS_ONLY);
    table.set_header(vec![
        Cell::new("Key"),
        Cell::new("Acquisitions"),
        Cell::new("Contended"),
        Cell::new("Max wait (ms)"),
    ]);

    for (key, stats) in &report.keys {
        table.add_row(vec![
            Cell::new(key),
            Cell::new(stats.acquisitions),
            Cell::new(stats.contended),
            Cell::new(stats.max_wait_ms),
        ]);
    }

    println!("{table}");
    println!(
        "{} {} acquisitions in {}ms, {} timeouts, no overlapping owners",
        "✓".green().bold(),
        report.total_acquisitions(),
        report.elapsed_ms,
        report.timeouts
    );
    if report.interrupted {
        println!("{}", "Run was interrupted before completing".yellow());
    }
}
