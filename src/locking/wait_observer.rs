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

//! Observer interfaces for lock wait instrumentation.
//!
//! Observers let callers surface contention (progress lines, metrics, audit
//! trails) without touching the acquisition loop.

use crate::locking::timeout::LockTimeoutValue;
use log::{info, warn};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Observer hooks for lock wait events.
pub trait LockWaitObserver: Send + Sync {
    fn on_wait_start(&self, _key: &str, _timeout: LockTimeoutValue) {}

    fn on_retry(
        &self,
        _key: &str,
        _attempt: usize,
        _elapsed: Duration,
        _remaining: Option<Duration>,
    ) {
    }

    fn on_acquired(&self, _key: &str, _waited: Duration) {}

    fn on_timeout(&self, _key: &str, _waited: Duration) {}

    fn on_cancelled(&self, _key: &str, _waited: Duration) {}
}

#[derive(Debug, Default)]
pub struct NoopLockWaitObserver;

impl LockWaitObserver for NoopLockWaitObserver {}

/// Reports waits through `log`, at most one progress line per interval.
#[derive(Debug)]
pub struct LoggingWaitObserver {
    interval: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl LoggingWaitObserver {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: Mutex::new(None),
        }
    }

    fn should_emit(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_emit.lock().unwrap_or_else(PoisonError::into_inner);
        let due = last
            .map(|previous| now.duration_since(previous) >= self.interval)
            .unwrap_or(true);
        if due {
            *last = Some(now);
        }
        due
    }
}

impl Default for LoggingWaitObserver {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl LockWaitObserver for LoggingWaitObserver {
    fn on_wait_start(&self, key: &str, timeout: LockTimeoutValue) {
        *self.last_emit.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        info!("Waiting for lock on '{key}' (timeout: {timeout})");
    }

    fn on_retry(&self, key: &str, attempt: usize, elapsed: Duration, remaining: Option<Duration>) {
        if !self.should_emit() {
            return;
        }
        let remaining_text = remaining
            .map(|value| format!(", ~{:.1}s remaining", value.as_secs_f64()))
            .unwrap_or_default();
        info!(
            "Still waiting for '{key}' after {:.1}s (attempt {attempt}{remaining_text})",
            elapsed.as_secs_f64()
        );
    }

    fn on_acquired(&self, key: &str, waited: Duration) {
        info!(
            "Lock on '{key}' acquired after {:.3}s",
            waited.as_secs_f64()
        );
    }

    fn on_timeout(&self, key: &str, waited: Duration) {
        warn!(
            "Gave up on '{key}' after {:.3}s",
            waited.as_secs_f64()
        );
    }

    fn on_cancelled(&self, key: &str, waited: Duration) {
        warn!(
            "Cancelled wait for '{key}' after {:.3}s",
            waited.as_secs_f64()
        );
    }
}
