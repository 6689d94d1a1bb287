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

use crate::error::{KeylockError, UnavailableReason};
use crate::locking::cancellation::CancellationToken;
use crate::locking::owner::OwnerId;
use crate::locking::timeout::LockTimeoutValue;
use crate::locking::wait_observer::LockWaitObserver;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Smallest sleep handed to a wait strategy.
pub const MIN_WAIT_QUANTUM: Duration = Duration::from_millis(1);

/// Whether a request may park on a contended key or must fail straight away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    Blocking,
    NonBlocking,
}

impl AcquireMode {
    pub fn may_wait(self) -> bool {
        self == AcquireMode::Blocking
    }
}

/// Delay schedule between re-checks of a contended key.
///
/// The n-th delay is `first * factor^n`, clamped to `ceiling`. Iterating
/// yields the schedule from the current step onwards without end.
#[derive(Debug, Clone)]
pub struct PollingBackoff {
    first: Duration,
    factor: u32,
    ceiling: Duration,
    step: u32,
}

impl PollingBackoff {
    pub fn new(first: Duration, factor: u32, ceiling: Duration) -> Self {
        Self {
            first: first.min(ceiling),
            factor: factor.max(1),
            ceiling,
            step: 0,
        }
    }

    fn delay_at(&self, step: u32) -> Duration {
        self.factor
            .checked_pow(step)
            .and_then(|scale| self.first.checked_mul(scale))
            .map_or(self.ceiling, |delay| delay.min(self.ceiling))
    }

    pub fn peek(&self) -> Duration {
        self.delay_at(self.step)
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.peek();
        if delay < self.ceiling {
            self.step += 1;
        }
        delay
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

impl Default for PollingBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), 2, Duration::from_millis(100))
    }
}

impl Iterator for PollingBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// A wait budget pinned to the instant the acquisition began.
#[derive(Debug, Clone)]
pub struct LockTimeoutBudget {
    value: LockTimeoutValue,
    started_at: Instant,
    deadline: Option<Instant>,
}

impl LockTimeoutBudget {
    pub fn new(value: LockTimeoutValue) -> Self {
        Self::with_start(value, Instant::now())
    }

    /// An infinite budget, or one too large to represent as an instant, has
    /// no deadline.
    pub fn with_start(value: LockTimeoutValue, started_at: Instant) -> Self {
        let deadline = match value {
            LockTimeoutValue::Finite(limit) => started_at.checked_add(limit),
            LockTimeoutValue::Infinite => None,
        };
        Self {
            value,
            started_at,
            deadline,
        }
    }

    pub fn value(&self) -> LockTimeoutValue {
        self.value
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }
}

/// Everything a caller can say about one acquisition.
///
/// Unset fields fall back to the manager's configuration: lease and timeout
/// come from [`crate::config::LockingConfig`], the owner from the manager's
/// owner resolver.
#[derive(Clone)]
pub struct LockRequest {
    key: String,
    lease: Option<Duration>,
    timeout: Option<LockTimeoutValue>,
    permits: u32,
    owner: Option<OwnerId>,
    cancellation: Option<CancellationToken>,
    observer: Option<Arc<dyn LockWaitObserver>>,
    mode: AcquireMode,
}

impl LockRequest {
    pub fn new<K: Into<String>>(key: K) -> Self {
        Self {
            key: key.into(),
            lease: None,
            timeout: None,
            permits: 1,
            owner: None,
            cancellation: None,
            observer: None,
            mode: AcquireMode::Blocking,
        }
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn timeout<T: Into<LockTimeoutValue>>(mut self, timeout: T) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    /// Number of releases needed before the key is free again. Zero counts as one.
    pub fn permits(mut self, permits: u32) -> Self {
        self.permits = permits.max(1);
        self
    }

    pub fn owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn LockWaitObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn mode(mut self, mode: AcquireMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lease_value(&self) -> Option<Duration> {
        self.lease
    }

    pub fn timeout_value(&self) -> Option<LockTimeoutValue> {
        self.timeout
    }

    pub fn permit_count(&self) -> u32 {
        self.permits
    }

    pub fn owner_id(&self) -> Option<&OwnerId> {
        self.owner.as_ref()
    }

    pub fn acquire_mode(&self) -> AcquireMode {
        self.mode
    }

    pub(crate) fn into_parts(self) -> RequestParts {
        RequestParts {
            key: self.key,
            lease: self.lease,
            timeout: self.timeout,
            permits: self.permits,
            owner: self.owner,
            cancellation: self.cancellation.unwrap_or_default(),
            observer: self.observer,
            mode: self.mode,
        }
    }
}

impl fmt::Debug for LockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRequest")
            .field("key", &self.key)
            .field("lease", &self.lease)
            .field("timeout", &self.timeout)
            .field("permits", &self.permits)
            .field("owner", &self.owner)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

pub(crate) struct RequestParts {
    pub key: String,
    pub lease: Option<Duration>,
    pub timeout: Option<LockTimeoutValue>,
    pub permits: u32,
    pub owner: Option<OwnerId>,
    pub cancellation: CancellationToken,
    pub observer: Option<Arc<dyn LockWaitObserver>>,
    pub mode: AcquireMode,
}

/// Bookkeeping for one acquisition while it is in flight.
pub(crate) struct AcquisitionProgress<'a> {
    key: &'a str,
    budget: LockTimeoutBudget,
    backoff: PollingBackoff,
    observer: Option<&'a dyn LockWaitObserver>,
    retries: usize,
    wait_started: bool,
}

impl<'a> AcquisitionProgress<'a> {
    pub fn new(
        key: &'a str,
        timeout: LockTimeoutValue,
        backoff: PollingBackoff,
        observer: Option<&'a dyn LockWaitObserver>,
    ) -> Self {
        Self {
            key,
            budget: LockTimeoutBudget::new(timeout),
            backoff,
            observer,
            retries: 0,
            wait_started: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.budget.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.budget.is_expired()
    }

    /// Zero when the key was granted without waiting.
    pub fn waited(&self) -> Duration {
        if self.wait_started {
            self.elapsed()
        } else {
            Duration::ZERO
        }
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Next sleep, bounded by the budget and by the contended lease.
    ///
    /// Returns `None` once the budget is exhausted.
    pub fn next_quantum(&mut self, until_expiry: Duration) -> Option<Duration> {
        let mut delay = self
            .backoff
            .next_delay()
            .min(until_expiry)
            .max(MIN_WAIT_QUANTUM);
        if let Some(remaining) = self.budget.remaining() {
            if remaining.is_zero() {
                return None;
            }
            delay = delay.min(remaining);
        }
        Some(delay)
    }

    pub fn record_wait_start(&mut self) {
        if !self.wait_started {
            if let Some(observer) = self.observer {
                observer.on_wait_start(self.key, self.budget.value());
            }
            self.wait_started = true;
        }
    }

    pub fn record_retry(&mut self) {
        self.retries = self.retries.saturating_add(1);
        if let Some(observer) = self.observer {
            observer.on_retry(
                self.key,
                self.retries,
                self.elapsed(),
                self.budget.remaining(),
            );
        }
    }

    pub fn notify_acquired(&self) {
        if self.wait_started
            && let Some(observer) = self.observer
        {
            observer.on_acquired(self.key, self.elapsed());
        }
    }

    pub fn timed_out(&self) -> KeylockError {
        if let Some(observer) = self.observer {
            observer.on_timeout(self.key, self.elapsed());
        }
        self.unavailable(UnavailableReason::Timeout)
    }

    pub fn cancelled(&self) -> KeylockError {
        if let Some(observer) = self.observer {
            observer.on_cancelled(self.key, self.elapsed());
        }
        self.unavailable(UnavailableReason::Interrupted)
    }

    fn unavailable(&self, reason: UnavailableReason) -> KeylockError {
        KeylockError::LockUnavailable {
            key: self.key.to_string(),
            reason,
            waited_secs: self.elapsed().as_secs_f64(),
        }
    }
}
