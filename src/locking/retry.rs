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

//! Retry helper for callers that treat a timed-out acquisition as transient.

use crate::error::Result;
use crate::locking::acquisition::{LockRequest, PollingBackoff};
use crate::locking::handle::LockHandle;
use crate::locking::manager::LockManager;
use log::debug;
use retry::{OperationResult, retry_with_index};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    fn delays(&self) -> impl Iterator<Item = Duration> {
        PollingBackoff::new(self.initial_delay, 2, self.max_delay).take(self.max_retries)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50), Duration::from_secs(1))
    }
}

/// Runs `request`, retrying with backoff while it times out.
///
/// Interruption and every other error are returned right away.
pub fn acquire_with_retry(
    manager: &LockManager,
    request: &LockRequest,
    policy: &RetryPolicy,
) -> Result<LockHandle> {
    let result = retry_with_index(policy.delays(), |current_try| {
        match manager.acquire_with(request.clone()) {
            Ok(handle) => OperationResult::Ok(handle),
            Err(err) if err.is_timeout() => {
                debug!(
                    "Attempt {current_try} for '{}' timed out; backing off",
                    request.key()
                );
                OperationResult::Retry(err)
            }
            Err(err) => OperationResult::Err(err),
        }
    });

    result.map_err(|e| e.error)
}
