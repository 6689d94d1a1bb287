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

//! Keyed mutual exclusion.
//!
//! A [`LockManager`] grants at most one owner per key. Owners hold a lease
//! that lapses on its own, may re-enter a key they already hold, and release
//! through the [`LockHandle`] they were given.

pub mod acquisition;
pub mod cancellation;
pub mod clock;
pub mod entry;
pub mod handle;
pub mod hygiene;
pub mod key_lock;
pub mod manager;
pub mod owner;
pub mod retry;
pub mod table;
pub mod timeout;
pub mod wait_observer;
pub mod wait_strategy;

pub use acquisition::{AcquireMode, LockRequest, LockTimeoutBudget, PollingBackoff};
pub use cancellation::{CancellationToken, signal_token};
pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::LockEntry;
pub use handle::LockHandle;
pub use hygiene::{LockHygieneReport, LockHygieneRunner};
pub use key_lock::KeyLock;
pub use manager::LockManager;
pub use owner::{OwnerId, OwnerResolver, thread_owner_resolver};
pub use retry::{RetryPolicy, acquire_with_retry};
pub use timeout::{
    LockTimeoutResolution, LockTimeoutResolver, LockTimeoutSource, LockTimeoutValue,
    parse_timeout_override,
};
pub use wait_observer::{LockWaitObserver, LoggingWaitObserver, NoopLockWaitObserver};
pub use wait_strategy::{WaitStrategy, WaitStrategyKind};
