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

//! Keyed lock manager.
//!
//! Acquisition runs one attempt per loop iteration through
//! [`LockTable::compute`]:
//!
//! * no entry, or an entry that is superseded or past its lease: install a
//!   fresh entry for the caller (an expired one is marked superseded first);
//! * an entry owned by the caller: join it (re-entrancy);
//! * anything else: register as a waiter on the entry and sleep on the
//!   configured [`WaitStrategy`] for one quantum, then try again.
//!
//! The waiter registration lives inside the entry and is only changed inside
//! `compute`, so the terminal release can decide atomically whether to drop
//! the entry from the table or leave it for a queued waiter to replace.

use crate::config::LockingConfig;
use crate::error::{KeylockError, Result, UnavailableReason};
use crate::locking::acquisition::{AcquireMode, AcquisitionProgress, LockRequest, PollingBackoff};
use crate::locking::clock::{Clock, SystemClock};
use crate::locking::entry::{LockEntry, lease_deadline};
use crate::locking::handle::LockHandle;
use crate::locking::hygiene::{LockHygieneReport, LockHygieneRunner};
use crate::locking::key_lock::KeyLock;
use crate::locking::owner::{OwnerId, OwnerResolver, thread_owner_resolver};
use crate::locking::table::{LockTable, Slot};
use crate::locking::timeout::LockTimeoutValue;
use crate::locking::wait_strategy::{WaitStrategy, WaitStrategyKind, strategy_for};
use log::{debug, error, info, trace, warn};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of a single pass through the table for an acquisition.
enum Attempt {
    Created {
        entry: Arc<LockEntry>,
        reclaimed: Option<Arc<LockEntry>>,
    },
    Reentered(Arc<LockEntry>),
    Contended(Arc<LockEntry>),
    Inconsistent(String),
}

enum ReleaseOutcome {
    Terminal { removed: bool },
    Partial { remaining: u32 },
    Superseded,
    NotOwner,
    Inconsistent(String),
}

pub(crate) struct ManagerShared {
    table: LockTable,
    clock: Arc<dyn Clock>,
    strategy: Arc<dyn WaitStrategy>,
    owner_resolver: OwnerResolver,
    config: LockingConfig,
}

impl ManagerShared {
    fn acquire(self: &Arc<Self>, request: LockRequest) -> Result<Option<LockHandle>> {
        let parts = request.into_parts();
        let key = parts.key.as_str();
        let owner = parts.owner.unwrap_or_else(|| (self.owner_resolver)());
        let lease = parts.lease.unwrap_or_else(|| self.config.default_lease());
        let timeout = match parts.mode {
            AcquireMode::NonBlocking => LockTimeoutValue::ZERO,
            AcquireMode::Blocking => parts.timeout.unwrap_or_else(|| self.config.timeout()),
        };
        let register = parts.mode.may_wait();
        let backoff = PollingBackoff::new(
            self.config.backoff_initial(),
            2,
            self.config.poll_interval(),
        );
        let mut progress =
            AcquisitionProgress::new(key, timeout, backoff, parts.observer.as_deref());
        let mut waiting_on: Option<Arc<LockEntry>> = None;

        loop {
            if parts.cancellation.is_cancelled() {
                self.abandon(key, waiting_on.take());
                debug!("Acquisition of '{key}' by {owner} interrupted");
                return Err(progress.cancelled());
            }

            let ticket = self.strategy.ticket();
            let now = self.clock.now();
            let attempt = self.attempt(
                key,
                &owner,
                lease,
                parts.permits,
                now,
                waiting_on.take(),
                register,
            );

            match attempt {
                Attempt::Created { entry, reclaimed } => {
                    if let Some(expired) = reclaimed {
                        info!(
                            "Reclaimed expired lock {expired} for {owner} after its lease lapsed"
                        );
                        self.retire(&expired);
                    }
                    trace!("Acquired {entry} after {} retries", progress.retries());
                    progress.notify_acquired();
                    return Ok(Some(LockHandle::new(
                        Arc::clone(self),
                        entry,
                        owner,
                        parts.permits,
                        progress.waited(),
                        false,
                    )));
                }
                Attempt::Reentered(entry) => {
                    trace!("{owner} re-entered {entry}");
                    progress.notify_acquired();
                    return Ok(Some(LockHandle::new(
                        Arc::clone(self),
                        entry,
                        owner,
                        parts.permits,
                        progress.waited(),
                        true,
                    )));
                }
                Attempt::Inconsistent(details) => {
                    error!("Lock protocol violation on '{key}': {details}");
                    return Err(KeylockError::InternalInconsistency {
                        key: key.to_string(),
                        details,
                    });
                }
                Attempt::Contended(entry) => {
                    if !register {
                        trace!("'{key}' is held by {}; not waiting", entry.owner());
                        return Ok(None);
                    }

                    let quantum = if progress.is_expired() {
                        None
                    } else {
                        progress.next_quantum(entry.time_to_expiry(self.clock.now()))
                    };
                    let Some(quantum) = quantum else {
                        self.abandon(key, Some(entry));
                        debug!(
                            "Timed out waiting for '{key}' after {:.3}s",
                            progress.elapsed().as_secs_f64()
                        );
                        return Err(progress.timed_out());
                    };

                    progress.record_wait_start();
                    if let Err(err) = self.strategy.wait(&entry, ticket, &owner, quantum) {
                        error!("Wait on '{key}' failed: {err}");
                        self.abandon(key, Some(entry));
                        return Err(err);
                    }
                    progress.record_retry();
                    waiting_on = Some(entry);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &self,
        key: &str,
        owner: &OwnerId,
        lease: Duration,
        permits: u32,
        now: Instant,
        previous: Option<Arc<LockEntry>>,
        register: bool,
    ) -> Attempt {
        self.table.compute(key, |current| {
            if let Some(previous) = &previous {
                previous.unregister_waiter();
            }

            match current {
                Some(existing) if existing.is_valid() && !existing.is_expired_at(now) => {
                    if existing.owner() == owner {
                        if !existing.wait_unit().is_held_by(owner) {
                            let details = format!(
                                "{existing} is live but its wait unit is held by {:?}",
                                existing.wait_unit().holder()
                            );
                            return (Slot::Keep, Attempt::Inconsistent(details));
                        }
                        existing.add_permits(permits);
                        existing.extend_to(lease_deadline(now, lease));
                        return (Slot::Keep, Attempt::Reentered(Arc::clone(existing)));
                    }

                    if register {
                        existing.register_waiter();
                    }
                    (Slot::Keep, Attempt::Contended(Arc::clone(existing)))
                }
                Some(existing) => {
                    // Superseded by a terminal release, or past its lease.
                    let reclaimed = existing.supersede().then(|| Arc::clone(existing));
                    let entry = self.new_entry(key, owner, now, lease, permits);
                    (
                        Slot::Replace(Arc::clone(&entry)),
                        Attempt::Created { entry, reclaimed },
                    )
                }
                None => {
                    let entry = self.new_entry(key, owner, now, lease, permits);
                    (
                        Slot::Replace(Arc::clone(&entry)),
                        Attempt::Created {
                            entry,
                            reclaimed: None,
                        },
                    )
                }
            }
        })
    }

    fn new_entry(
        &self,
        key: &str,
        owner: &OwnerId,
        now: Instant,
        lease: Duration,
        permits: u32,
    ) -> Arc<LockEntry> {
        Arc::new(LockEntry::new(
            key,
            owner.clone(),
            self.table.next_generation(),
            now,
            lease,
            permits,
        ))
    }

    /// Drops a waiter registration without acquiring.
    ///
    /// The last waiter to leave a superseded entry that is still in the table
    /// removes it, so abandoned waits never leak entries.
    fn abandon(&self, key: &str, entry: Option<Arc<LockEntry>>) {
        let Some(entry) = entry else {
            return;
        };

        let removed = self.table.compute(key, |current| {
            let remaining = entry.unregister_waiter();
            match current {
                Some(existing)
                    if Arc::ptr_eq(existing, &entry) && !existing.is_valid() && remaining == 0 =>
                {
                    (Slot::Remove, true)
                }
                _ => (Slot::Keep, false),
            }
        });

        if removed {
            trace!("Last waiter left {entry}; removed it from the table");
        }
    }

    /// Hands the wait unit of a superseded entry back and wakes its waiters.
    pub(crate) fn retire(&self, entry: &LockEntry) {
        if let Some(previous) = entry.wait_unit().force_release() {
            trace!("Freed wait unit of {entry} previously held by {previous}");
        }
        self.strategy.wake(entry);
    }

    pub(crate) fn release_permit(&self, handle: &LockHandle) -> bool {
        if !handle.take_permit() {
            trace!("Handle for '{}' has no permits left", handle.key());
            return false;
        }

        let entry = handle.entry();
        let owner = handle.owner();
        let outcome = self.table.compute(handle.key(), |current| match current {
            Some(existing) if Arc::ptr_eq(existing, entry) && existing.is_valid() => {
                if existing.owner() != owner {
                    return (Slot::Keep, ReleaseOutcome::NotOwner);
                }
                match existing.release_one() {
                    None => (
                        Slot::Keep,
                        ReleaseOutcome::Inconsistent(format!(
                            "{existing} has no release permits left"
                        )),
                    ),
                    Some(0) => {
                        existing.supersede();
                        if existing.waiter_count() == 0 {
                            (Slot::Remove, ReleaseOutcome::Terminal { removed: true })
                        } else {
                            (Slot::Keep, ReleaseOutcome::Terminal { removed: false })
                        }
                    }
                    Some(remaining) => (Slot::Keep, ReleaseOutcome::Partial { remaining }),
                }
            }
            _ => (Slot::Keep, ReleaseOutcome::Superseded),
        });

        match outcome {
            ReleaseOutcome::Terminal { removed } => {
                entry.wait_unit().release_from(owner);
                self.strategy.wake(entry);
                debug!("Released {entry} (removed from table: {removed})");
                true
            }
            ReleaseOutcome::Partial { remaining } => {
                trace!("Released one permit of {entry}; {remaining} outstanding");
                false
            }
            ReleaseOutcome::Superseded => {
                handle.forfeit_permits();
                if entry.wait_unit().release_from(owner) {
                    warn!("Forcibly relinquished wait unit of superseded {entry}");
                }
                debug!("Release of {entry} ignored; the lock was already superseded");
                false
            }
            ReleaseOutcome::NotOwner => {
                warn!("{owner} tried to release {entry} which it does not own");
                false
            }
            ReleaseOutcome::Inconsistent(details) => {
                error!("Lock protocol violation on '{}': {details}", entry.key());
                false
            }
        }
    }

    pub(crate) fn extend_lease(&self, handle: &LockHandle, lease: Duration) -> bool {
        if handle.outstanding_permits() == 0 {
            return false;
        }

        let now = self.clock.now();
        let entry = handle.entry();
        let extended = self.table.compute(handle.key(), |current| match current {
            Some(existing)
                if Arc::ptr_eq(existing, entry)
                    && existing.is_valid()
                    && existing.owner() == handle.owner()
                    && !existing.is_expired_at(now) =>
            {
                (Slot::Keep, existing.extend_to(lease_deadline(now, lease)))
            }
            _ => (Slot::Keep, false),
        });

        if extended {
            trace!("Extended lease of {entry} by {lease:?}");
        }
        extended
    }
}

/// Grants at most one owner per key at a time.
///
/// Cloning is cheap; clones share the same lock table. Each manager instance
/// is independent, so callers wanting a process-wide manager create one and
/// pass it around.
#[derive(Clone)]
pub struct LockManager {
    shared: Arc<ManagerShared>,
}

impl LockManager {
    pub fn new(config: &LockingConfig) -> Self {
        Self::with_collaborators(config, Arc::new(SystemClock), thread_owner_resolver())
    }

    pub fn with_collaborators(
        config: &LockingConfig,
        clock: Arc<dyn Clock>,
        owner_resolver: OwnerResolver,
    ) -> Self {
        Self::with_strategy(config, clock, owner_resolver, strategy_for(config.wait_strategy))
    }

    pub fn with_strategy(
        config: &LockingConfig,
        clock: Arc<dyn Clock>,
        owner_resolver: OwnerResolver,
        strategy: Arc<dyn WaitStrategy>,
    ) -> Self {
        debug!(
            "Creating lock manager ({} strategy, {} shards)",
            strategy.kind(),
            config.shards
        );
        Self {
            shared: Arc::new(ManagerShared {
                table: LockTable::new(config.shards),
                clock,
                strategy,
                owner_resolver,
                config: config.clone(),
            }),
        }
    }

    pub fn config(&self) -> &LockingConfig {
        &self.shared.config
    }

    pub fn wait_strategy(&self) -> WaitStrategyKind {
        self.shared.strategy.kind()
    }

    /// Blocks until `key` is granted or `timeout` runs out.
    pub fn acquire<K, T>(&self, key: K, lease: Duration, timeout: T) -> Result<LockHandle>
    where
        K: Into<String>,
        T: Into<LockTimeoutValue>,
    {
        self.acquire_with(LockRequest::new(key).lease(lease).timeout(timeout))
    }

    pub fn acquire_permits<K, T>(
        &self,
        key: K,
        lease: Duration,
        timeout: T,
        permits: u32,
    ) -> Result<LockHandle>
    where
        K: Into<String>,
        T: Into<LockTimeoutValue>,
    {
        self.acquire_with(
            LockRequest::new(key)
                .lease(lease)
                .timeout(timeout)
                .permits(permits),
        )
    }

    /// Runs `request`. A non-blocking request that meets contention fails with
    /// a zero-wait timeout.
    pub fn acquire_with(&self, request: LockRequest) -> Result<LockHandle> {
        let key = request.key().to_string();
        match self.shared.acquire(request)? {
            Some(handle) => Ok(handle),
            None => Err(KeylockError::LockUnavailable {
                key,
                reason: UnavailableReason::Timeout,
                waited_secs: 0.0,
            }),
        }
    }

    /// Single attempt; `None` when another owner holds the key.
    pub fn try_acquire<K: Into<String>>(&self, key: K, lease: Duration) -> Result<Option<LockHandle>> {
        self.try_acquire_with(LockRequest::new(key).lease(lease))
    }

    pub fn try_acquire_permits<K: Into<String>>(
        &self,
        key: K,
        lease: Duration,
        permits: u32,
    ) -> Result<Option<LockHandle>> {
        self.try_acquire_with(LockRequest::new(key).lease(lease).permits(permits))
    }

    pub fn try_acquire_with(&self, request: LockRequest) -> Result<Option<LockHandle>> {
        self.shared.acquire(request.mode(AcquireMode::NonBlocking))
    }

    /// Releases one permit of `handle`; true only for the release that freed the key.
    pub fn release(&self, handle: &LockHandle) -> bool {
        if !Arc::ptr_eq(&self.shared, handle.shared()) {
            warn!(
                "Handle for '{}' was issued by a different lock manager",
                handle.key()
            );
            return false;
        }
        handle.release()
    }

    pub fn current_owner(&self, key: &str) -> Option<OwnerId> {
        self.shared
            .table
            .get(key)
            .filter(|entry| entry.is_valid())
            .map(|entry| entry.owner().clone())
    }

    /// `None` when nobody holds `key`, otherwise whether its lease has passed.
    ///
    /// A superseded entry kept around for queued waiters counts as nobody
    /// holding the key, matching [`LockManager::current_owner`].
    pub fn is_expired(&self, key: &str) -> Option<bool> {
        let now = self.shared.clock.now();
        self.shared
            .table
            .get(key)
            .filter(|entry| entry.is_valid())
            .map(|entry| entry.is_lapsed_at(now))
    }

    /// Number of keys currently in the table. Zero once nothing is held or awaited.
    pub fn active_lock_count(&self) -> usize {
        self.shared.table.len()
    }

    /// Prepares a single-use lock object for `key`.
    pub fn lock_for<K: Into<String>>(&self, key: K) -> KeyLock {
        KeyLock::new(self.clone(), key.into())
    }

    /// Removes entries whose lease lapsed and which nobody waits on.
    pub fn purge_expired(&self) -> LockHygieneReport {
        LockHygieneRunner::new(&self.shared.table, self.shared.clock.as_ref()).run(|entry| {
            self.shared.retire(entry);
        })
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(&LockingConfig::default())
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("strategy", &self.shared.strategy.kind())
            .field("shards", &self.shared.table.shard_count())
            .field("active", &self.active_lock_count())
            .finish()
    }
}
