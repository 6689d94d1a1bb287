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

//! Per-key lock state stored in the lock table.
//!
//! An entry is created by the acquisition that wins a key and lives until the
//! terminal release or until a contender reclaims it after its lease lapses.
//! The `valid` flag only ever goes from `true` to `false`; anyone holding an
//! `Arc` to a retired entry can observe that it was superseded.

use crate::locking::owner::OwnerId;
use std::cmp;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Upper bound on any lease so expiry arithmetic never overflows `Instant`.
pub const MAX_LEASE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

pub(crate) fn lease_deadline(now: Instant, lease: Duration) -> Instant {
    now + cmp::min(lease, MAX_LEASE)
}

fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(cmp::min(duration, MAX_LEASE).as_nanos()).unwrap_or(u64::MAX)
}

/// Exclusive slot scoped to a single entry.
///
/// The owner holds it from the moment the entry is created. Waiters using the
/// entry-unit strategy block on it; it is handed back on terminal release or
/// when the entry is reclaimed after expiry.
pub struct WaitUnit {
    holder: Mutex<Option<OwnerId>>,
    available: Condvar,
}

impl WaitUnit {
    fn held_by(owner: OwnerId) -> Self {
        Self {
            holder: Mutex::new(Some(owner)),
            available: Condvar::new(),
        }
    }

    fn lock_holder(&self) -> MutexGuard<'_, Option<OwnerId>> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn holder(&self) -> Option<OwnerId> {
        self.lock_holder().clone()
    }

    pub fn is_held_by(&self, owner: &OwnerId) -> bool {
        self.lock_holder().as_ref() == Some(owner)
    }

    /// Takes the unit for `owner`, blocking for at most `timeout`.
    pub fn take(&self, owner: &OwnerId, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut holder = self.lock_holder();
        loop {
            if holder.is_none() {
                *holder = Some(owner.clone());
                return true;
            }

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                return false;
            }

            holder = self
                .available
                .wait_timeout(holder, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Hands the unit back if `owner` holds it.
    pub fn release_from(&self, owner: &OwnerId) -> bool {
        let mut holder = self.lock_holder();
        if holder.as_ref() != Some(owner) {
            return false;
        }
        *holder = None;
        drop(holder);
        self.available.notify_all();
        true
    }

    /// Frees the unit regardless of who holds it and returns the previous holder.
    pub fn force_release(&self) -> Option<OwnerId> {
        let previous = self.lock_holder().take();
        self.available.notify_all();
        previous
    }
}

impl fmt::Debug for WaitUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitUnit")
            .field("holder", &self.holder())
            .finish()
    }
}

/// Ownership record for one key.
#[derive(Debug)]
pub struct LockEntry {
    key: String,
    owner: OwnerId,
    generation: u64,
    acquired_at: Instant,
    // Expiry is `acquired_at + lease_nanos`; only ever grows.
    lease_nanos: AtomicU64,
    release_count: AtomicU32,
    valid: AtomicBool,
    waiters: AtomicUsize,
    unit: WaitUnit,
}

impl LockEntry {
    pub(crate) fn new(
        key: &str,
        owner: OwnerId,
        generation: u64,
        acquired_at: Instant,
        lease: Duration,
        permits: u32,
    ) -> Self {
        Self {
            key: key.to_string(),
            owner: owner.clone(),
            generation,
            acquired_at,
            lease_nanos: AtomicU64::new(duration_to_nanos(lease)),
            release_count: AtomicU32::new(cmp::max(permits, 1)),
            valid: AtomicBool::new(true),
            waiters: AtomicUsize::new(0),
            unit: WaitUnit::held_by(owner),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub fn expires_at(&self) -> Instant {
        self.acquired_at + Duration::from_nanos(self.lease_nanos.load(Ordering::Acquire))
    }

    /// True once a contender may reclaim the key (`now >= expires_at`).
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    /// True once the lease has strictly passed (`now > expires_at`).
    pub fn is_lapsed_at(&self, now: Instant) -> bool {
        now > self.expires_at()
    }

    pub fn time_to_expiry(&self, now: Instant) -> Duration {
        self.expires_at().saturating_duration_since(now)
    }

    /// Moves the expiry forward to `deadline`. Never moves it backwards.
    pub(crate) fn extend_to(&self, deadline: Instant) -> bool {
        let target = duration_to_nanos(deadline.saturating_duration_since(self.acquired_at));
        let mut current = self.lease_nanos.load(Ordering::Acquire);
        loop {
            if target <= current {
                return false;
            }
            match self.lease_nanos.compare_exchange_weak(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Marks the entry as superseded. Returns true only for the call that flipped it.
    pub(crate) fn supersede(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }

    pub fn release_count(&self) -> u32 {
        self.release_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_permits(&self, permits: u32) {
        let _ = self
            .release_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_add(permits))
            });
    }

    /// Consumes one permit and returns how many remain, or `None` if none were left.
    pub(crate) fn release_one(&self) -> Option<u32> {
        self.release_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .ok()
            .map(|previous| previous - 1)
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    pub(crate) fn register_waiter(&self) {
        self.waiters.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the number of waiters still queued after this one left.
    pub(crate) fn unregister_waiter(&self) -> usize {
        match self
            .waiters
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            }) {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    pub fn wait_unit(&self) -> &WaitUnit {
        &self.unit
    }
}

impl fmt::Display for LockEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'#{} ({})", self.key, self.generation, self.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn entry(lease: Duration, permits: u32) -> LockEntry {
        LockEntry::new(
            "id1",
            OwnerId::token("a"),
            1,
            Instant::now(),
            lease,
            permits,
        )
    }

    #[test]
    fn expiry_only_moves_forward() {
        let entry = entry(Duration::from_secs(5), 1);
        let original = entry.expires_at();

        assert!(!entry.extend_to(original - Duration::from_secs(1)));
        assert_eq!(entry.expires_at(), original);

        assert!(entry.extend_to(original + Duration::from_secs(10)));
        assert_eq!(entry.expires_at(), original + Duration::from_secs(10));
    }

    #[test]
    fn expiry_checks_use_lease() {
        let entry = entry(Duration::from_secs(5), 1);
        let at_expiry = entry.expires_at();

        assert!(!entry.is_expired_at(at_expiry - Duration::from_millis(1)));
        assert!(entry.is_expired_at(at_expiry));
        assert!(!entry.is_lapsed_at(at_expiry));
        assert!(entry.is_lapsed_at(at_expiry + Duration::from_millis(1)));
    }

    #[test]
    fn supersede_is_one_way() {
        let entry = entry(Duration::from_secs(1), 1);
        assert!(entry.is_valid());
        assert!(entry.supersede());
        assert!(!entry.supersede());
        assert!(!entry.is_valid());
    }

    #[test]
    fn release_count_stops_at_zero() {
        let entry = entry(Duration::from_secs(1), 2);
        entry.add_permits(1);
        assert_eq!(entry.release_one(), Some(2));
        assert_eq!(entry.release_one(), Some(1));
        assert_eq!(entry.release_one(), Some(0));
        assert_eq!(entry.release_one(), None);
    }

    #[test]
    fn zero_permits_are_treated_as_one() {
        assert_eq!(entry(Duration::from_secs(1), 0).release_count(), 1);
    }

    #[test]
    fn waiter_count_never_underflows() {
        let entry = entry(Duration::from_secs(1), 1);
        entry.register_waiter();
        assert_eq!(entry.unregister_waiter(), 0);
        assert_eq!(entry.unregister_waiter(), 0);
    }

    #[test]
    fn unit_is_held_by_creator() {
        let entry = entry(Duration::from_secs(1), 1);
        let owner = OwnerId::token("a");
        let other = OwnerId::token("b");

        assert!(entry.wait_unit().is_held_by(&owner));
        assert!(!entry.wait_unit().take(&other, Duration::from_millis(10)));
        assert!(!entry.wait_unit().release_from(&other));
        assert!(entry.wait_unit().release_from(&owner));
        assert!(entry.wait_unit().take(&other, Duration::ZERO));
        assert_eq!(entry.wait_unit().force_release(), Some(other));
        assert_eq!(entry.wait_unit().holder(), None);
    }

    #[test]
    fn unit_wakes_blocked_taker() {
        let entry = Arc::new(entry(Duration::from_secs(1), 1));
        let waiter_entry = Arc::clone(&entry);
        let waiter = thread::spawn(move || {
            waiter_entry
                .wait_unit()
                .take(&OwnerId::token("b"), Duration::from_secs(5))
        });

        thread::sleep(Duration::from_millis(20));
        assert!(entry.wait_unit().release_from(&OwnerId::token("a")));
        assert!(waiter.join().unwrap());
        assert!(entry.wait_unit().is_held_by(&OwnerId::token("b")));
    }
}
