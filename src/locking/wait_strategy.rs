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

//! How a contended caller sleeps between acquisition attempts.
//!
//! Both strategies give the same contract: a waiter blocks for at most the
//! quantum it is handed, and it is woken early once the entry it waits on is
//! released or reclaimed. The waiter always re-runs the full acquisition
//! attempt afterwards; a strategy never hands out ownership by itself.

use crate::error::{KeylockError, Result};
use crate::locking::entry::LockEntry;
use crate::locking::owner::OwnerId;
use log::trace;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitStrategyKind {
    /// Shared condition variable, re-checked at every poll quantum.
    #[default]
    Condvar,
    /// Block on the exclusive wait unit of the contended entry.
    EntryUnit,
}

impl fmt::Display for WaitStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitStrategyKind::Condvar => f.write_str("condvar"),
            WaitStrategyKind::EntryUnit => f.write_str("entry-unit"),
        }
    }
}

impl FromStr for WaitStrategyKind {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "condvar" => Ok(WaitStrategyKind::Condvar),
            "entry-unit" | "entry_unit" | "unit" => Ok(WaitStrategyKind::EntryUnit),
            other => Err(format!(
                "Unknown wait strategy '{other}'. Expected 'condvar' or 'entry-unit'."
            )),
        }
    }
}

/// Snapshot taken before an attempt so wake-ups racing with it are not lost.
pub type WaitTicket = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signalled,
    TimedOut,
}

pub trait WaitStrategy: Send + Sync + fmt::Debug {
    fn kind(&self) -> WaitStrategyKind;

    fn ticket(&self) -> WaitTicket {
        0
    }

    /// Blocks `waiter` on `entry` for at most `quantum`.
    fn wait(
        &self,
        entry: &LockEntry,
        ticket: WaitTicket,
        waiter: &OwnerId,
        quantum: Duration,
    ) -> Result<WaitOutcome>;

    /// Called once `entry` has been released for good or reclaimed.
    fn wake(&self, entry: &LockEntry);
}

pub fn strategy_for(kind: WaitStrategyKind) -> Arc<dyn WaitStrategy> {
    match kind {
        WaitStrategyKind::Condvar => Arc::new(CondvarWait::new()),
        WaitStrategyKind::EntryUnit => Arc::new(EntryUnitWait),
    }
}

/// Waiters park on one manager-wide condition variable.
///
/// Every terminal release bumps an epoch and notifies all waiters; each waiter
/// re-checks the table. Expired leases produce no notification, so waiters
/// rely on their quantum being capped at the entry's remaining lease.
#[derive(Debug, Default)]
pub struct CondvarWait {
    epoch: Mutex<u64>,
    changed: Condvar,
}

impl CondvarWait {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitStrategy for CondvarWait {
    fn kind(&self) -> WaitStrategyKind {
        WaitStrategyKind::Condvar
    }

    fn ticket(&self) -> WaitTicket {
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(
        &self,
        entry: &LockEntry,
        ticket: WaitTicket,
        waiter: &OwnerId,
        quantum: Duration,
    ) -> Result<WaitOutcome> {
        let deadline = Instant::now().checked_add(quantum);
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        while *epoch == ticket {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                return Ok(WaitOutcome::TimedOut);
            }
            epoch = self
                .changed
                .wait_timeout(epoch, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        trace!("{waiter} woken while waiting on {entry}");
        Ok(WaitOutcome::Signalled)
    }

    fn wake(&self, _entry: &LockEntry) {
        {
            let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
            *epoch = epoch.wrapping_add(1);
        }
        self.changed.notify_all();
    }
}

/// Waiters take the contended entry's wait unit, then pass it straight on.
///
/// The unit only becomes free after the entry was superseded, so a waiter that
/// obtains it knows its view of the entry is stale and retries from the top.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntryUnitWait;

impl WaitStrategy for EntryUnitWait {
    fn kind(&self) -> WaitStrategyKind {
        WaitStrategyKind::EntryUnit
    }

    fn wait(
        &self,
        entry: &LockEntry,
        _ticket: WaitTicket,
        waiter: &OwnerId,
        quantum: Duration,
    ) -> Result<WaitOutcome> {
        if !entry.wait_unit().take(waiter, quantum) {
            return Ok(WaitOutcome::TimedOut);
        }

        entry.wait_unit().release_from(waiter);
        if entry.is_valid() {
            return Err(KeylockError::InternalInconsistency {
                key: entry.key().to_string(),
                details: format!(
                    "wait unit of live entry {entry} was free for {waiter}"
                ),
            });
        }

        trace!("{waiter} observed superseded entry {entry}");
        Ok(WaitOutcome::Signalled)
    }

    fn wake(&self, _entry: &LockEntry) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn entry(owner: &str) -> Arc<LockEntry> {
        Arc::new(LockEntry::new(
            "k",
            OwnerId::token(owner),
            1,
            Instant::now(),
            Duration::from_secs(10),
            1,
        ))
    }

    #[test]
    fn parses_strategy_names() {
        assert_eq!(
            "condvar".parse::<WaitStrategyKind>().unwrap(),
            WaitStrategyKind::Condvar
        );
        assert_eq!(
            "Entry-Unit".parse::<WaitStrategyKind>().unwrap(),
            WaitStrategyKind::EntryUnit
        );
        assert!("spin".parse::<WaitStrategyKind>().is_err());
        assert_eq!(WaitStrategyKind::EntryUnit.to_string(), "entry-unit");
    }

    #[test]
    fn condvar_times_out_without_wake() {
        let strategy = CondvarWait::new();
        let entry = entry("a");
        let ticket = strategy.ticket();
        let outcome = strategy
            .wait(&entry, ticket, &OwnerId::token("b"), Duration::from_millis(20))
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn condvar_wake_before_wait_is_not_lost() {
        let strategy = CondvarWait::new();
        let entry = entry("a");
        let ticket = strategy.ticket();
        strategy.wake(&entry);
        let outcome = strategy
            .wait(&entry, ticket, &OwnerId::token("b"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Signalled);
    }

    #[test]
    fn condvar_wakes_blocked_waiter() {
        let strategy = Arc::new(CondvarWait::new());
        let entry = entry("a");
        let ticket = strategy.ticket();

        let waiter_strategy = Arc::clone(&strategy);
        let waiter_entry = Arc::clone(&entry);
        let waiter = thread::spawn(move || {
            waiter_strategy
                .wait(&waiter_entry, ticket, &OwnerId::token("b"), Duration::from_secs(5))
                .unwrap()
        });

        thread::sleep(Duration::from_millis(20));
        strategy.wake(&entry);
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Signalled);
    }

    #[test]
    fn entry_unit_times_out_while_owner_holds_it() {
        let entry = entry("a");
        let outcome = EntryUnitWait
            .wait(&entry, 0, &OwnerId::token("b"), Duration::from_millis(20))
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn entry_unit_signals_after_supersession() {
        let entry = entry("a");
        entry.supersede();
        entry.wait_unit().force_release();

        let waiter = OwnerId::token("b");
        let outcome = EntryUnitWait
            .wait(&entry, 0, &waiter, Duration::from_millis(20))
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Signalled);
        assert_eq!(entry.wait_unit().holder(), None);
    }

    #[test]
    fn entry_unit_free_on_live_entry_is_inconsistent() {
        let entry = entry("a");
        entry.wait_unit().force_release();

        let err = EntryUnitWait
            .wait(&entry, 0, &OwnerId::token("b"), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, KeylockError::InternalInconsistency { .. }));
    }
}
