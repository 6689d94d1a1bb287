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

//! Sweeps entries whose owners walked away.
//!
//! Expired entries are normally reclaimed by the next contender. A key that
//! nobody asks for again would otherwise stay in the table forever, so the
//! sweep drops lapsed entries that have no queued waiters. Entries with
//! waiters are left alone; those waiters reclaim them on their next attempt.

use crate::locking::clock::Clock;
use crate::locking::entry::LockEntry;
use crate::locking::table::{LockTable, Slot};
use log::debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Summary of a hygiene sweep.
#[derive(Debug, Default, Clone)]
pub struct LockHygieneReport {
    pub purged: usize,
    pub skipped_with_waiters: usize,
    pub duration: Duration,
}

enum Sweep {
    Purged(Arc<LockEntry>),
    SkippedWithWaiters,
    Untouched,
}

pub struct LockHygieneRunner<'a> {
    table: &'a LockTable,
    clock: &'a dyn Clock,
}

impl<'a> LockHygieneRunner<'a> {
    pub fn new(table: &'a LockTable, clock: &'a dyn Clock) -> Self {
        Self { table, clock }
    }

    /// Runs one sweep. `on_purged` is called for each removed entry after the
    /// table no longer references it.
    pub fn run<F>(&self, on_purged: F) -> LockHygieneReport
    where
        F: Fn(&LockEntry),
    {
        let start = Instant::now();
        let now = self.clock.now();
        let mut report = LockHygieneReport::default();

        for candidate in self.table.snapshot() {
            if candidate.is_valid() && !candidate.is_lapsed_at(now) {
                continue;
            }

            let sweep = self.table.compute(candidate.key(), |current| match current {
                Some(existing) if Arc::ptr_eq(existing, &candidate) => {
                    if existing.waiter_count() > 0 {
                        (Slot::Keep, Sweep::SkippedWithWaiters)
                    } else if !existing.is_valid() || existing.is_lapsed_at(now) {
                        existing.supersede();
                        (Slot::Remove, Sweep::Purged(Arc::clone(existing)))
                    } else {
                        (Slot::Keep, Sweep::Untouched)
                    }
                }
                _ => (Slot::Keep, Sweep::Untouched),
            });

            match sweep {
                Sweep::Purged(entry) => {
                    on_purged(&entry);
                    report.purged += 1;
                }
                Sweep::SkippedWithWaiters => report.skipped_with_waiters += 1,
                Sweep::Untouched => {}
            }
        }

        report.duration = start.elapsed();
        debug!(
            "Lock hygiene sweep purged {} entr(ies), skipped {} with waiters in {:.3}s",
            report.purged,
            report.skipped_with_waiters,
            report.duration.as_secs_f64()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::clock::ManualClock;
    use crate::locking::owner::OwnerId;
    use std::cell::Cell;

    fn install(table: &LockTable, clock: &ManualClock, key: &str, lease: Duration) -> Arc<LockEntry> {
        let entry = Arc::new(LockEntry::new(
            key,
            OwnerId::token("a"),
            table.next_generation(),
            clock.now(),
            lease,
            1,
        ));
        table.compute(key, |_| (Slot::Replace(Arc::clone(&entry)), ()));
        entry
    }

    #[test]
    fn purges_lapsed_entries_only() {
        let table = LockTable::new(4);
        let clock = ManualClock::new();
        let stale = install(&table, &clock, "stale", Duration::from_secs(1));
        install(&table, &clock, "fresh", Duration::from_secs(60));

        clock.advance(Duration::from_secs(2));
        let purged = Cell::new(0);
        let report = LockHygieneRunner::new(&table, &clock).run(|_| purged.set(purged.get() + 1));

        assert_eq!(report.purged, 1);
        assert_eq!(purged.get(), 1);
        assert!(!stale.is_valid());
        assert!(table.get("stale").is_none());
        assert!(table.get("fresh").is_some());
    }

    #[test]
    fn leaves_entries_with_waiters() {
        let table = LockTable::new(4);
        let clock = ManualClock::new();
        let entry = install(&table, &clock, "busy", Duration::from_secs(1));
        entry.register_waiter();

        clock.advance(Duration::from_secs(2));
        let report = LockHygieneRunner::new(&table, &clock).run(|_| {});

        assert_eq!(report.purged, 0);
        assert_eq!(report.skipped_with_waiters, 1);
        assert!(entry.is_valid());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn entry_exactly_at_expiry_is_kept() {
        let table = LockTable::new(1);
        let clock = ManualClock::new();
        install(&table, &clock, "edge", Duration::from_secs(1));

        clock.advance(Duration::from_secs(1));
        let report = LockHygieneRunner::new(&table, &clock).run(|_| {});
        assert_eq!(report.purged, 0);
        assert_eq!(table.len(), 1);
    }
}
