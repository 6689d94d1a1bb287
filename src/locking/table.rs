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

//! Concurrent key to entry mapping.
//!
//! Every mutation goes through [`LockTable::compute`], which runs the caller's
//! closure under the lock of the shard owning the key. Keys in different
//! shards never contend on the same mutex.

use crate::locking::entry::LockEntry;
use std::cmp;
use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const DEFAULT_SHARDS: usize = 16;

/// What `compute` should leave in the table for the key.
#[derive(Debug)]
pub enum Slot {
    Keep,
    Replace(Arc<LockEntry>),
    Remove,
}

type Shard = Mutex<HashMap<String, Arc<LockEntry>>>;

#[derive(Debug)]
pub struct LockTable {
    shards: Box<[Shard]>,
    hasher: RandomState,
    generations: AtomicU64,
}

impl LockTable {
    pub fn new(shards: usize) -> Self {
        let shards = (0..cmp::max(shards, 1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            hasher: RandomState::new(),
            generations: AtomicU64::new(0),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, key: &str) -> MutexGuard<'_, HashMap<String, Arc<LockEntry>>> {
        let index = (self.hasher.hash_one(key) % self.shards.len() as u64) as usize;
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically reads and rewrites the entry for `key`.
    ///
    /// The closure observes the current entry (if any) and decides what the
    /// table holds afterwards. No other `compute` for the same key can run in
    /// between. The closure must not block or call back into the table.
    pub fn compute<R, F>(&self, key: &str, f: F) -> R
    where
        F: FnOnce(Option<&Arc<LockEntry>>) -> (Slot, R),
    {
        let mut shard = self.shard_for(key);
        let (slot, result) = f(shard.get(key));
        match slot {
            Slot::Keep => {}
            Slot::Replace(entry) => {
                shard.insert(key.to_string(), entry);
            }
            Slot::Remove => {
                shard.remove(key);
            }
        }
        result
    }

    pub fn get(&self, key: &str) -> Option<Arc<LockEntry>> {
        self.shard_for(key).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            keys.extend(shard.keys().cloned());
        }
        keys
    }

    /// Point-in-time copy of all entries; shards are visited one at a time.
    pub fn snapshot(&self) -> Vec<Arc<LockEntry>> {
        let mut entries = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            entries.extend(shard.values().cloned());
        }
        entries
    }

    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::owner::OwnerId;
    use std::time::{Duration, Instant};

    fn entry(table: &LockTable, key: &str) -> Arc<LockEntry> {
        Arc::new(LockEntry::new(
            key,
            OwnerId::token("t"),
            table.next_generation(),
            Instant::now(),
            Duration::from_secs(1),
            1,
        ))
    }

    #[test]
    fn compute_installs_and_removes() {
        let table = LockTable::new(4);
        let created = entry(&table, "a");

        let observed = table.compute("a", |current| {
            (Slot::Replace(Arc::clone(&created)), current.is_some())
        });
        assert!(!observed);
        assert_eq!(table.len(), 1);
        assert!(Arc::ptr_eq(&table.get("a").unwrap(), &created));

        let observed = table.compute("a", |current| (Slot::Remove, current.is_some()));
        assert!(observed);
        assert!(table.is_empty());
    }

    #[test]
    fn keep_leaves_table_untouched() {
        let table = LockTable::new(1);
        let first = entry(&table, "a");
        table.compute("a", |_| (Slot::Replace(Arc::clone(&first)), ()));
        table.compute("a", |_| (Slot::Keep, ()));
        assert!(Arc::ptr_eq(&table.get("a").unwrap(), &first));
    }

    #[test]
    fn zero_shards_falls_back_to_one() {
        let table = LockTable::new(0);
        assert_eq!(table.shard_count(), 1);
    }

    #[test]
    fn snapshot_covers_all_shards() {
        let table = LockTable::new(8);
        for key in ["a", "b", "c", "d", "e"] {
            let created = entry(&table, key);
            table.compute(key, |_| (Slot::Replace(created), ()));
        }
        let mut keys: Vec<String> = table
            .snapshot()
            .iter()
            .map(|entry| entry.key().to_string())
            .collect();
        keys.sort();
        assert_eq!(keys, ["a", "b", "c", "d", "e"]);

        let mut listed = table.keys();
        listed.sort();
        assert_eq!(listed, keys);
    }

    #[test]
    fn generations_are_unique() {
        let table = LockTable::default();
        assert_ne!(table.next_generation(), table.next_generation());
    }
}
