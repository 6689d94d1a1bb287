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

use crate::locking::entry::LockEntry;
use crate::locking::manager::ManagerShared;
use crate::locking::owner::OwnerId;
use log::debug;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Proof of ownership returned by a successful acquisition.
///
/// Each handle carries the permits it added to its entry. Releasing consumes
/// one permit; dropping the handle releases whatever is left.
pub struct LockHandle {
    shared: Arc<ManagerShared>,
    entry: Arc<LockEntry>,
    owner: OwnerId,
    permits: AtomicU32,
    acquired_at: Instant,
    waited: Duration,
    reentrant: bool,
}

impl LockHandle {
    pub(crate) fn new(
        shared: Arc<ManagerShared>,
        entry: Arc<LockEntry>,
        owner: OwnerId,
        permits: u32,
        waited: Duration,
        reentrant: bool,
    ) -> Self {
        Self {
            shared,
            entry,
            owner,
            permits: AtomicU32::new(permits),
            acquired_at: Instant::now(),
            waited,
            reentrant,
        }
    }

    pub fn key(&self) -> &str {
        self.entry.key()
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub(crate) fn shared(&self) -> &Arc<ManagerShared> {
        &self.shared
    }

    pub(crate) fn entry(&self) -> &Arc<LockEntry> {
        &self.entry
    }

    pub fn generation(&self) -> u64 {
        self.entry.generation()
    }

    /// Time spent waiting before the key was granted.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// True when the owner already held the key and this handle joined it.
    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    pub fn expires_at(&self) -> Instant {
        self.entry.expires_at()
    }

    pub fn outstanding_permits(&self) -> u32 {
        self.permits.load(Ordering::Acquire)
    }

    /// Whether this handle still holds the key: it has permits left and its
    /// entry has not been superseded.
    pub fn is_held(&self) -> bool {
        self.outstanding_permits() > 0 && self.entry.is_valid()
    }

    /// Releases one permit. Returns true only for the release that freed the key.
    pub fn release(&self) -> bool {
        self.shared.release_permit(self)
    }

    /// Pushes the expiry to `now + lease`. Refused once the lease has lapsed.
    pub fn extend(&self, lease: Duration) -> bool {
        self.shared.extend_lease(self, lease)
    }

    pub(crate) fn take_permit(&self) -> bool {
        self.permits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .is_ok()
    }

    pub(crate) fn forfeit_permits(&self) -> u32 {
        self.permits.swap(0, Ordering::AcqRel)
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key())
            .field("generation", &self.generation())
            .field("owner", &self.owner)
            .field("permits", &self.outstanding_permits())
            .field("reentrant", &self.reentrant)
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.outstanding_permits() == 0 {
            return;
        }

        let mut released = false;
        while self.outstanding_permits() > 0 {
            released |= self.release();
        }
        debug!(
            "Released lock on '{}' on drop after {:.3}s (freed: {released})",
            self.key(),
            self.acquired_at.elapsed().as_secs_f64()
        );
    }
}
