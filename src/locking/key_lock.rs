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

use crate::error::{KeylockError, Result};
use crate::locking::acquisition::LockRequest;
use crate::locking::handle::LockHandle;
use crate::locking::manager::LockManager;
use crate::locking::owner::OwnerId;
use crate::locking::timeout::LockTimeoutValue;
use log::debug;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Single-use lock object for one key, prepared by [`LockManager::lock_for`].
///
/// `lock` or `try_lock` may be called once. Whatever is still held when the
/// object is dropped is released.
pub struct KeyLock {
    manager: LockManager,
    key: String,
    lease: Option<Duration>,
    permits: u32,
    owner: Option<OwnerId>,
    used: AtomicBool,
    handle: Mutex<Option<LockHandle>>,
}

impl KeyLock {
    pub(crate) fn new(manager: LockManager, key: String) -> Self {
        Self {
            manager,
            key,
            lease: None,
            permits: 1,
            owner: None,
            used: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn with_permits(mut self, permits: u32) -> Self {
        self.permits = permits.max(1);
        self
    }

    pub fn with_owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lock<T: Into<LockTimeoutValue>>(&self, timeout: T) -> Result<()> {
        self.claim()?;
        let handle = self.manager.acquire_with(self.request().timeout(timeout))?;
        *self.slot() = Some(handle);
        Ok(())
    }

    pub fn try_lock(&self) -> Result<bool> {
        self.claim()?;
        match self.manager.try_acquire_with(self.request())? {
            Some(handle) => {
                *self.slot() = Some(handle);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Releases one permit; true when this freed the key.
    pub fn unlock(&self) -> bool {
        let mut slot = self.slot();
        let Some(handle) = slot.as_ref() else {
            debug!("unlock on '{}' without a held lock", self.key);
            return false;
        };
        let freed = handle.release();
        if handle.outstanding_permits() == 0 {
            *slot = None;
        }
        freed
    }

    pub fn is_held(&self) -> bool {
        self.slot().as_ref().is_some_and(LockHandle::is_held)
    }

    fn claim(&self) -> Result<()> {
        if self.used.swap(true, Ordering::AcqRel) {
            return Err(KeylockError::InvalidHandleReuse {
                key: self.key.clone(),
            });
        }
        Ok(())
    }

    fn request(&self) -> LockRequest {
        let mut request = LockRequest::new(self.key.clone()).permits(self.permits);
        if let Some(lease) = self.lease {
            request = request.lease(lease);
        }
        if let Some(owner) = &self.owner {
            request = request.owner(owner.clone());
        }
        request
    }

    fn slot(&self) -> MutexGuard<'_, Option<LockHandle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for KeyLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLock")
            .field("key", &self.key)
            .field("used", &self.used.load(Ordering::Acquire))
            .field("held", &self.is_held())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_then_unlock() {
        let manager = LockManager::default();
        let lock = manager.lock_for("id1").with_lease(Duration::from_secs(5));

        lock.lock(Duration::from_millis(100)).unwrap();
        assert!(lock.is_held());
        assert_eq!(manager.active_lock_count(), 1);

        assert!(lock.unlock());
        assert!(!lock.is_held());
        assert!(!lock.unlock());
        assert_eq!(manager.active_lock_count(), 0);
    }

    #[test]
    fn second_lock_call_is_rejected() {
        let manager = LockManager::default();
        let lock = manager.lock_for("id1");
        lock.lock(Duration::ZERO).unwrap();

        let err = lock.lock(Duration::ZERO).unwrap_err();
        assert!(matches!(err, KeylockError::InvalidHandleReuse { ref key } if key == "id1"));
        assert!(matches!(
            lock.try_lock(),
            Err(KeylockError::InvalidHandleReuse { .. })
        ));
        assert!(lock.is_held());
    }

    #[test]
    fn failed_try_lock_still_consumes_the_object() {
        let manager = LockManager::default();
        let _held = manager
            .acquire_with(LockRequest::new("id1").owner(OwnerId::token("a")))
            .unwrap();

        let lock = manager.lock_for("id1").with_owner(OwnerId::token("b"));
        assert!(!lock.try_lock().unwrap());
        assert!(lock.try_lock().is_err());
    }

    #[test]
    fn permits_need_matching_unlocks() {
        let manager = LockManager::default();
        let lock = manager.lock_for("id1").with_permits(2);
        assert!(lock.try_lock().unwrap());

        assert!(!lock.unlock());
        assert!(lock.is_held());
        assert!(lock.unlock());
        assert!(!lock.is_held());
    }

    #[test]
    fn drop_releases_key() {
        let manager = LockManager::default();
        {
            let lock = manager.lock_for("id1");
            lock.lock(Duration::ZERO).unwrap();
        }
        assert_eq!(manager.active_lock_count(), 0);
    }
}
