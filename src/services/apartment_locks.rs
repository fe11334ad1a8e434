//! Per-apartment write locks
//!
//! Serializes reconciliation of one apartment within this process. Entries are
//! created on demand and removed by `ApartmentGuard` once nobody waits on them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Held while an apartment is being reconciled
pub struct ApartmentGuard {
    apartment_id: Uuid,
    lock: Arc<AsyncMutex<()>>,
    registry: ApartmentLocks,
    _held: Option<OwnedMutexGuard<()>>,
}

impl Drop for ApartmentGuard {
    fn drop(&mut self) {
        // Release the async lock first so a waiter can proceed.
        self._held.take();
        let mut locks = self.registry.locks.lock();
        // Registry entry plus our own clone: no one else is waiting.
        if Arc::strong_count(&self.lock) <= 2 {
            locks.remove(&self.apartment_id);
        }
    }
}

/// Thread-safe registry of apartment locks
#[derive(Clone, Default)]
pub struct ApartmentLocks {
    locks: Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>,
}

impl ApartmentLocks {
    /// Wait for exclusive access to an apartment.
    pub async fn acquire(&self, apartment_id: Uuid) -> ApartmentGuard {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(apartment_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let held = lock.clone().lock_owned().await;
        ApartmentGuard {
            apartment_id,
            lock,
            registry: self.clone(),
            _held: Some(held),
        }
    }

    /// Number of apartments with a live lock entry
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
