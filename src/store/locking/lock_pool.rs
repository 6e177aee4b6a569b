//! Per-block-id lock pool.
//!
//! Hands out owned guards so a lease can live inside a [`super::Block`]
//! handle without borrowing the pool.  Map entries are dropped again once
//! the last interested party releases, so the pool only grows with the
//! number of ids currently in flight.

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;

use crate::blockid::BlockId;

/// Owned lease on one block id.
pub(crate) type BlockLockGuard = ArcMutexGuard<RawMutex, ()>;

#[derive(Default)]
pub(crate) struct LockPool {
    locks: Mutex<HashMap<BlockId, Arc<Mutex<()>>>>,
}

impl LockPool {
    /// Block until the id is free and take the lease.  The map lock is only
    /// held to fetch the entry; waiting happens on the per-id mutex.
    pub(crate) fn acquire(&self, id: &BlockId) -> BlockLockGuard {
        let mutex = Arc::clone(self.locks.lock().entry(*id).or_default());
        mutex.lock_arc()
    }

    /// Drop the map entry if nobody else holds or awaits the id.  Call
    /// after the guard for `id` has been dropped.
    pub(crate) fn release(&self, id: &BlockId) {
        let mut locks = self.locks.lock();
        if let Some(mutex) = locks.get(id) {
            if Arc::strong_count(mutex) == 1 {
                locks.remove(id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn num_tracked_ids(&self) -> usize {
        self.locks.lock().len()
    }
}
