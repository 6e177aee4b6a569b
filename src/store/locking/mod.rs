//! Locking layer — handle-based blocks on top of a flat store.
//!
//! Upper layers treat blocks as mutable records; the flat layer underneath
//! is transactional per call.  This layer bridges the two: a [`Block`]
//! handle holds the unique per-id lease (from a lock pool), an in-memory
//! copy of the plaintext, and a dirty flag.  `flush` and drop write the
//! copy back through the flat store.
//!
//! Two operations on the *same* id are serialized; operations on different
//! ids proceed in parallel.  A separate `structure_lock` serializes
//! mutations of the id set (`try_create`/`remove`) against
//! `num_blocks`/`for_each_block`, so the observable set is consistent.  It
//! is held only across those call boundaries, never across a block's
//! lifetime.

use std::sync::Arc;
use tracing::error;

mod lock_pool;

use super::{BlockStore2, BlockStoreError, Result};
use crate::blockid::BlockId;
use lock_pool::{BlockLockGuard, LockPool};

// ── Block handle ─────────────────────────────────────────────────────────────

/// A live, exclusively held block.  Owns its buffer and its per-id lease;
/// dropping it flushes dirty data (logging failures) and releases both.
/// Use [`Block::flush`] where the write-back error matters.
pub struct Block {
    store: Arc<dyn BlockStore2>,
    pool: Arc<LockPool>,
    id: BlockId,
    data: Vec<u8>,
    dirty: bool,
    guard: Option<BlockLockGuard>,
}

impl Block {
    fn new(
        store: Arc<dyn BlockStore2>,
        pool: Arc<LockPool>,
        id: BlockId,
        data: Vec<u8>,
        guard: BlockLockGuard,
    ) -> Self {
        Self {
            store,
            pool,
            id,
            data,
            dirty: false,
            guard: Some(guard),
        }
    }

    #[inline]
    pub fn block_id(&self) -> &BlockId {
        &self.id
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Overwrite `source.len()` bytes at `offset`.
    ///
    /// # Panics
    /// If the write would reach outside the current size; `resize` first.
    pub fn write(&mut self, source: &[u8], offset: usize) {
        let end = offset
            .checked_add(source.len())
            .expect("write range overflows");
        assert!(
            end <= self.data.len(),
            "write outside of the valid block area ({end} > {})",
            self.data.len()
        );
        self.data[offset..end].copy_from_slice(source);
        self.dirty = true;
    }

    /// Grow (zero-filled) or shrink the buffer.
    pub fn resize(&mut self, new_size: usize) {
        self.data.resize(new_size, 0);
        self.dirty = true;
    }

    /// Persist dirty data through the flat store.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.store.store(&self.id, &self.data)?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Forget unflushed changes (used when the block is about to be removed).
    fn discard(&mut self) {
        self.dirty = false;
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            error!(block = %self.id, %err, "failed to flush block on drop");
        }
        self.guard.take();
        self.pool.release(&self.id);
    }
}

// ── LockingBlockStore ────────────────────────────────────────────────────────

pub struct LockingBlockStore {
    base: Arc<dyn BlockStore2>,
    pool: Arc<LockPool>,
    structure_lock: parking_lot::Mutex<()>,
}

impl LockingBlockStore {
    pub fn new(base: Box<dyn BlockStore2>) -> Self {
        Self {
            base: Arc::from(base),
            pool: Arc::new(LockPool::default()),
            structure_lock: parking_lot::Mutex::new(()),
        }
    }

    /// Release the per-id lease again without handing out a handle.
    fn abandon_lease(&self, id: &BlockId, guard: BlockLockGuard) {
        drop(guard);
        self.pool.release(id);
    }

    /// Create the block and return a handle, or `None` if the id is taken.
    pub fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<Option<Block>> {
        let guard = self.pool.acquire(id);
        let created = {
            let _structure = self.structure_lock.lock();
            self.base.try_create(id, data)
        };
        match created {
            Ok(true) => Ok(Some(Block::new(
                Arc::clone(&self.base),
                Arc::clone(&self.pool),
                *id,
                data.to_vec(),
                guard,
            ))),
            Ok(false) => {
                self.abandon_lease(id, guard);
                Ok(None)
            }
            Err(err) => {
                self.abandon_lease(id, guard);
                Err(err)
            }
        }
    }

    /// Create or overwrite unconditionally and return a handle.
    pub fn overwrite(&self, id: &BlockId, data: &[u8]) -> Result<Block> {
        let guard = self.pool.acquire(id);
        let stored = {
            let _structure = self.structure_lock.lock();
            self.base.store(id, data)
        };
        if let Err(err) = stored {
            self.abandon_lease(id, guard);
            return Err(err);
        }
        Ok(Block::new(
            Arc::clone(&self.base),
            Arc::clone(&self.pool),
            *id,
            data.to_vec(),
            guard,
        ))
    }

    /// Load a handle; waits if another handle on the same id is live.
    pub fn load(&self, id: &BlockId) -> Result<Option<Block>> {
        let guard = self.pool.acquire(id);
        match self.base.load(id) {
            Ok(Some(data)) => Ok(Some(Block::new(
                Arc::clone(&self.base),
                Arc::clone(&self.pool),
                *id,
                data,
                guard,
            ))),
            Ok(None) => {
                self.abandon_lease(id, guard);
                Ok(None)
            }
            Err(err) => {
                self.abandon_lease(id, guard);
                Err(err)
            }
        }
    }

    /// Create a block under a fresh random id.
    pub fn create(&self, data: &[u8]) -> Result<Block> {
        loop {
            let id = self.base.create_block_id();
            if let Some(block) = self.try_create(&id, data)? {
                return Ok(block);
            }
        }
    }

    /// Remove by id.  Waits for a live handle to be dropped first.
    pub fn remove(&self, id: &BlockId) -> Result<()> {
        let guard = self.pool.acquire(id);
        let removed = {
            let _structure = self.structure_lock.lock();
            self.base.remove(id)
        };
        self.abandon_lease(id, guard);
        if !removed? {
            return Err(BlockStoreError::BlockNotFound(*id));
        }
        Ok(())
    }

    /// Remove a block through its handle, dropping unflushed changes.
    pub fn remove_block(&self, mut block: Block) -> Result<()> {
        block.discard();
        let id = *block.block_id();
        drop(block);
        self.remove(&id)
    }

    pub fn num_blocks(&self) -> Result<u64> {
        let _structure = self.structure_lock.lock();
        self.base.num_blocks()
    }

    pub fn estimate_num_free_bytes(&self) -> Result<u64> {
        self.base.estimate_num_free_bytes()
    }

    /// This layer adds no header.
    pub fn block_size_from_physical_block_size(&self, block_size: u64) -> u64 {
        self.base.block_size_from_physical_block_size(block_size)
    }

    pub fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<()> {
        let _structure = self.structure_lock.lock();
        self.base.for_each_block(callback)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
