//! Read-only guard.
//!
//! Wraps another block store and rejects every mutation with
//! [`BlockStoreError::ReadOnly`] while passing reads through.  Used to
//! protect a store in modes that must not write, e.g. inspection after
//! suspected corruption.

use super::{BlockStore2, BlockStoreError, Result};
use crate::blockid::BlockId;

pub struct ReadOnlyBlockStore2 {
    base: Box<dyn BlockStore2>,
}

impl ReadOnlyBlockStore2 {
    pub fn new(base: Box<dyn BlockStore2>) -> Self {
        Self { base }
    }
}

impl BlockStore2 for ReadOnlyBlockStore2 {
    fn create_block_id(&self) -> BlockId {
        self.base.create_block_id()
    }

    fn try_create(&self, _id: &BlockId, _data: &[u8]) -> Result<bool> {
        Err(BlockStoreError::ReadOnly)
    }

    fn remove(&self, _id: &BlockId) -> Result<bool> {
        Err(BlockStoreError::ReadOnly)
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        self.base.load(id)
    }

    fn store(&self, _id: &BlockId, _data: &[u8]) -> Result<()> {
        Err(BlockStoreError::ReadOnly)
    }

    fn num_blocks(&self) -> Result<u64> {
        self.base.num_blocks()
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        self.base.estimate_num_free_bytes()
    }

    fn block_size_from_physical_block_size(&self, block_size: u64) -> u64 {
        self.base.block_size_from_physical_block_size(block_size)
    }

    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<()> {
        self.base.for_each_block(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::inmemory::InMemoryBlockStore2;
    use std::sync::Arc;

    #[test]
    fn reads_pass_through() {
        let base = Arc::new(InMemoryBlockStore2::new());
        let id = base.create(b"existing").unwrap();
        let store = ReadOnlyBlockStore2::new(Box::new(Arc::clone(&base)));

        assert_eq!(store.load(&id).unwrap().unwrap(), b"existing");
        assert_eq!(store.num_blocks().unwrap(), 1);
        let mut seen = 0;
        store.for_each_block(&mut |_| seen += 1).unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn mutations_are_rejected() {
        let base = Arc::new(InMemoryBlockStore2::new());
        let id = base.create(b"existing").unwrap();
        let store = ReadOnlyBlockStore2::new(Box::new(Arc::clone(&base)));

        assert!(matches!(
            store.store(&id, b"nope"),
            Err(BlockStoreError::ReadOnly)
        ));
        assert!(matches!(
            store.try_create(&BlockId::random(), b"nope"),
            Err(BlockStoreError::ReadOnly)
        ));
        assert!(matches!(store.remove(&id), Err(BlockStoreError::ReadOnly)));
        // The underlying block is untouched.
        assert_eq!(base.load(&id).unwrap().unwrap(), b"existing");
    }
}
