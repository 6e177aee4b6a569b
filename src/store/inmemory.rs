//! In-memory backend — a hash map behind a mutex.
//!
//! Exists for tests and small mounts.  Knows nothing of encryption or
//! integrity; it is the innermost layer of a purely volatile stack.

use parking_lot::Mutex;
use std::collections::HashMap;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use super::{BlockStore2, Result};
use crate::blockid::BlockId;

#[derive(Default)]
pub struct InMemoryBlockStore2 {
    blocks: Mutex<HashMap<BlockId, Vec<u8>>>,
}

impl InMemoryBlockStore2 {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore2 for InMemoryBlockStore2 {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool> {
        let mut blocks = self.blocks.lock();
        if blocks.contains_key(id) {
            return Ok(false);
        }
        blocks.insert(*id, data.to_vec());
        Ok(true)
    }

    fn remove(&self, id: &BlockId) -> Result<bool> {
        Ok(self.blocks.lock().remove(id).is_some())
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        Ok(self.blocks.lock().get(id).cloned())
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        self.blocks.lock().insert(*id, data.to_vec());
        Ok(())
    }

    fn num_blocks(&self) -> Result<u64> {
        Ok(self.blocks.lock().len() as u64)
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        // Heuristic: total system memory.
        let sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        Ok(sys.total_memory())
    }

    fn block_size_from_physical_block_size(&self, block_size: u64) -> u64 {
        block_size
    }

    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<()> {
        // Snapshot the ids so callbacks may touch the store.
        let ids: Vec<BlockId> = self.blocks.lock().keys().copied().collect();
        for id in &ids {
            callback(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn roundtrip() {
        let store = InMemoryBlockStore2::new();
        let id = BlockId::random();
        store.store(&id, b"hello").unwrap();
        assert_eq!(store.load(&id).unwrap().unwrap(), b"hello");
    }

    #[test]
    fn load_missing_is_none() {
        let store = InMemoryBlockStore2::new();
        assert_eq!(store.load(&BlockId::random()).unwrap(), None);
    }

    #[test]
    fn try_create_fails_on_existing_id() {
        let store = InMemoryBlockStore2::new();
        let id = BlockId::random();
        assert!(store.try_create(&id, b"first").unwrap());
        assert!(!store.try_create(&id, b"second").unwrap());
        assert_eq!(store.load(&id).unwrap().unwrap(), b"first");
    }

    #[test]
    fn store_overwrites() {
        let store = InMemoryBlockStore2::new();
        let id = BlockId::random();
        store.store(&id, b"one").unwrap();
        store.store(&id, b"two").unwrap();
        assert_eq!(store.load(&id).unwrap().unwrap(), b"two");
    }

    #[test]
    fn remove_reports_whether_block_existed() {
        let store = InMemoryBlockStore2::new();
        let id = BlockId::random();
        store.store(&id, b"x").unwrap();
        assert!(store.remove(&id).unwrap());
        assert!(!store.remove(&id).unwrap());
        assert_eq!(store.load(&id).unwrap(), None);
    }

    #[test]
    fn enumeration_matches_num_blocks() {
        let store = InMemoryBlockStore2::new();
        let mut created = HashSet::new();
        for _ in 0..10 {
            created.insert(store.create(b"payload").unwrap());
        }
        let mut seen = HashSet::new();
        store
            .for_each_block(&mut |id| {
                seen.insert(*id);
            })
            .unwrap();
        assert_eq!(seen, created);
        assert_eq!(store.num_blocks().unwrap(), 10);
    }

    #[test]
    fn physical_size_is_logical_size() {
        let store = InMemoryBlockStore2::new();
        assert_eq!(store.block_size_from_physical_block_size(4096), 4096);
    }
}
