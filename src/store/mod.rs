//! The flat block-store contract and the decorator stack built on it.
//!
//! Every layer implements [`BlockStore2`]: a stateless request/response
//! interface mapping a 16-byte [`BlockId`] to a byte buffer.  Wrappers own
//! their inner store as `Box<dyn BlockStore2>` and forward through it; the
//! single dynamic dispatch point sits at the top of the stack.
//!
//! # Composition rules
//!
//! - Identifiers are opaque; no layer derives meaning from their bits.
//! - `num_blocks` and `for_each_block` are forwarded verbatim (the
//!   integrity layer may *check* the enumeration but never filters it).
//! - `block_size_from_physical_block_size` composes as
//!   `max(0, inner(physical) - header_size)` per layer.
//! - `load` returning `Ok(None)` is deliberately overloaded: not found,
//!   authentication failure, or a rejected version all surface the same
//!   way.  The integrity-violation callback is the authoritative signal;
//!   I/O and unknown-format errors are hard `Err`s instead.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::blockid::BlockId;
use crate::crypto::CipherError;

pub mod compressing;
pub mod encrypted;
pub mod inmemory;
pub mod integrity;
pub mod locking;
pub mod ondisk;
pub mod readonly;

pub use integrity::known_versions::StateFileError;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum BlockStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Tampering observed: rollback, re-bound id, missing expected block.
    /// Also carried in the callback passed to the integrity layer.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// The state file recorded a violation on an earlier run.  The store
    /// refuses to open until the operator resets the flag.
    #[error("the integrity state file {path} records a violation from a previous run; refusing to open until it is reset")]
    IntegrityViolationOnPreviousRun { path: PathBuf },

    /// The artifact carries a format version this build does not know.
    /// Almost always means it was written by a newer release.
    #[error("unsupported format version {found} (this build handles {supported}) — was the store written by a newer release?")]
    UnsupportedFormatVersion { found: String, supported: String },

    #[error("not a valid block file")]
    InvalidBlockFile,

    /// A per-(client, block) version counter would wrap.  Unreachable
    /// outside pathological inputs; treated as fatal.
    #[error("block version counter overflow")]
    VersionOverflow,

    #[error("store is read-only")]
    ReadOnly,

    #[error("block {0} not found")]
    BlockNotFound(BlockId),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    StateFile(#[from] StateFileError),
}

pub type Result<T> = std::result::Result<T, BlockStoreError>;

// ── The flat contract ────────────────────────────────────────────────────────

/// Flat, byte-oriented block store.  All methods take `&self`; every
/// implementation is safe under arbitrary interleaving of OS threads.
pub trait BlockStore2: Send + Sync {
    /// Generate an id for a new block: 16 uniformly random bytes.
    fn create_block_id(&self) -> BlockId {
        BlockId::random()
    }

    /// Atomically create the block.  Returns `Ok(false)` iff a block with
    /// this id already exists.
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool>;

    /// Returns `Ok(true)` iff a block was removed.
    fn remove(&self, id: &BlockId) -> Result<bool>;

    /// `Ok(None)` iff the block does not exist — or could not be trusted;
    /// see the module doc for the overloading rules.
    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite unconditionally.
    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()>;

    fn num_blocks(&self) -> Result<u64>;

    fn estimate_num_free_bytes(&self) -> Result<u64>;

    /// Inverse of this layer's header overhead: the logical block size that
    /// fits into `block_size` physical bytes.  Returns `0` if the physical
    /// size cannot even hold the headers.
    fn block_size_from_physical_block_size(&self, block_size: u64) -> u64;

    /// Invoke `callback` for every block currently stored.  Callbacks run
    /// on the calling thread.
    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<()>;

    /// Create a block under a fresh random id and return the id.
    /// Retries on the (negligible) chance of a collision.
    fn create(&self, data: &[u8]) -> Result<BlockId> {
        loop {
            let id = self.create_block_id();
            if self.try_create(&id, data)? {
                return Ok(id);
            }
        }
    }
}

/// Shared handles forward the contract; lets tests and the locking layer
/// keep a second reference to an inner store.
impl<T: BlockStore2 + ?Sized> BlockStore2 for Arc<T> {
    fn create_block_id(&self) -> BlockId {
        (**self).create_block_id()
    }
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool> {
        (**self).try_create(id, data)
    }
    fn remove(&self, id: &BlockId) -> Result<bool> {
        (**self).remove(id)
    }
    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        (**self).load(id)
    }
    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        (**self).store(id, data)
    }
    fn num_blocks(&self) -> Result<u64> {
        (**self).num_blocks()
    }
    fn estimate_num_free_bytes(&self) -> Result<u64> {
        (**self).estimate_num_free_bytes()
    }
    fn block_size_from_physical_block_size(&self, block_size: u64) -> u64 {
        (**self).block_size_from_physical_block_size(block_size)
    }
    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<()> {
        (**self).for_each_block(callback)
    }
    fn create(&self, data: &[u8]) -> Result<BlockId> {
        (**self).create(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::inmemory::InMemoryBlockStore2;

    #[test]
    fn create_retries_until_free_id() {
        // `create` must succeed even when the store already holds blocks.
        let store = InMemoryBlockStore2::new();
        for _ in 0..32 {
            store.create(b"payload").unwrap();
        }
        assert_eq!(store.num_blocks().unwrap(), 32);
    }

    #[test]
    fn arc_forwarding() {
        let store = Arc::new(InMemoryBlockStore2::new());
        let id = store.create(b"x").unwrap();
        let other = Arc::clone(&store);
        assert_eq!(other.load(&id).unwrap().unwrap(), b"x");
    }
}
