//! # blockvault — an encrypting, tamper-evident block store
//!
//! Stores opaque blocks, keyed by 16-byte random ids, inside an untrusted
//! backing directory.  An adversary with full read/write access to the
//! backing store can neither read block contents nor silently tamper with,
//! reorder, delete, or roll back blocks without detection.
//!
//! Core guarantees:
//! - Every block is individually encrypted with an authenticated cipher;
//!   the cipher name lives in the configuration, never in blocks
//! - Every block carries its own id, writer client id and a strictly
//!   increasing version counter inside the authenticated plaintext
//! - Rollbacks, ciphertext swaps between slots, and (in exclusive-client
//!   mode) deletions are detected and reported through a single callback
//! - Detection is sticky: the persisted state refuses the next open until
//!   the operator resets it
//! - All numeric on-disk fields are little-endian; every artifact carries
//!   a format version and unknown versions fail hard
//!
//! The stack is a chain of decorators over one [`store::BlockStore2`]
//! trait; see [`vault::Vault`] for the canonical assembly and the
//! individual `store::*` modules for each layer.

pub mod blockid;
pub mod config;
pub mod crypto;
pub mod local_state;
pub mod store;
pub mod vault;

// Flat re-exports for the most common types.
pub use blockid::BlockId;
pub use config::{ConfigError, VaultConfig, CONFIG_FILE_NAME};
pub use crypto::{Cipher, CipherError, CipherKind, EncryptionKey, ALL_CIPHERS, DEFAULT_CIPHER};
pub use store::compressing::{CompressingBlockStore2, Compressor};
pub use store::encrypted::EncryptedBlockStore2;
pub use store::inmemory::InMemoryBlockStore2;
pub use store::integrity::known_versions::KnownBlockVersions;
pub use store::integrity::{IntegrityBlockStore2, IntegrityConfig};
pub use store::locking::{Block, LockingBlockStore};
pub use store::ondisk::OnDiskBlockStore2;
pub use store::readonly::ReadOnlyBlockStore2;
pub use store::{BlockStore2, BlockStoreError};
pub use vault::{Vault, VaultError, VaultOptions};
