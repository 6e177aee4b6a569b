//! High-level [`Vault`] API — the primary embedding surface.
//!
//! Assembles the canonical store stack over a directory of encrypted
//! blocks:
//!
//! ```text
//!     caller (blob layer, tests, CLI)
//!           │
//!     LockingBlockStore      per-block leases, buffered handles
//!     IntegrityBlockStore2   version counters, tamper detection
//!     EncryptedBlockStore2   authenticated encryption
//!     OnDiskBlockStore2      one file per block under the vault root
//! ```
//!
//! The untrusted side is `basedir` (safe to sync to hostile storage); the
//! trusted side is `state_dir`, which holds the client id and the
//! per-vault integrity state and must live on local, private storage.

use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::config::{ConfigError, VaultConfig, CONFIG_FILE_NAME};
use crate::crypto::{Cipher, EncryptionKey};
use crate::local_state::{self, LocalStateError};
use crate::store::encrypted::EncryptedBlockStore2;
use crate::store::integrity::{IntegrityBlockStore2, IntegrityConfig, IntegrityViolationCallback};
use crate::store::locking::LockingBlockStore;
use crate::store::ondisk::OnDiskBlockStore2;
use crate::store::BlockStoreError;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    LocalState(#[from] LocalStateError),
    #[error(transparent)]
    BlockStore(#[from] BlockStoreError),
}

/// Mount-time options not persisted in the configuration.
pub struct VaultOptions {
    /// Operator recovery mode: report violations as warnings and keep
    /// serving data.
    pub allow_integrity_violations: bool,
    /// Invoked on tampering; in a mounted filesystem this unmounts.
    pub on_integrity_violation: IntegrityViolationCallback,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            allow_integrity_violations: false,
            on_integrity_violation: Box::new(|_| {}),
        }
    }
}

pub struct Vault {
    store: LockingBlockStore,
    config: VaultConfig,
    my_client_id: u32,
}

impl Vault {
    /// Initialize a new vault: write the configuration into `basedir` and
    /// open the (empty) store.
    pub fn create(
        basedir: &Path,
        state_dir: &Path,
        config: VaultConfig,
        key: EncryptionKey,
        options: VaultOptions,
    ) -> Result<Self, VaultError> {
        fs::create_dir_all(basedir).map_err(BlockStoreError::Io)?;
        config.save(&basedir.join(CONFIG_FILE_NAME))?;
        Self::build(basedir, state_dir, config, key, options)
    }

    /// Open an existing vault using the configuration found in `basedir`.
    pub fn open(
        basedir: &Path,
        state_dir: &Path,
        key: EncryptionKey,
        options: VaultOptions,
    ) -> Result<Self, VaultError> {
        let config = VaultConfig::load(&basedir.join(CONFIG_FILE_NAME))?;
        Self::build(basedir, state_dir, config, key, options)
    }

    fn build(
        basedir: &Path,
        state_dir: &Path,
        config: VaultConfig,
        key: EncryptionKey,
        options: VaultOptions,
    ) -> Result<Self, VaultError> {
        let cipher = Cipher::new(config.cipher_kind()?, key).map_err(BlockStoreError::Cipher)?;
        let my_client_id = local_state::load_or_generate_client_id(state_dir)?;

        let ondisk = OnDiskBlockStore2::new(basedir.to_path_buf());
        let encrypted = EncryptedBlockStore2::new(Box::new(ondisk), cipher);
        let integrity = IntegrityBlockStore2::new(
            Box::new(encrypted),
            Self::integrity_state_path(state_dir, &config),
            my_client_id,
            IntegrityConfig {
                allow_integrity_violations: options.allow_integrity_violations,
                missing_block_is_integrity_violation: config.exclusive_client_id.is_some(),
                on_integrity_violation: options.on_integrity_violation,
            },
        )?;

        Ok(Self {
            store: LockingBlockStore::new(Box::new(integrity)),
            config,
            my_client_id,
        })
    }

    fn integrity_state_path(state_dir: &Path, config: &VaultConfig) -> std::path::PathBuf {
        state_dir.join(format!(
            "integrity-{}.state",
            config.filesystem_id.simple()
        ))
    }

    #[inline]
    pub fn block_store(&self) -> &LockingBlockStore {
        &self.store
    }

    #[inline]
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    #[inline]
    pub fn my_client_id(&self) -> u32 {
        self.my_client_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherKind, DEFAULT_CIPHER};
    use tempfile::TempDir;

    struct Dirs {
        _root: TempDir,
        basedir: std::path::PathBuf,
        state_dir: std::path::PathBuf,
    }

    fn dirs() -> Dirs {
        let root = TempDir::new().unwrap();
        let basedir = root.path().join("vault");
        let state_dir = root.path().join("state");
        Dirs {
            _root: root,
            basedir,
            state_dir,
        }
    }

    #[test]
    fn blocks_survive_reopen() {
        let dirs = dirs();
        let key = EncryptionKey::generate(32);

        let id = {
            let vault = Vault::create(
                &dirs.basedir,
                &dirs.state_dir,
                VaultConfig::new(DEFAULT_CIPHER),
                key.clone(),
                VaultOptions::default(),
            )
            .unwrap();
            let block = vault.block_store().create(b"persistent payload").unwrap();
            *block.block_id()
        };

        let vault = Vault::open(
            &dirs.basedir,
            &dirs.state_dir,
            key,
            VaultOptions::default(),
        )
        .unwrap();
        let block = vault.block_store().load(&id).unwrap().unwrap();
        assert_eq!(block.data(), b"persistent payload");
    }

    #[test]
    fn wrong_key_reads_nothing() {
        let dirs = dirs();
        let id = {
            let vault = Vault::create(
                &dirs.basedir,
                &dirs.state_dir,
                VaultConfig::new(DEFAULT_CIPHER),
                EncryptionKey::generate(32),
                VaultOptions::default(),
            )
            .unwrap();
            *vault.block_store().create(b"secret").unwrap().block_id()
        };

        let vault = Vault::open(
            &dirs.basedir,
            &dirs.state_dir,
            EncryptionKey::generate(32),
            VaultOptions::default(),
        )
        .unwrap();
        assert!(vault.block_store().load(&id).unwrap().is_none());
    }

    #[test]
    fn client_id_is_stable_across_reopens() {
        let dirs = dirs();
        let key = EncryptionKey::generate(32);
        let first = Vault::create(
            &dirs.basedir,
            &dirs.state_dir,
            VaultConfig::new(DEFAULT_CIPHER),
            key.clone(),
            VaultOptions::default(),
        )
        .unwrap()
        .my_client_id();
        let second = Vault::open(
            &dirs.basedir,
            &dirs.state_dir,
            key,
            VaultOptions::default(),
        )
        .unwrap()
        .my_client_id();
        assert_eq!(first, second);
    }

    #[test]
    fn key_length_must_match_cipher() {
        let dirs = dirs();
        let result = Vault::create(
            &dirs.basedir,
            &dirs.state_dir,
            VaultConfig::new(CipherKind::Aes128Gcm),
            EncryptionKey::generate(32),
            VaultOptions::default(),
        );
        assert!(matches!(
            result,
            Err(VaultError::BlockStore(BlockStoreError::Cipher(_)))
        ));
    }
}
