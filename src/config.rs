//! Vault configuration — the operator-facing JSON file.
//!
//! Carries the values the block layer consumes at construction: the cipher
//! name, the 16-byte filesystem id (unrelated to block ids) and the
//! optional exclusive client id.  Key material is **never** part of this
//! file; callers derive or supply it separately.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{CipherError, CipherKind};

/// Bumped whenever a released build changes the config schema.
pub const CONFIG_FORMAT_VERSION: u32 = 1;

/// Default file name inside the vault root.  Outside the block-id grammar,
/// so enumeration never mistakes it for a block.
pub const CONFIG_FILE_NAME: &str = "vault.config";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed configuration file: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("configuration format version {0} is not supported (this build handles {CONFIG_FORMAT_VERSION}) — written by a newer release?")]
    UnsupportedVersion(u32),
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub format_version: u32,
    /// Stable cipher name, e.g. `aes-256-gcm`.
    pub cipher: String,
    /// Identifies the vault itself; used e.g. as the KDF salt.
    pub filesystem_id: Uuid,
    /// When set, only this client is expected to write; enables
    /// missing-block detection in the integrity layer.
    #[serde(default)]
    pub exclusive_client_id: Option<u32>,
}

impl VaultConfig {
    pub fn new(cipher: CipherKind) -> Self {
        Self {
            format_version: CONFIG_FORMAT_VERSION,
            cipher: cipher.name().to_owned(),
            filesystem_id: Uuid::new_v4(),
            exclusive_client_id: None,
        }
    }

    /// Parse and validate: version must be known, cipher name resolvable.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read(path)?;
        let config: Self = serde_json::from_slice(&content)?;
        if config.format_version > CONFIG_FORMAT_VERSION {
            return Err(ConfigError::UnsupportedVersion(config.format_version));
        }
        config.cipher_kind()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_vec_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn cipher_kind(&self) -> Result<CipherKind, ConfigError> {
        Ok(CipherKind::from_name(&self.cipher)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = VaultConfig::new(CipherKind::XChaCha20Poly1305);
        config.exclusive_client_id = Some(42);
        config.save(&path).unwrap();

        let loaded = VaultConfig::load(&path).unwrap();
        assert_eq!(loaded.cipher, "xchacha20-poly1305");
        assert_eq!(loaded.filesystem_id, config.filesystem_id);
        assert_eq!(loaded.exclusive_client_id, Some(42));
        assert_eq!(loaded.cipher_kind().unwrap(), CipherKind::XChaCha20Poly1305);
    }

    #[test]
    fn unknown_cipher_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = VaultConfig::new(CipherKind::Aes256Gcm);
        config.cipher = "rot13".to_owned();
        config.save(&path).unwrap();

        assert!(matches!(
            VaultConfig::load(&path),
            Err(ConfigError::Cipher(_))
        ));
    }

    #[test]
    fn newer_format_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = VaultConfig::new(CipherKind::Aes256Gcm);
        config.format_version = CONFIG_FORMAT_VERSION + 1;
        config.save(&path).unwrap();

        assert!(matches!(
            VaultConfig::load(&path),
            Err(ConfigError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn missing_exclusive_client_id_defaults_to_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let json = format!(
            r#"{{"format_version":1,"cipher":"aes-256-gcm","filesystem_id":"{}"}}"#,
            Uuid::new_v4()
        );
        fs::write(&path, json).unwrap();
        assert_eq!(VaultConfig::load(&path).unwrap().exclusive_client_id, None);
    }
}
