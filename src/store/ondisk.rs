//! On-disk backend — one file per block.
//!
//! # Layout
//!
//! ```text
//! <rootdir>/
//!   <3 uppercase hex chars>/
//!     <29 uppercase hex chars>     ← one file per block
//! ```
//!
//! The two-level split keeps any one directory small.  Directory and file
//! names outside the hex grammar are skipped by enumeration, so unrelated
//! files (e.g. the vault configuration at the root) never surface as
//! blocks.
//!
//! # File format
//!
//! A fixed ASCII header `cryfs;block;0` followed by one NUL byte (14 bytes
//! total), then the opaque payload.  A file carrying the `cryfs;block;`
//! prefix with a different version character was written by a newer release
//! and is a hard error; anything else is not a valid block file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{BlockStore2, BlockStoreError, Result};
use crate::blockid::{BlockId, BLOCK_ID_STRING_LEN};

/// Shared prefix of every supported and future file header.
const FORMAT_VERSION_HEADER_PREFIX: &[u8] = b"cryfs;block;";

/// The exact header this build reads and writes (including the NUL).
const FORMAT_VERSION_HEADER: &[u8] = b"cryfs;block;0\0";

/// Directory-name length: first 3 hex chars of the id.
const PREFIX_LEN: usize = 3;

/// File-name length: remaining 29 hex chars.
const POSTFIX_LEN: usize = BLOCK_ID_STRING_LEN - PREFIX_LEN;

fn is_uppercase_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

pub struct OnDiskBlockStore2 {
    root_dir: PathBuf,
}

impl OnDiskBlockStore2 {
    pub fn new(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    #[inline]
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// `rootdir/ID[0..3]/ID[3..32]`, uppercase hex.
    pub fn block_path(&self, id: &BlockId) -> PathBuf {
        let hex = id.to_hex();
        self.root_dir.join(&hex[..PREFIX_LEN]).join(&hex[PREFIX_LEN..])
    }

    fn check_and_strip_header(mut content: Vec<u8>) -> Result<Vec<u8>> {
        if content.starts_with(FORMAT_VERSION_HEADER) {
            content.drain(..FORMAT_VERSION_HEADER.len());
            return Ok(content);
        }
        if content.starts_with(FORMAT_VERSION_HEADER_PREFIX) {
            return Err(BlockStoreError::UnsupportedFormatVersion {
                found: String::from_utf8_lossy(
                    &content[FORMAT_VERSION_HEADER_PREFIX.len()
                        ..content.len().min(FORMAT_VERSION_HEADER.len() - 1)],
                )
                .into_owned(),
                supported: "0".to_owned(),
            });
        }
        Err(BlockStoreError::InvalidBlockFile)
    }
}

impl BlockStore2 for OnDiskBlockStore2 {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool> {
        if self.block_path(id).exists() {
            return Ok(false);
        }
        self.store(id, data)?;
        Ok(true)
    }

    fn remove(&self, id: &BlockId) -> Result<bool> {
        let path = self.block_path(id);
        if !path.is_file() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        // Drop the prefix directory once its last block is gone; ignore
        // races with concurrent creates.
        if let Some(parent) = path.parent() {
            let _ = fs::remove_dir(parent);
        }
        Ok(true)
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        match fs::read(self.block_path(id)) {
            Ok(content) => Ok(Some(Self::check_and_strip_header(content)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        let path = self.block_path(id);
        fs::create_dir_all(path.parent().expect("block path always has a parent"))?;
        let mut content = Vec::with_capacity(FORMAT_VERSION_HEADER.len() + data.len());
        content.extend_from_slice(FORMAT_VERSION_HEADER);
        content.extend_from_slice(data);
        fs::write(&path, content)?;
        Ok(())
    }

    fn num_blocks(&self) -> Result<u64> {
        let mut count = 0u64;
        self.for_each_block(&mut |_| count += 1)?;
        Ok(count)
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        Ok(fs2::available_space(&self.root_dir)?)
    }

    fn block_size_from_physical_block_size(&self, block_size: u64) -> u64 {
        block_size.saturating_sub(FORMAT_VERSION_HEADER.len() as u64)
    }

    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<()> {
        for prefix_entry in fs::read_dir(&self.root_dir)? {
            let prefix_entry = prefix_entry?;
            if !prefix_entry.file_type()?.is_dir() {
                continue;
            }
            let prefix = prefix_entry.file_name();
            let Some(prefix) = prefix.to_str() else {
                continue;
            };
            if prefix.len() != PREFIX_LEN || !is_uppercase_hex(prefix) {
                continue;
            }

            for block_entry in fs::read_dir(prefix_entry.path())? {
                let block_entry = block_entry?;
                if !block_entry.file_type()?.is_file() {
                    continue;
                }
                let postfix = block_entry.file_name();
                let Some(postfix) = postfix.to_str() else {
                    continue;
                };
                if postfix.len() != POSTFIX_LEN || !is_uppercase_hex(postfix) {
                    continue;
                }

                let id = BlockId::from_hex(&format!("{prefix}{postfix}"))
                    .expect("grammar checked above");
                callback(&id);
            }
        }
        Ok(())
    }
}
