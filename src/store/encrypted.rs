//! Encryption layer — authenticated encryption plus a format header.
//!
//! # On-backend layout
//!
//! ```text
//! Offset  Size  Field
//!    0      2   format_version = 1  (LE u16; 0 is the legacy variant)
//!    2      N   Cipher::encrypt(plaintext)  — nonce/IV + ciphertext (+ tag)
//! ```
//!
//! The legacy variant (version 0) additionally prepended the 16-byte block
//! id to the *plaintext*; on read it is verified against the requested id
//! and stripped.  Legacy blocks are not rewritten here — the integrity
//! layer above migrates its own legacy header in the same pass and writes
//! the block back through the full stack.
//!
//! An unknown format version is a hard error (the store was written by a
//! newer release); a failed authentication tag is logged and surfaced as
//! "block not found".

use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;

use super::{BlockStore2, BlockStoreError, Result};
use crate::blockid::{BlockId, BLOCK_ID_LEN};
use crate::crypto::Cipher;

const FORMAT_VERSION_HEADER: u16 = 1;
const FORMAT_VERSION_HEADER_OLD: u16 = 0;
const HEADER_SIZE: usize = 2;

pub struct EncryptedBlockStore2 {
    base: Box<dyn BlockStore2>,
    cipher: Cipher,
}

impl EncryptedBlockStore2 {
    pub fn new(base: Box<dyn BlockStore2>, cipher: Cipher) -> Self {
        Self { base, cipher }
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = self.cipher.encrypt(data)?;
        let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        out.extend_from_slice(&FORMAT_VERSION_HEADER.to_le_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn try_decrypt(&self, id: &BlockId, data: &[u8]) -> Result<Option<Vec<u8>>> {
        if data.len() < HEADER_SIZE {
            warn!(block = %id, "block too short to carry an encryption header");
            return Ok(None);
        }
        let format_version = LittleEndian::read_u16(&data[..HEADER_SIZE]);
        if format_version != FORMAT_VERSION_HEADER && format_version != FORMAT_VERSION_HEADER_OLD {
            return Err(BlockStoreError::UnsupportedFormatVersion {
                found: format_version.to_string(),
                supported: FORMAT_VERSION_HEADER.to_string(),
            });
        }

        let decrypted = match self.cipher.decrypt(&data[HEADER_SIZE..]) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(block = %id, %err, "failed to decrypt block");
                return Ok(None);
            }
        };

        if format_version == FORMAT_VERSION_HEADER_OLD {
            // Legacy plaintext carries the block id as a prefix.
            if decrypted.len() < BLOCK_ID_LEN
                || decrypted[..BLOCK_ID_LEN] != *id.as_bytes()
            {
                warn!(block = %id, "legacy block carries a wrong embedded id");
                return Ok(None);
            }
            return Ok(Some(decrypted[BLOCK_ID_LEN..].to_vec()));
        }

        Ok(Some(decrypted))
    }

    #[cfg(test)]
    pub(crate) fn set_key(&mut self, key: crate::crypto::EncryptionKey) {
        self.cipher.set_key(key);
    }
}

impl BlockStore2 for EncryptedBlockStore2 {
    fn create_block_id(&self) -> BlockId {
        self.base.create_block_id()
    }

    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool> {
        let encrypted = self.encrypt(data)?;
        self.base.try_create(id, &encrypted)
    }

    fn remove(&self, id: &BlockId) -> Result<bool> {
        self.base.remove(id)
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        match self.base.load(id)? {
            None => Ok(None),
            Some(loaded) => self.try_decrypt(id, &loaded),
        }
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        let encrypted = self.encrypt(data)?;
        self.base.store(id, &encrypted)
    }

    fn num_blocks(&self) -> Result<u64> {
        self.base.num_blocks()
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        self.base.estimate_num_free_bytes()
    }

    fn block_size_from_physical_block_size(&self, block_size: u64) -> u64 {
        let base_size = self.base.block_size_from_physical_block_size(block_size);
        let header_and_overhead = HEADER_SIZE as u64 + self.cipher.ciphertext_size(0);
        if base_size <= header_and_overhead {
            return 0;
        }
        self.cipher.plaintext_size(base_size - HEADER_SIZE as u64)
    }

    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<()> {
        self.base.for_each_block(callback)
    }
}
