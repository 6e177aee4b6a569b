//! Block identifiers — the primary key of the block layer.
//!
//! A [`BlockId`] is 16 opaque bytes, uniformly random.  Canonical string
//! form is 32 uppercase hex characters.  Equality and hashing are byte-wise;
//! no layer may interpret the bits.  With 128 bits of randomness, collisions
//! on creation are negligible and handled by a retry loop anyway.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;

/// Binary length of a block id.
pub const BLOCK_ID_LEN: usize = 16;

/// Length of the canonical hex string form.
pub const BLOCK_ID_STRING_LEN: usize = 2 * BLOCK_ID_LEN;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BlockIdError {
    #[error("block id string has length {0}, expected {BLOCK_ID_STRING_LEN}")]
    WrongLength(usize),
    #[error("block id string contains a non-hex character")]
    InvalidHex,
}

/// 16-byte opaque block identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId([u8; BLOCK_ID_LEN]);

impl BlockId {
    /// Generate a fresh id from 16 uniformly random bytes.
    pub fn random() -> Self {
        let mut bytes = [0u8; BLOCK_ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub const fn from_bytes(bytes: [u8; BLOCK_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice; fails unless it is exactly 16 bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; BLOCK_ID_LEN] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; BLOCK_ID_LEN] {
        &self.0
    }

    /// Canonical form: 32 uppercase hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Parse the canonical hex form.  Lowercase input is accepted.
    pub fn from_hex(s: &str) -> Result<Self, BlockIdError> {
        if s.len() != BLOCK_ID_STRING_LEN {
            return Err(BlockIdError::WrongLength(s.len()));
        }
        let bytes = hex::decode(s).map_err(|_| BlockIdError::InvalidHex)?;
        let bytes: [u8; BLOCK_ID_LEN] = bytes.try_into().expect("length checked above");
        Ok(Self(bytes))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.to_hex())
    }
}
