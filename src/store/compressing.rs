//! Compression layer — optional, transparent to every other layer.
//!
//! # On-backend layout
//!
//! ```text
//! Offset  Size  Field
//!    0      1   compressor tag   0=none 1=zstd 2=lz4 3=brotli
//!    1      N   compressed payload
//! ```
//!
//! The tag is authoritative on read: blocks written with a different
//! compressor than the currently configured one still decode.  An unknown
//! tag means the store was written by a newer release and is a hard error.
//!
//! `block_size_from_physical_block_size` only subtracts the tag byte.  We
//! probably fit more since we compress, but we cannot know how much, so
//! the compression gain is ignored.

use std::io::Cursor;
use tracing::warn;

use super::{BlockStore2, BlockStoreError, Result};
use crate::blockid::BlockId;

const HEADER_SIZE: usize = 1;

// ── Compressor ───────────────────────────────────────────────────────────────

/// Closed set of payload compressors.  The tag byte is the serialization
/// contract; a tag is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    /// Payload stored verbatim.
    None,
    /// Balanced speed/ratio (default).
    Zstd,
    /// Maximum throughput, lower ratio.
    Lz4,
    /// High ratio, slow; suits rarely-written stores.
    Brotli,
}

impl Compressor {
    pub fn tag(self) -> u8 {
        match self {
            Compressor::None => 0,
            Compressor::Zstd => 1,
            Compressor::Lz4 => 2,
            Compressor::Brotli => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Compressor::None),
            1 => Some(Compressor::Zstd),
            2 => Some(Compressor::Lz4),
            3 => Some(Compressor::Brotli),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Compressor::None => "none",
            Compressor::Zstd => "zstd",
            Compressor::Lz4 => "lz4",
            Compressor::Brotli => "brotli",
        }
    }

    fn compress(self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Compressor::None => Ok(data.to_vec()),
            Compressor::Zstd => zstd::encode_all(data, 0),
            Compressor::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Compressor::Brotli => {
                let mut out = Vec::new();
                let params = brotli::enc::BrotliEncoderParams::default();
                brotli::BrotliCompress(&mut Cursor::new(data), &mut out, &params)?;
                Ok(out)
            }
        }
    }

    fn decompress(self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Compressor::None => Ok(data.to_vec()),
            Compressor::Zstd => zstd::decode_all(data),
            Compressor::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Compressor::Brotli => {
                let mut out = Vec::new();
                brotli::BrotliDecompress(&mut Cursor::new(data), &mut out)?;
                Ok(out)
            }
        }
    }
}

// ── CompressingBlockStore2 ───────────────────────────────────────────────────

pub struct CompressingBlockStore2 {
    base: Box<dyn BlockStore2>,
    compressor: Compressor,
}

impl CompressingBlockStore2 {
    pub fn new(base: Box<dyn BlockStore2>, compressor: Compressor) -> Self {
        Self { base, compressor }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.compressor.compress(data)?;
        let mut out = Vec::with_capacity(HEADER_SIZE + compressed.len());
        out.push(self.compressor.tag());
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    fn decompress(&self, id: &BlockId, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some((&tag, payload)) = data.split_first() else {
            warn!(block = %id, "compressed block is empty");
            return Ok(None);
        };
        let Some(compressor) = Compressor::from_tag(tag) else {
            return Err(BlockStoreError::UnsupportedFormatVersion {
                found: format!("compressor tag {tag}"),
                supported: "tags 0-3".to_owned(),
            });
        };
        match compressor.decompress(payload) {
            Ok(decompressed) => Ok(Some(decompressed)),
            Err(err) => {
                warn!(block = %id, %err, "failed to decompress block");
                Ok(None)
            }
        }
    }
}

impl BlockStore2 for CompressingBlockStore2 {
    fn create_block_id(&self) -> BlockId {
        self.base.create_block_id()
    }

    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool> {
        let compressed = self.compress(data)?;
        self.base.try_create(id, &compressed)
    }

    fn remove(&self, id: &BlockId) -> Result<bool> {
        self.base.remove(id)
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        match self.base.load(id)? {
            None => Ok(None),
            Some(loaded) => self.decompress(id, &loaded),
        }
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        let compressed = self.compress(data)?;
        self.base.store(id, &compressed)
    }

    fn num_blocks(&self) -> Result<u64> {
        self.base.num_blocks()
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        self.base.estimate_num_free_bytes()
    }

    fn block_size_from_physical_block_size(&self, block_size: u64) -> u64 {
        self.base
            .block_size_from_physical_block_size(block_size)
            .saturating_sub(HEADER_SIZE as u64)
    }

    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<()> {
        self.base.for_each_block(callback)
    }
}
