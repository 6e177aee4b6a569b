//! Symmetric ciphers for block encryption.
//!
//! Algorithms are identified by stable string names; the name is persisted
//! in the vault configuration, never in individual blocks.  The selected
//! algorithm and the key are fixed at construction of a [`Cipher`].
//!
//! # Encrypted payload layout
//!
//! ```text
//! AEAD modes:  [ nonce (12 B GCM / 24 B XChaCha) | ciphertext | tag (16 B) ]
//! CFB modes:   [ iv (16 B) | ciphertext ]
//! ```
//!
//! CFB modes provide confidentiality only.  They are selectable for
//! compatibility, but [`CipherKind::integrity_warning`] returns a warning
//! the creator must acknowledge before using one.
//!
//! Keys are held in a zeroize-on-drop buffer and never logged; `Debug`
//! output is redacted.

use aes::{Aes128, Aes256};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::typenum::Unsigned;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, Nonce, OsRng as AeadOsRng};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use cfb_mode::cipher::{AsyncStreamCipher, BlockCipher, BlockEncryptMut, KeyIvInit};
use cfb_mode::{Decryptor as CfbDecryptor, Encryptor as CfbEncryptor};
use chacha20poly1305::XChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use twofish::Twofish;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub mod kdf;

/// GCM with a 128-bit block cipher other than AES.
type Twofish256Gcm = AesGcm<Twofish, U12>;

/// IV length of the CFB modes (one cipher block).
const CFB_IV_LEN: usize = 16;

/// Nonce + tag overhead of the 12-byte-nonce GCM modes.
const GCM_OVERHEAD: u64 = 12 + 16;

/// Nonce + tag overhead of XChaCha20-Poly1305.
const XCHACHA_OVERHEAD: u64 = 24 + 16;

/// Warning returned for modes that do not authenticate ciphertexts.
pub const INTEGRITY_WARNING: &str =
    "This cipher does not authenticate ciphertexts; modifications cannot be detected by the cipher alone.";

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("invalid key length {got} for {cipher} (expected {expected})")]
    InvalidKeyLength {
        cipher: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed — wrong key or corrupted ciphertext")]
    DecryptionFailed,
    #[error("ciphertext too short")]
    TooShort,
    #[error("unknown cipher name {0:?}")]
    UnknownCipher(String),
    #[error("key is not valid hex")]
    InvalidHexKey,
}

// ── CipherKind ───────────────────────────────────────────────────────────────

/// Closed set of selectable cipher algorithms.  The string name is the
/// serialization contract; the enum is in-process only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes256Gcm,
    Aes128Gcm,
    Aes256Cfb,
    Aes128Cfb,
    Twofish256Gcm,
    Twofish256Cfb,
    XChaCha20Poly1305,
}

/// Default algorithm for new vaults.
pub const DEFAULT_CIPHER: CipherKind = CipherKind::Aes256Gcm;

/// Every selectable algorithm, in display order.
pub const ALL_CIPHERS: [CipherKind; 7] = [
    CipherKind::Aes256Gcm,
    CipherKind::Aes128Gcm,
    CipherKind::Aes256Cfb,
    CipherKind::Aes128Cfb,
    CipherKind::Twofish256Gcm,
    CipherKind::Twofish256Cfb,
    CipherKind::XChaCha20Poly1305,
];

impl CipherKind {
    /// Stable name persisted in the configuration file.
    pub fn name(self) -> &'static str {
        match self {
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes256Cfb => "aes-256-cfb",
            CipherKind::Aes128Cfb => "aes-128-cfb",
            CipherKind::Twofish256Gcm => "twofish-256-gcm",
            CipherKind::Twofish256Cfb => "twofish-256-cfb",
            CipherKind::XChaCha20Poly1305 => "xchacha20-poly1305",
        }
    }

    /// Resolve a persisted name.
    pub fn from_name(name: &str) -> Result<Self, CipherError> {
        ALL_CIPHERS
            .iter()
            .copied()
            .find(|c| c.name() == name)
            .ok_or_else(|| CipherError::UnknownCipher(name.to_owned()))
    }

    /// Required key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            CipherKind::Aes128Gcm | CipherKind::Aes128Cfb => 16,
            _ => 32,
        }
    }

    /// Fixed per-message growth: nonce/IV plus authentication tag.
    pub fn ciphertext_overhead(self) -> u64 {
        match self {
            CipherKind::Aes256Gcm | CipherKind::Aes128Gcm | CipherKind::Twofish256Gcm => {
                GCM_OVERHEAD
            }
            CipherKind::Aes256Cfb | CipherKind::Aes128Cfb | CipherKind::Twofish256Cfb => {
                CFB_IV_LEN as u64
            }
            CipherKind::XChaCha20Poly1305 => XCHACHA_OVERHEAD,
        }
    }

    /// `Some(warning)` for modes that do not authenticate ciphertexts.
    /// A creator must surface this warning and get it acknowledged.
    pub fn integrity_warning(self) -> Option<&'static str> {
        match self {
            CipherKind::Aes256Cfb | CipherKind::Aes128Cfb | CipherKind::Twofish256Cfb => {
                Some(INTEGRITY_WARNING)
            }
            _ => None,
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── EncryptionKey ────────────────────────────────────────────────────────────

/// Symmetric key material.  Zeroized on drop; never printed, never
/// serialized by this crate.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(Vec<u8>);

impl EncryptionKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, CipherError> {
        Ok(Self(hex::decode(s).map_err(|_| CipherError::InvalidHexKey)?))
    }

    /// Generate `len` bytes of fresh key material from the OS RNG.
    pub fn generate(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey(<{} bytes redacted>)", self.0.len())
    }
}

// ── Cipher ───────────────────────────────────────────────────────────────────

/// A cipher algorithm bound to a key.  The single encrypt/decrypt dispatch
/// point for the whole stack.
pub struct Cipher {
    kind: CipherKind,
    key: EncryptionKey,
}

impl Cipher {
    /// Bind `key` to `kind`; fails unless the key length matches.
    pub fn new(kind: CipherKind, key: EncryptionKey) -> Result<Self, CipherError> {
        if key.len() != kind.key_len() {
            return Err(CipherError::InvalidKeyLength {
                cipher: kind.name(),
                expected: kind.key_len(),
                got: key.len(),
            });
        }
        Ok(Self { kind, key })
    }

    #[inline]
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Encrypt with a fresh random nonce/IV; output layout per module doc.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let key = self.key.as_bytes();
        match self.kind {
            CipherKind::Aes256Gcm => aead_encrypt::<Aes256Gcm>(key, plaintext),
            CipherKind::Aes128Gcm => aead_encrypt::<Aes128Gcm>(key, plaintext),
            CipherKind::Twofish256Gcm => aead_encrypt::<Twofish256Gcm>(key, plaintext),
            CipherKind::XChaCha20Poly1305 => aead_encrypt::<XChaCha20Poly1305>(key, plaintext),
            CipherKind::Aes256Cfb => cfb_encrypt::<Aes256>(key, plaintext),
            CipherKind::Aes128Cfb => cfb_encrypt::<Aes128>(key, plaintext),
            CipherKind::Twofish256Cfb => cfb_encrypt::<Twofish>(key, plaintext),
        }
    }

    /// Decrypt a payload produced by [`Cipher::encrypt`].  For AEAD modes a
    /// wrong key or any ciphertext modification fails the tag check; CFB
    /// modes only fail on truncation.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        let key = self.key.as_bytes();
        match self.kind {
            CipherKind::Aes256Gcm => aead_decrypt::<Aes256Gcm>(key, data),
            CipherKind::Aes128Gcm => aead_decrypt::<Aes128Gcm>(key, data),
            CipherKind::Twofish256Gcm => aead_decrypt::<Twofish256Gcm>(key, data),
            CipherKind::XChaCha20Poly1305 => aead_decrypt::<XChaCha20Poly1305>(key, data),
            CipherKind::Aes256Cfb => cfb_decrypt::<Aes256>(key, data),
            CipherKind::Aes128Cfb => cfb_decrypt::<Aes128>(key, data),
            CipherKind::Twofish256Cfb => cfb_decrypt::<Twofish>(key, data),
        }
    }

    /// Physical bytes needed to hold `plaintext_size` logical bytes.
    pub fn ciphertext_size(&self, plaintext_size: u64) -> u64 {
        plaintext_size + self.kind.ciphertext_overhead()
    }

    /// Logical bytes that fit into `ciphertext_size` physical bytes.
    pub fn plaintext_size(&self, ciphertext_size: u64) -> u64 {
        ciphertext_size.saturating_sub(self.kind.ciphertext_overhead())
    }

    #[cfg(test)]
    pub(crate) fn set_key(&mut self, key: EncryptionKey) {
        self.key = key;
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cipher({})", self.kind.name())
    }
}

// ── Dispatch helpers ─────────────────────────────────────────────────────────

fn aead_encrypt<C>(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError>
where
    C: Aead + AeadCore + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| CipherError::EncryptionFailed)?;
    let nonce = C::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CipherError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(C::NonceSize::USIZE + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn aead_decrypt<C>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CipherError>
where
    C: Aead + AeadCore + KeyInit,
{
    let nonce_len = C::NonceSize::USIZE;
    if data.len() < nonce_len {
        return Err(CipherError::TooShort);
    }
    let cipher = C::new_from_slice(key).map_err(|_| CipherError::DecryptionFailed)?;
    let nonce = Nonce::<C>::from_slice(&data[..nonce_len]);
    cipher
        .decrypt(nonce, &data[nonce_len..])
        .map_err(|_| CipherError::DecryptionFailed)
}

fn cfb_encrypt<C>(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError>
where
    C: BlockCipher + BlockEncryptMut + cfb_mode::cipher::KeyInit,
{
    let mut iv = [0u8; CFB_IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let enc =
        CfbEncryptor::<C>::new_from_slices(key, &iv).map_err(|_| CipherError::EncryptionFailed)?;

    let mut buf = plaintext.to_vec();
    enc.encrypt(&mut buf);

    let mut out = Vec::with_capacity(CFB_IV_LEN + buf.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&buf);
    Ok(out)
}

fn cfb_decrypt<C>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CipherError>
where
    C: BlockCipher + BlockEncryptMut + cfb_mode::cipher::KeyInit,
{
    if data.len() < CFB_IV_LEN {
        return Err(CipherError::TooShort);
    }
    let dec = CfbDecryptor::<C>::new_from_slices(key, &data[..CFB_IV_LEN])
        .map_err(|_| CipherError::DecryptionFailed)?;

    let mut buf = data[CFB_IV_LEN..].to_vec();
    dec.decrypt(&mut buf);
    Ok(buf)
}

// ── Tests ────────────────────────────────────────────────────────────────────
