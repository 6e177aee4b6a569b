//! Known-version database — the persisted integrity state.
//!
//! Tracks, per `(writer client, block)`, the highest version number this
//! process has ever observed, plus the client whose write is currently
//! authoritative for each block.  Client id `0` is a sentinel marking a
//! block as locally deleted and is never a valid writer.
//!
//! # State file format (little-endian)
//!
//! ```text
//! string "cryfs.integritydata.knownblockversions;1"   (NUL-terminated)
//! u8     integrity_violation_on_previous_run          (0 / 1)
//! u64    N
//! { u32 client_id ; 16 B block_id ; u64 version } × N
//! u64    M
//! { 16 B block_id ; u32 last_update_client } × M
//! ```
//!
//! A legacy `;0` header (no violation flag) is accepted on read and the
//! file is immediately rewritten with the current header.  Saves are atomic
//! (temp file + rename) and happen on drop and whenever a violation is
//! recorded.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::error;

use crate::blockid::{BlockId, BLOCK_ID_LEN};
use crate::store::BlockStoreError;

/// Sentinel in `last_update_client`: the local client deleted this block.
pub const CLIENT_ID_FOR_DELETED_BLOCK: u32 = 0;

const HEADER: &[u8] = b"cryfs.integritydata.knownblockversions;1";
const OLD_HEADER: &[u8] = b"cryfs.integritydata.knownblockversions;0";

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StateFileError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid integrity state file header")]
    InvalidHeader,
    #[error("integrity state file is truncated or corrupt")]
    Corrupt,
    #[error("client id 0 is reserved for deleted blocks")]
    ReservedClientId,
}

// ── Keys ─────────────────────────────────────────────────────────────────────

/// Version counters are scoped per writing client, not global per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientIdAndBlockId {
    pub client_id: u32,
    pub block_id: BlockId,
}

// ── KnownBlockVersions ───────────────────────────────────────────────────────

#[derive(Default)]
struct State {
    integrity_violation_on_previous_run: bool,
    known_versions: HashMap<ClientIdAndBlockId, u64>,
    last_update_client_id: HashMap<BlockId, u32>,
}

pub struct KnownBlockVersions {
    state_file_path: PathBuf,
    my_client_id: u32,
    state: Mutex<State>,
}

impl KnownBlockVersions {
    /// Load the state file at `state_file_path`, or start empty if it does
    /// not exist.  `my_client_id` must not be the deleted-block sentinel.
    pub fn new(state_file_path: PathBuf, my_client_id: u32) -> Result<Self, StateFileError> {
        if my_client_id == CLIENT_ID_FOR_DELETED_BLOCK {
            return Err(StateFileError::ReservedClientId);
        }
        let (state, needs_rewrite) = match fs::read(&state_file_path) {
            Ok(bytes) => Self::parse_state_file(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => (State::default(), false),
            Err(err) => return Err(err.into()),
        };
        let result = Self {
            state_file_path,
            my_client_id,
            state: Mutex::new(state),
        };
        if needs_rewrite {
            // Legacy header — rewrite in the current format right away.
            result.save()?;
        }
        Ok(result)
    }

    #[inline]
    pub fn my_client_id(&self) -> u32 {
        self.my_client_id
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.state_file_path
    }

    pub fn integrity_violation_on_previous_run(&self) -> bool {
        self.state.lock().integrity_violation_on_previous_run
    }

    pub fn set_integrity_violation_on_previous_run(&self, value: bool) {
        self.state.lock().integrity_violation_on_previous_run = value;
    }

    /// Decide whether a loaded `(writer, block, version)` triple is
    /// acceptable, and record it if so.
    ///
    /// Rejects when the writer already published a newer version
    /// (rollback), or when the triple re-presents the writer's latest
    /// version even though another client has since superseded it (stale).
    pub fn check_and_update_version(
        &self,
        client_id: u32,
        block_id: BlockId,
        version: u64,
    ) -> bool {
        debug_assert_ne!(client_id, CLIENT_ID_FOR_DELETED_BLOCK);
        debug_assert!(version > 0);
        let mut state = self.state.lock();
        let state = &mut *state;

        let found = state
            .known_versions
            .entry(ClientIdAndBlockId {
                client_id,
                block_id,
            })
            .or_insert(0);
        if *found > version {
            // This client already published a newer version; rollback.
            return false;
        }

        let last_update_client_id = state
            .last_update_client_id
            .entry(block_id)
            .or_insert(CLIENT_ID_FOR_DELETED_BLOCK);
        if *found == version && *last_update_client_id != client_id {
            // The writer's newest version, but another client superseded it
            // in the meantime; re-presenting it is a rollback too.
            return false;
        }

        *found = version;
        *last_update_client_id = client_id;
        true
    }

    /// Next version number for a local write; also marks the local client
    /// as the authoritative writer for the block.
    pub fn increment_version(&self, block_id: BlockId) -> Result<u64, BlockStoreError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let found = state
            .known_versions
            .entry(ClientIdAndBlockId {
                client_id: self.my_client_id,
                block_id,
            })
            .or_insert(0);
        // Running out of 64-bit versions takes deliberate effort; u64::MAX
        // itself stays reserved so a wrap can never look valid.
        let new_version = match found.checked_add(1) {
            Some(v) if v != u64::MAX => v,
            _ => return Err(BlockStoreError::VersionOverflow),
        };
        *found = new_version;
        state
            .last_update_client_id
            .insert(block_id, self.my_client_id);
        Ok(new_version)
    }

    /// Record a local delete; disables the should-exist check for the block
    /// and keeps a later re-introduction from looking like a fresh create.
    pub fn mark_block_as_deleted(&self, block_id: BlockId) {
        self.state
            .lock()
            .last_update_client_id
            .insert(block_id, CLIENT_ID_FOR_DELETED_BLOCK);
    }

    /// True iff the block has been observed before and not locally deleted.
    /// Only meaningful in exclusive-client mode.
    pub fn block_should_exist(&self, block_id: &BlockId) -> bool {
        match self.state.lock().last_update_client_id.get(block_id) {
            // Never seen, so we cannot claim it has to exist.
            None => false,
            Some(&client) => client != CLIENT_ID_FOR_DELETED_BLOCK,
        }
    }

    /// All blocks currently expected to exist.
    pub fn existing_blocks(&self) -> HashSet<BlockId> {
        self.state
            .lock()
            .last_update_client_id
            .iter()
            .filter(|(_, &client)| client != CLIENT_ID_FOR_DELETED_BLOCK)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Highest version observed from `client_id` for `block_id`, if any.
    pub fn block_version(&self, client_id: u32, block_id: &BlockId) -> Option<u64> {
        self.state
            .lock()
            .known_versions
            .get(&ClientIdAndBlockId {
                client_id,
                block_id: *block_id,
            })
            .copied()
    }

    /// Atomically rewrite the state file (temp file + rename).
    pub fn save(&self) -> Result<(), StateFileError> {
        let state = self.state.lock();
        let serialized = Self::serialize_state(&state);
        drop(state);

        let tmp_path = self.state_file_path.with_extension("tmp");
        fs::write(&tmp_path, serialized)?;
        fs::rename(&tmp_path, &self.state_file_path)?;
        Ok(())
    }

    /// Clear the sticky violation flag in an existing state file.  This is
    /// the operator-facing repair path; a missing file is fine (there is
    /// nothing to reset).  Returns whether a flag was actually cleared.
    pub fn reset_integrity_violation_flag(
        state_file_path: &Path,
    ) -> Result<bool, StateFileError> {
        let bytes = match fs::read(state_file_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let (mut state, _) = Self::parse_state_file(&bytes)?;
        let was_set = state.integrity_violation_on_previous_run;
        state.integrity_violation_on_previous_run = false;

        let tmp_path = state_file_path.with_extension("tmp");
        fs::write(&tmp_path, Self::serialize_state(&state))?;
        fs::rename(&tmp_path, state_file_path)?;
        Ok(was_set)
    }

    // ── Wire format ──────────────────────────────────────────────────────────

    /// Returns the parsed state and whether the file carried the legacy
    /// header (and should be rewritten).
    fn parse_state_file(bytes: &[u8]) -> Result<(State, bool), StateFileError> {
        let mut cursor = Cursor::new(bytes);
        let header = read_nul_terminated(&mut cursor)?;

        let (legacy, integrity_violation_on_previous_run) = if header == OLD_HEADER {
            (true, false)
        } else if header == HEADER {
            (false, cursor.read_u8().map_err(|_| StateFileError::Corrupt)? != 0)
        } else {
            return Err(StateFileError::InvalidHeader);
        };

        let known_versions = deserialize_known_versions(&mut cursor)?;
        let last_update_client_id = deserialize_last_update_clients(&mut cursor)?;

        if cursor.position() != bytes.len() as u64 {
            return Err(StateFileError::Corrupt);
        }

        Ok((
            State {
                integrity_violation_on_previous_run,
                known_versions,
                last_update_client_id,
            },
            legacy,
        ))
    }

    fn serialize_state(state: &State) -> Vec<u8> {
        let capacity = HEADER.len()
            + 2
            + 16
            + state.known_versions.len() * (4 + BLOCK_ID_LEN + 8)
            + state.last_update_client_id.len() * (BLOCK_ID_LEN + 4);
        let mut out = Vec::with_capacity(capacity);
        out.extend_from_slice(HEADER);
        out.push(0);
        out.push(state.integrity_violation_on_previous_run as u8);

        out.write_u64::<LittleEndian>(state.known_versions.len() as u64)
            .unwrap(); // Vec writes cannot fail
        for (key, version) in &state.known_versions {
            out.write_u32::<LittleEndian>(key.client_id).unwrap();
            out.extend_from_slice(key.block_id.as_bytes());
            out.write_u64::<LittleEndian>(*version).unwrap();
        }

        out.write_u64::<LittleEndian>(state.last_update_client_id.len() as u64)
            .unwrap();
        for (block_id, client_id) in &state.last_update_client_id {
            out.extend_from_slice(block_id.as_bytes());
            out.write_u32::<LittleEndian>(*client_id).unwrap();
        }

        out
    }
}

impl Drop for KnownBlockVersions {
    fn drop(&mut self) {
        if let Err(err) = self.save() {
            error!(path = %self.state_file_path.display(), %err,
                "failed to save integrity state file");
        }
    }
}

fn read_nul_terminated(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, StateFileError> {
    let mut out = Vec::new();
    loop {
        let byte = cursor.read_u8().map_err(|_| StateFileError::Corrupt)?;
        if byte == 0 {
            return Ok(out);
        }
        out.push(byte);
    }
}

fn read_block_id(cursor: &mut Cursor<&[u8]>) -> Result<BlockId, StateFileError> {
    let mut bytes = [0u8; BLOCK_ID_LEN];
    cursor
        .read_exact(&mut bytes)
        .map_err(|_| StateFileError::Corrupt)?;
    Ok(BlockId::from_bytes(bytes))
}

fn deserialize_known_versions(
    cursor: &mut Cursor<&[u8]>,
) -> Result<HashMap<ClientIdAndBlockId, u64>, StateFileError> {
    let num_entries = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| StateFileError::Corrupt)?;
    let mut result = HashMap::with_capacity(num_entries.min(1 << 20) as usize);
    for _ in 0..num_entries {
        let client_id = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| StateFileError::Corrupt)?;
        let block_id = read_block_id(cursor)?;
        let version = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| StateFileError::Corrupt)?;
        result.insert(
            ClientIdAndBlockId {
                client_id,
                block_id,
            },
            version,
        );
    }
    Ok(result)
}

fn deserialize_last_update_clients(
    cursor: &mut Cursor<&[u8]>,
) -> Result<HashMap<BlockId, u32>, StateFileError> {
    let num_entries = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| StateFileError::Corrupt)?;
    let mut result = HashMap::with_capacity(num_entries.min(1 << 20) as usize);
    for _ in 0..num_entries {
        let block_id = read_block_id(cursor)?;
        let client_id = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| StateFileError::Corrupt)?;
        result.insert(block_id, client_id);
    }
    Ok(result)
}

// ── Tests ────────────────────────────────────────────────────────────────────
