//! Integrity layer — version counters, client ids, tamper detection.
//!
//! Sits directly above the encryption layer.  Every write stamps the
//! plaintext with a header the cipher then authenticates:
//!
//! ```text
//! Offset  Size  Field
//!    0      2   format_version = 1   (LE u16; 0 is the legacy variant)
//!    2     16   block id             (copy of the intended id)
//!   18      4   writer client id     (LE u32, never 0)
//!   22      8   version counter      (LE u64, strictly positive)
//!   30      N   caller payload
//! ```
//!
//! On read the header is verified before the payload is trusted: the
//! embedded id must match the requested slot (no ciphertext swapping), and
//! the `(writer, version)` pair must pass [`KnownBlockVersions`] — no
//! rollbacks, no re-presenting versions another client superseded.  The
//! legacy variant (version 0) carried no embedded id; it is migrated on
//! read and rewritten through the full stack.
//!
//! All rejections funnel through a single chokepoint.  In normal mode it
//! persists the sticky violation flag and invokes the caller-supplied
//! callback (which in practice unmounts the filesystem); afterwards no load
//! returns data.  With `allow_integrity_violations` (an operator recovery
//! mode) it only logs and the stale data is passed through.
//!
//! A decryption failure below this layer is *not* an integrity violation:
//! the encryption layer already surfaced it as "not found".

use byteorder::{ByteOrder, LittleEndian};
use std::path::PathBuf;
use tracing::{error, warn};

pub mod known_versions;

use super::{BlockStore2, BlockStoreError, Result};
use crate::blockid::{BlockId, BLOCK_ID_LEN};
use known_versions::{KnownBlockVersions, CLIENT_ID_FOR_DELETED_BLOCK};

const FORMAT_VERSION_HEADER: u16 = 1;
const FORMAT_VERSION_HEADER_OLD: u16 = 0;
const ID_HEADER_OFFSET: usize = 2;
const CLIENT_ID_HEADER_OFFSET: usize = ID_HEADER_OFFSET + BLOCK_ID_LEN;
const VERSION_HEADER_OFFSET: usize = CLIENT_ID_HEADER_OFFSET + 4;

/// Full header length of the current format.
pub const HEADER_LENGTH: usize = VERSION_HEADER_OFFSET + 8;

/// The legacy format had no embedded block id.
const LEGACY_HEADER_LENGTH: usize = HEADER_LENGTH - BLOCK_ID_LEN;

/// Invoked (in normal mode) whenever tampering is detected; the receiver
/// is expected to stop using the filesystem.
pub type IntegrityViolationCallback = Box<dyn Fn(&str) + Send + Sync>;

pub struct IntegrityConfig {
    /// Operator recovery mode: log violations instead of failing.
    pub allow_integrity_violations: bool,
    /// Exclusive-client mode: a block seen before and not locally deleted
    /// must still exist; its absence is a violation.
    pub missing_block_is_integrity_violation: bool,
    pub on_integrity_violation: IntegrityViolationCallback,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            allow_integrity_violations: false,
            missing_block_is_integrity_violation: false,
            on_integrity_violation: Box::new(|_| {}),
        }
    }
}

pub struct IntegrityBlockStore2 {
    base: Box<dyn BlockStore2>,
    known_block_versions: KnownBlockVersions,
    config: IntegrityConfig,
}

impl IntegrityBlockStore2 {
    /// Fails with [`BlockStoreError::IntegrityViolationOnPreviousRun`] if
    /// the state file carries the sticky flag; the operator must reset it
    /// first.
    pub fn new(
        base: Box<dyn BlockStore2>,
        state_file_path: PathBuf,
        my_client_id: u32,
        config: IntegrityConfig,
    ) -> Result<Self> {
        let known_block_versions = KnownBlockVersions::new(state_file_path, my_client_id)?;
        if known_block_versions.integrity_violation_on_previous_run() {
            return Err(BlockStoreError::IntegrityViolationOnPreviousRun {
                path: known_block_versions.path().to_path_buf(),
            });
        }
        Ok(Self {
            base,
            known_block_versions,
            config,
        })
    }

    // ── Violation chokepoint ─────────────────────────────────────────────────

    fn integrity_violation_detected(&self, reason: &str) {
        if self.config.allow_integrity_violations {
            warn!(reason, "integrity violation (checks are disabled, continuing)");
            return;
        }
        self.known_block_versions
            .set_integrity_violation_on_previous_run(true);
        if let Err(err) = self.known_block_versions.save() {
            error!(%err, "failed to persist the integrity violation flag");
        }
        (self.config.on_integrity_violation)(reason);
    }

    /// Once a violation has been signalled in normal mode, no load may
    /// return data anymore.
    fn violation_latched(&self) -> bool {
        !self.config.allow_integrity_violations
            && self
                .known_block_versions
                .integrity_violation_on_previous_run()
    }

    // ── Header handling ──────────────────────────────────────────────────────

    fn prepend_header(id: &BlockId, client_id: u32, version: u64, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LENGTH + data.len());
        out.extend_from_slice(&FORMAT_VERSION_HEADER.to_le_bytes());
        out.extend_from_slice(id.as_bytes());
        out.extend_from_slice(&client_id.to_le_bytes());
        out.extend_from_slice(&version.to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    /// Rebuild the current layout from a legacy block: the id slot is
    /// spliced in; writer and version are carried over unchanged.
    fn migrate_block(id: &BlockId, data: &[u8]) -> Vec<u8> {
        let mut migrated = Vec::with_capacity(data.len() + BLOCK_ID_LEN);
        migrated.extend_from_slice(&FORMAT_VERSION_HEADER.to_le_bytes());
        migrated.extend_from_slice(id.as_bytes());
        migrated.extend_from_slice(&data[2..]);
        migrated
    }

    fn check_header(&self, id: &BlockId, data: &[u8]) -> bool {
        self.check_id_header(id, data) && self.check_version_header(id, data)
    }

    fn check_id_header(&self, expected_id: &BlockId, data: &[u8]) -> bool {
        // Prevents an attacker from swapping ciphertexts between slots;
        // also hardens the cipher against nonce-key commitment issues.
        let actual = BlockId::from_slice(&data[ID_HEADER_OFFSET..ID_HEADER_OFFSET + BLOCK_ID_LEN])
            .expect("slice has exactly BLOCK_ID_LEN bytes");
        if actual != *expected_id {
            self.integrity_violation_detected(&format!(
                "block {expected_id} carries id {actual} — did an attacker rename blocks?"
            ));
            return false;
        }
        true
    }

    fn check_version_header(&self, id: &BlockId, data: &[u8]) -> bool {
        let client_id = LittleEndian::read_u32(&data[CLIENT_ID_HEADER_OFFSET..]);
        let version = LittleEndian::read_u64(&data[VERSION_HEADER_OFFSET..]);

        if client_id == CLIENT_ID_FOR_DELETED_BLOCK || version == 0 {
            self.integrity_violation_detected(&format!(
                "block {id} carries an invalid writer id or version"
            ));
            return false;
        }
        if !self
            .known_block_versions
            .check_and_update_version(client_id, *id, version)
        {
            self.integrity_violation_detected(&format!(
                "version number of block {id} is too low — did an attacker roll it back or re-introduce a deleted block?"
            ));
            return false;
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn known_block_versions(&self) -> &KnownBlockVersions {
        &self.known_block_versions
    }
}

impl BlockStore2 for IntegrityBlockStore2 {
    fn create_block_id(&self) -> BlockId {
        self.base.create_block_id()
    }

    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool> {
        let version = self.known_block_versions.increment_version(*id)?;
        let data = Self::prepend_header(
            id,
            self.known_block_versions.my_client_id(),
            version,
            data,
        );
        self.base.try_create(id, &data)
    }

    fn remove(&self, id: &BlockId) -> Result<bool> {
        // Mark first so exclusive mode never flags our own delete.
        self.known_block_versions.mark_block_as_deleted(*id);
        self.base.remove(id)
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        if self.violation_latched() {
            return Ok(None);
        }
        let Some(loaded) = self.base.load(id)? else {
            if self.config.missing_block_is_integrity_violation
                && self.known_block_versions.block_should_exist(id)
            {
                self.integrity_violation_detected(&format!(
                    "block {id} that should exist was not found — did an attacker delete it?"
                ));
            }
            return Ok(None);
        };

        if loaded.len() < 2 {
            self.integrity_violation_detected(&format!("block {id} is too small for a header"));
            return Ok(None);
        }
        match LittleEndian::read_u16(&loaded[..2]) {
            FORMAT_VERSION_HEADER_OLD => {
                if loaded.len() < LEGACY_HEADER_LENGTH {
                    self.integrity_violation_detected(&format!(
                        "block {id} is too small for a header"
                    ));
                    return Ok(None);
                }
                let migrated = Self::migrate_block(id, &loaded);
                if !self.check_header(id, &migrated)
                    && !self.config.allow_integrity_violations
                {
                    return Ok(None);
                }
                let content = migrated[HEADER_LENGTH..].to_vec();
                // Re-encode in place so the next read takes the fast path.
                self.store(id, &content)?;
                Ok(Some(content))
            }
            FORMAT_VERSION_HEADER => {
                if loaded.len() < HEADER_LENGTH {
                    self.integrity_violation_detected(&format!(
                        "block {id} is too small for a header"
                    ));
                    return Ok(None);
                }
                if !self.check_header(id, &loaded)
                    && !self.config.allow_integrity_violations
                {
                    return Ok(None);
                }
                Ok(Some(loaded[HEADER_LENGTH..].to_vec()))
            }
            other => Err(BlockStoreError::UnsupportedFormatVersion {
                found: other.to_string(),
                supported: FORMAT_VERSION_HEADER.to_string(),
            }),
        }
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        let version = self.known_block_versions.increment_version(*id)?;
        let data = Self::prepend_header(
            id,
            self.known_block_versions.my_client_id(),
            version,
            data,
        );
        self.base.store(id, &data)
    }

    fn num_blocks(&self) -> Result<u64> {
        self.base.num_blocks()
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        self.base.estimate_num_free_bytes()
    }

    fn block_size_from_physical_block_size(&self, block_size: u64) -> u64 {
        let base_size = self.base.block_size_from_physical_block_size(block_size);
        if base_size <= HEADER_LENGTH as u64 {
            return 0;
        }
        base_size - HEADER_LENGTH as u64
    }

    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<()> {
        if !self.config.missing_block_is_integrity_violation {
            return self.base.for_each_block(callback);
        }

        let mut expected = self.known_block_versions.existing_blocks();
        self.base.for_each_block(&mut |id| {
            callback(id);
            expected.remove(id);
        })?;

        if !expected.is_empty() {
            let reason = format!(
                "{} block(s) that should exist were not found — did an attacker delete them?",
                expected.len()
            );
            self.integrity_violation_detected(&reason);
            if !self.config.allow_integrity_violations {
                return Err(BlockStoreError::IntegrityViolation(reason));
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::inmemory::InMemoryBlockStore2;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        base: Arc<InMemoryBlockStore2>,
        violations: Arc<StdMutex<Vec<String>>>,
        callback_count: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                base: Arc::new(InMemoryBlockStore2::new()),
                violations: Arc::new(StdMutex::new(Vec::new())),
                callback_count: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn store_with(&self, client_id: u32, exclusive: bool, allow: bool) -> IntegrityBlockStore2 {
            let violations = Arc::clone(&self.violations);
            let count = Arc::clone(&self.callback_count);
            IntegrityBlockStore2::new(
                Box::new(Arc::clone(&self.base)),
                self.dir
                    .path()
                    .join(format!("client{client_id}.state")),
                client_id,
                IntegrityConfig {
                    allow_integrity_violations: allow,
                    missing_block_is_integrity_violation: exclusive,
                    on_integrity_violation: Box::new(move |reason| {
                        violations.lock().unwrap().push(reason.to_owned());
                        count.fetch_add(1, Ordering::SeqCst);
                    }),
                },
            )
            .unwrap()
        }

        fn store(&self) -> IntegrityBlockStore2 {
            self.store_with(1, false, false)
        }

        fn violation_count(&self) -> usize {
            self.callback_count.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn roundtrip() {
        let fx = Fixture::new();
        let store = fx.store();
        let id = BlockId::random();
        store.store(&id, b"payload").unwrap();
        assert_eq!(store.load(&id).unwrap().unwrap(), b"payload");
        assert_eq!(fx.violation_count(), 0);
    }

    #[test]
    fn header_layout_on_backend() {
        let fx = Fixture::new();
        let store = fx.store();
        let id = BlockId::random();
        store.store(&id, b"xyz").unwrap();

        let physical = fx.base.load(&id).unwrap().unwrap();
        assert_eq!(physical.len(), HEADER_LENGTH + 3);
        assert_eq!(LittleEndian::read_u16(&physical[..2]), FORMAT_VERSION_HEADER);
        assert_eq!(&physical[2..18], id.as_bytes());
        assert_eq!(LittleEndian::read_u32(&physical[18..22]), 1); // client id
        assert_eq!(LittleEndian::read_u64(&physical[22..30]), 1); // version
        assert_eq!(&physical[30..], b"xyz");
    }

    #[test]
    fn versions_increase_across_writes() {
        let fx = Fixture::new();
        let store = fx.store();
        let id = BlockId::random();
        store.store(&id, b"one").unwrap();
        store.store(&id, b"two").unwrap();
        let physical = fx.base.load(&id).unwrap().unwrap();
        assert_eq!(LittleEndian::read_u64(&physical[22..30]), 2);
    }

    #[test]
    fn rollback_is_detected() {
        let fx = Fixture::new();
        let store = fx.store();
        let id = BlockId::random();
        store.store(&id, b"version one").unwrap();
        let snapshot = fx.base.load(&id).unwrap().unwrap();
        store.store(&id, b"version two").unwrap();

        fx.base.store(&id, &snapshot).unwrap();
        assert_eq!(store.load(&id).unwrap(), None);
        assert_eq!(fx.violation_count(), 1);
        assert!(fx.violations.lock().unwrap()[0].contains("roll"));
    }

    #[test]
    fn id_rebinding_is_detected() {
        let fx = Fixture::new();
        let store = fx.store();
        let id_a = BlockId::random();
        let id_b = BlockId::random();
        store.store(&id_a, b"block a").unwrap();
        store.store(&id_b, b"block b").unwrap();

        let a_physical = fx.base.load(&id_a).unwrap().unwrap();
        fx.base.store(&id_b, &a_physical).unwrap();

        assert_eq!(store.load(&id_b).unwrap(), None);
        assert_eq!(fx.violation_count(), 1);
        assert!(fx.violations.lock().unwrap()[0].contains("id"));
    }

    #[test]
    fn after_violation_no_load_returns_data() {
        let fx = Fixture::new();
        let store = fx.store();
        let id = BlockId::random();
        let healthy = BlockId::random();
        store.store(&id, b"v1").unwrap();
        store.store(&healthy, b"untouched").unwrap();
        let snapshot = fx.base.load(&id).unwrap().unwrap();
        store.store(&id, b"v2").unwrap();
        fx.base.store(&id, &snapshot).unwrap();

        assert_eq!(store.load(&id).unwrap(), None);
        // The healthy block is refused too, without another callback.
        assert_eq!(store.load(&healthy).unwrap(), None);
        assert_eq!(fx.violation_count(), 1);
    }

    #[test]
    fn violation_refuses_next_construction() {
        let fx = Fixture::new();
        {
            let store = fx.store();
            let id = BlockId::random();
            store.store(&id, b"v1").unwrap();
            let snapshot = fx.base.load(&id).unwrap().unwrap();
            store.store(&id, b"v2").unwrap();
            fx.base.store(&id, &snapshot).unwrap();
            assert_eq!(store.load(&id).unwrap(), None);
        }
        let violations = Arc::clone(&fx.violations);
        let result = IntegrityBlockStore2::new(
            Box::new(Arc::clone(&fx.base)),
            fx.dir.path().join("client1.state"),
            1,
            IntegrityConfig {
                allow_integrity_violations: false,
                missing_block_is_integrity_violation: false,
                on_integrity_violation: Box::new(move |r| {
                    violations.lock().unwrap().push(r.to_owned());
                }),
            },
        );
        assert!(matches!(
            result,
            Err(BlockStoreError::IntegrityViolationOnPreviousRun { .. })
        ));
    }

    #[test]
    fn allow_mode_logs_and_returns_stale_data() {
        let fx = Fixture::new();
        let store = fx.store_with(1, false, true);
        let id = BlockId::random();
        store.store(&id, b"v1").unwrap();
        let snapshot = fx.base.load(&id).unwrap().unwrap();
        store.store(&id, b"v2").unwrap();
        fx.base.store(&id, &snapshot).unwrap();

        // Recovery mode: the rolled-back content is handed out.
        assert_eq!(store.load(&id).unwrap().unwrap(), b"v1");
        assert_eq!(fx.violation_count(), 0);
        assert!(!store.known_block_versions().integrity_violation_on_previous_run());
    }

    #[test]
    fn cross_client_replay_is_detected() {
        let fx = Fixture::new();
        let id = BlockId::random();

        let store1 = fx.store_with(1, false, false);
        store1.store(&id, b"from client 1").unwrap();
        let client1_write = fx.base.load(&id).unwrap().unwrap();

        let store2 = fx.store_with(2, false, false);
        store2.store(&id, b"from client 2").unwrap();

        // store1 observes client 2's write...
        assert_eq!(store1.load(&id).unwrap().unwrap(), b"from client 2");
        // ...so replaying client 1's old ciphertext must be rejected.
        fx.base.store(&id, &client1_write).unwrap();
        assert_eq!(store1.load(&id).unwrap(), None);
        assert_eq!(fx.violation_count(), 1);
    }

    #[test]
    fn exclusive_mode_flags_missing_block_on_load() {
        let fx = Fixture::new();
        let store = fx.store_with(1, true, false);
        let id = BlockId::random();
        store.store(&id, b"data").unwrap();

        fx.base.remove(&id).unwrap();
        assert_eq!(store.load(&id).unwrap(), None);
        assert_eq!(fx.violation_count(), 1);
        assert!(fx.violations.lock().unwrap()[0].contains("delete"));
    }

    #[test]
    fn exclusive_mode_flags_missing_block_in_enumeration() {
        let fx = Fixture::new();
        let store = fx.store_with(1, true, false);
        let id = BlockId::random();
        let other = BlockId::random();
        store.store(&id, b"data").unwrap();
        store.store(&other, b"more").unwrap();

        fx.base.remove(&id).unwrap();
        let mut seen = Vec::new();
        let result = store.for_each_block(&mut |b| seen.push(*b));
        assert!(matches!(
            result,
            Err(BlockStoreError::IntegrityViolation(_))
        ));
        assert_eq!(seen, vec![other]);
        assert_eq!(fx.violation_count(), 1);
    }

    #[test]
    fn own_remove_is_not_a_missing_block() {
        let fx = Fixture::new();
        let store = fx.store_with(1, true, false);
        let id = BlockId::random();
        store.store(&id, b"data").unwrap();

        assert!(store.remove(&id).unwrap());
        assert_eq!(store.load(&id).unwrap(), None);
        store.for_each_block(&mut |_| {}).unwrap();
        assert_eq!(fx.violation_count(), 0);
    }

    #[test]
    fn non_exclusive_mode_ignores_missing_blocks() {
        let fx = Fixture::new();
        let store = fx.store();
        let id = BlockId::random();
        store.store(&id, b"data").unwrap();

        fx.base.remove(&id).unwrap();
        assert_eq!(store.load(&id).unwrap(), None);
        store.for_each_block(&mut |_| {}).unwrap();
        assert_eq!(fx.violation_count(), 0);
    }

    #[test]
    fn legacy_block_is_migrated_and_rewritten() {
        let fx = Fixture::new();
        let store = fx.store();
        let id = BlockId::random();

        // Legacy layout: format 0, no embedded id.
        let mut legacy = Vec::new();
        legacy.extend_from_slice(&FORMAT_VERSION_HEADER_OLD.to_le_bytes());
        legacy.extend_from_slice(&77u32.to_le_bytes());
        legacy.extend_from_slice(&1u64.to_le_bytes());
        legacy.extend_from_slice(b"old payload");
        fx.base.store(&id, &legacy).unwrap();

        assert_eq!(store.load(&id).unwrap().unwrap(), b"old payload");
        assert_eq!(fx.violation_count(), 0);

        // The block was rewritten in the current format, by us.
        let physical = fx.base.load(&id).unwrap().unwrap();
        assert_eq!(LittleEndian::read_u16(&physical[..2]), FORMAT_VERSION_HEADER);
        assert_eq!(&physical[2..18], id.as_bytes());
        assert_eq!(LittleEndian::read_u32(&physical[18..22]), 1);
    }

    #[test]
    fn unknown_format_version_is_hard_error() {
        let fx = Fixture::new();
        let store = fx.store();
        let id = BlockId::random();
        fx.base.store(&id, &9u16.to_le_bytes()).unwrap();

        assert!(matches!(
            store.load(&id),
            Err(BlockStoreError::UnsupportedFormatVersion { .. })
        ));
        assert_eq!(fx.violation_count(), 0);
    }

    #[test]
    fn physical_size_law() {
        let fx = Fixture::new();
        let store = fx.store();
        assert_eq!(store.block_size_from_physical_block_size(0), 0);
        assert_eq!(
            store.block_size_from_physical_block_size(HEADER_LENGTH as u64),
            0
        );
        assert_eq!(
            store.block_size_from_physical_block_size(4096),
            4096 - HEADER_LENGTH as u64
        );
    }
}
