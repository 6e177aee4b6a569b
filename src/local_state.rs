//! Per-machine local state: the client id.
//!
//! The client id scopes version counters in multi-writer scenarios.  It is
//! chosen randomly on first use, persisted in a small JSON file in the
//! (trusted) local state directory — never inside the untrusted vault — and
//! reused for every later mount.  Id `0` is reserved for the deleted-block
//! sentinel and never generated.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::store::integrity::known_versions::CLIENT_ID_FOR_DELETED_BLOCK;

const METADATA_FILE_NAME: &str = "metadata";

#[derive(Error, Debug)]
pub enum LocalStateError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed local state file: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct LocalStateMetadata {
    my_client_id: u32,
}

/// Load the client id from `state_dir`, generating and persisting a fresh
/// one if the directory holds none yet.
pub fn load_or_generate_client_id(state_dir: &Path) -> Result<u32, LocalStateError> {
    let metadata_path = state_dir.join(METADATA_FILE_NAME);
    match fs::read(&metadata_path) {
        Ok(content) => {
            let metadata: LocalStateMetadata = serde_json::from_slice(&content)?;
            Ok(metadata.my_client_id)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let my_client_id = generate_client_id();
            fs::create_dir_all(state_dir)?;
            let metadata = LocalStateMetadata { my_client_id };
            fs::write(&metadata_path, serde_json::to_vec_pretty(&metadata)?)?;
            info!(client_id = my_client_id, "generated a new client id");
            Ok(my_client_id)
        }
        Err(err) => Err(err.into()),
    }
}

fn generate_client_id() -> u32 {
    loop {
        let id = OsRng.next_u32();
        if id != CLIENT_ID_FOR_DELETED_BLOCK {
            return id;
        }
    }
}
