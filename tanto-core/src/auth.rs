//! # Credential Store
//!
//! Per-database API key validation.
//!
//! A key is generated as 16 random bytes rendered to a 32-character lower-case
//! hex token. Only the SHA-256 digest of the printable token is kept: in
//! memory in the store, and on disk as the raw 32-byte sidecar
//! `<db_folder>/.<UPPERNAME>.apikey`. The printable token itself is returned
//! to the client exactly once.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::error::{Error, Result};

const KEY_BYTES: usize = 16;
const DIGEST_BYTES: usize = 32;
const SIDECAR_SUFFIX: &str = ".apikey";

/// Process-wide map from upper-cased database name to token digest.
#[derive(Default)]
pub struct ApiKeyStore {
    keys: RwLock<HashMap<String, [u8; DIGEST_BYTES]>>,
}

impl ApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh key for `name`, store its digest in memory and in the
    /// sidecar file, and return the printable token. Also used for rotation:
    /// an existing entry is overwritten.
    pub fn install(&self, db_folder: &Path, name: &str) -> Result<String> {
        let upper = name.to_uppercase();

        let mut raw = [0u8; KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);

        // Clients send the printable form back, so that is what gets hashed.
        let digest: [u8; DIGEST_BYTES] = Sha256::digest(token.as_bytes()).into();

        self.keys.write().insert(upper.clone(), digest);
        fs::write(sidecar_path(db_folder, &upper), digest)?;

        Ok(token)
    }

    /// Validate a candidate token for `name` with a constant-time digest
    /// comparison. Unknown databases never validate.
    pub fn is_valid(&self, name: &str, token: &str) -> bool {
        let upper = name.to_uppercase();
        let candidate: [u8; DIGEST_BYTES] = Sha256::digest(token.as_bytes()).into();

        let keys = self.keys.read();
        match keys.get(&upper) {
            Some(stored) => bool::from(stored.ct_eq(&candidate)),
            None => false,
        }
    }

    /// Drop the in-memory entry and the sidecar for a deleted database.
    pub fn remove(&self, db_folder: &Path, name: &str) {
        let upper = name.to_uppercase();
        self.keys.write().remove(&upper);
        let path = sidecar_path(db_folder, &upper);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!(sidecar = %path.display(), "failed to remove api key sidecar: {e}");
            }
        }
    }

    /// Restore digests from `.apikey` sidecars after a restart.
    pub fn restore(&self, db_folder: &Path) -> Result<()> {
        let mut restored = 0usize;
        for entry in fs::read_dir(db_folder)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(stem) = file_name
                .strip_prefix('.')
                .and_then(|s| s.strip_suffix(SIDECAR_SUFFIX))
            else {
                continue;
            };

            let raw = fs::read(entry.path())?;
            let digest: [u8; DIGEST_BYTES] = match raw.as_slice().try_into() {
                Ok(d) => d,
                Err(_) => {
                    warn!(
                        sidecar = %entry.path().display(),
                        "api key sidecar has wrong size ({} bytes), skipping",
                        raw.len()
                    );
                    continue;
                }
            };
            self.keys.write().insert(stem.to_uppercase(), digest);
            restored += 1;
        }
        info!("restored {restored} api keys");
        Ok(())
    }

    /// Whether a digest is registered for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.keys.read().contains_key(&name.to_uppercase())
    }
}

fn sidecar_path(db_folder: &Path, upper: &str) -> PathBuf {
    db_folder.join(format!(".{upper}{SIDECAR_SUFFIX}"))
}

impl std::fmt::Debug for ApiKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak digests through Debug output.
        f.debug_struct("ApiKeyStore")
            .field("databases", &self.keys.read().len())
            .finish()
    }
}

/// Convenience guard used by the wire surfaces: `Unauthorized` unless the
/// token validates.
pub fn require_valid_key(store: &ApiKeyStore, name: &str, token: Option<&str>) -> Result<()> {
    match token {
        None | Some("") => Err(Error::Unauthorized {
            reason: "missing api key".to_string(),
        }),
        Some(token) if store.is_valid(name, token) => Ok(()),
        Some(_) => Err(Error::Unauthorized {
            reason: "invalid api key".to_string(),
        }),
    }
}
