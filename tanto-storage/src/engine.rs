//! # Engine Facade
//!
//! The contract the wire surfaces consume. One [`Engine`] owns the
//! configuration, the database registry, and the credential store — no
//! process-wide globals, so two engines can coexist in one process (which is
//! exactly what the tests do).

use std::fs;

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info, warn};

use tanto_core::auth::ApiKeyStore;
use tanto_core::config::Config;
use tanto_core::error::{Error, Result};
use tanto_core::metrics::Metrics;
use tanto_core::utils::valid_db_name;

use crate::database::{Db, DbOptions};
use crate::registry::{DbInfo, Registry};

/// Outcome of [`Engine::new_db`].
#[derive(Debug)]
pub struct CreateOutcome {
    pub name: String,
    pub existed: bool,
    pub created: bool,
    /// Printable token, present only when a credential was generated right
    /// now; it is never shown again.
    pub api_key: Option<String>,
}

pub struct Engine {
    config: Arc<Config>,
    registry: Registry,
    keys: ApiKeyStore,
    metrics: Metrics,
    /// Serializes database creation so a racing pair cannot both replay the
    /// same log file.
    create_lock: RwLock<()>,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.storage.db_folder)?;
        Ok(Self {
            config: Arc::new(config),
            registry: Registry::new(),
            keys: ApiKeyStore::new(),
            metrics: Metrics::new(),
            create_lock: RwLock::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Scan the database folder for `*.bin` logs and reopen each one,
    /// restoring credential sidecars first when authentication is on.
    /// A sidecar without a log is an orphan and is ignored.
    pub fn reload(&self) -> Result<()> {
        let folder = &self.config.storage.db_folder;
        fs::create_dir_all(folder)?;

        if self.config.auth.enabled {
            self.keys.restore(folder)?;
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(folder)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(stem) = file_name.strip_suffix(".bin") else {
                continue;
            };
            // leftover compaction temp from a crash mid-rename
            if stem.ends_with(".tmp") {
                continue;
            }
            names.push(stem.to_string());
        }
        info!("found {} log files in {}", names.len(), folder.display());

        for name in names {
            if !valid_db_name(&name) {
                warn!("skipping log file with invalid database name {name:?}");
                continue;
            }
            if let Err(e) = self.new_db(&name) {
                error!("error reopening database {name}: {e}");
            }
        }
        Ok(())
    }

    /// Create a database (idempotent). When it already exists the outcome
    /// carries `existed: true` and no token. When authentication is on and
    /// no credential is registered yet (i.e. not a restart-restored one), a
    /// token is generated and returned exactly once.
    pub fn new_db(&self, name: &str) -> Result<CreateOutcome> {
        if !valid_db_name(name) {
            return Err(Error::InvalidName {
                name: name.to_string(),
            });
        }
        let upper = name.to_uppercase();

        let _guard = self.create_lock.write();
        if self.registry.exists(&upper) {
            return Ok(CreateOutcome {
                name: upper,
                existed: true,
                created: false,
                api_key: None,
            });
        }

        let opts = DbOptions {
            hash_seed: self.config.storage.hash_seed,
            cpu_multiplier: self.config.storage.cpu_multiplier,
        };
        let db = Arc::new(Db::open(&upper, &self.config.storage.db_folder, &opts)?);
        if !self.registry.install(db.clone()) {
            let _ = db.close();
            return Ok(CreateOutcome {
                name: upper,
                existed: true,
                created: false,
                api_key: None,
            });
        }

        let api_key = if self.config.auth.enabled && !self.keys.contains(&upper) {
            Some(self.keys.install(&self.config.storage.db_folder, &upper)?)
        } else {
            None
        };

        info!("created database {upper}");
        Ok(CreateOutcome {
            name: upper,
            existed: false,
            created: true,
            api_key,
        })
    }

    pub fn db_exists(&self, name: &str) -> bool {
        self.registry.exists(name)
    }

    /// Close a database, remove its log file (and credential) and drop it
    /// from the registry.
    pub fn db_delete(&self, name: &str) -> Result<()> {
        let db = self.registry.remove(name).ok_or_else(|| Error::DatabaseNotFound {
            name: name.to_uppercase(),
        })?;

        if let Err(e) = db.close() {
            error!("error closing database {}: {e}", db.name());
        }
        if let Err(e) = fs::remove_file(db.aof_path()) {
            warn!("error removing log file {}: {e}", db.aof_path().display());
        }
        if self.config.auth.enabled {
            self.keys.remove(&self.config.storage.db_folder, name);
        }
        info!("deleted database {}", db.name());
        Ok(())
    }

    /// Close every registered database, surfacing the per-database errors.
    pub fn close_all(&self) -> Vec<(String, Error)> {
        let mut errors = Vec::new();
        for db in self.registry.drain() {
            if let Err(e) = db.close() {
                errors.push((db.name().to_string(), e));
            }
        }
        errors
    }

    /// Handle for tests and maintenance paths.
    pub fn database(&self, name: &str) -> Option<Arc<Db>> {
        self.registry.get(name)
    }

    fn db(&self, name: &str) -> Result<Arc<Db>> {
        self.registry.get(name).ok_or_else(|| Error::DatabaseNotFound {
            name: name.to_uppercase(),
        })
    }

    /// Pre-insert cap check: true while the table may still grow.
    pub fn check_entries(&self, name: &str) -> Result<bool> {
        Ok(self.db(name)?.entry_count() < self.config.storage.max_entries)
    }

    fn ensure_capacity(&self, db: &Db) -> Result<()> {
        let max = self.config.storage.max_entries;
        if db.entry_count() >= max {
            return Err(Error::Full {
                name: db.name().to_string(),
                max,
            });
        }
        Ok(())
    }

    pub fn set(&self, name: &str, key: Bytes, value: Bytes, ttl: i64) -> Result<bool> {
        let db = self.db(name)?;
        self.ensure_capacity(&db)?;
        self.metrics.record_set();
        Ok(db.set(key, value, ttl))
    }

    /// Returns `Ok(false)` when the key already existed.
    pub fn set_nx(&self, name: &str, key: Bytes, value: Bytes, ttl: i64) -> Result<bool> {
        let db = self.db(name)?;
        self.ensure_capacity(&db)?;
        self.metrics.record_set_nx();
        let inserted = db.set_if_absent(key, value, ttl);
        if !inserted {
            self.metrics.record_conflict();
        }
        Ok(inserted)
    }

    /// Returns `Ok(false)` when the stored value or the amount is not a
    /// signed 64-bit decimal. Exempt from the entry cap: it only grows the
    /// table by at most one entry and matches the original surface.
    pub fn incr(&self, name: &str, key: Bytes, amount: Bytes) -> Result<bool> {
        let db = self.db(name)?;
        self.metrics.record_increment();
        let ok = db.increment(key, amount, 0);
        if !ok {
            self.metrics.record_conflict();
        }
        Ok(ok)
    }

    pub fn get(&self, name: &str, key: &[u8]) -> Result<Option<Bytes>> {
        let db = self.db(name)?;
        let value = db.get(key);
        self.metrics.record_get(value.is_some());
        Ok(value)
    }

    pub fn del(&self, name: &str, key: &[u8]) -> Result<bool> {
        let db = self.db(name)?;
        self.metrics.record_delete();
        Ok(db.delete(key))
    }

    /// Generate (or rotate) the credential for an existing database and
    /// return the printable token.
    pub fn create_api_key(&self, name: &str) -> Result<String> {
        self.db(name)?;
        self.keys.install(&self.config.storage.db_folder, name)
    }

    pub fn is_api_key_valid(&self, name: &str, token: &str) -> bool {
        self.keys.is_valid(name, token)
    }

    pub fn api_keys(&self) -> &ApiKeyStore {
        &self.keys
    }

    pub fn list_dbs(&self) -> Vec<DbInfo> {
        self.registry.list()
    }
}
