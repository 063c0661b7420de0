//! # Database Registry
//!
//! Process-level map from upper-cased database name to an open [`Db`]. A
//! name appears at most once; lookups normalize case. The registry only
//! stores handles — lifecycle policy (creation, recovery, credential
//! wiring) lives in [`crate::engine::Engine`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::database::Db;

/// Listing row: name, entry count, bucket count.
#[derive(Debug, Clone)]
pub struct DbInfo {
    pub name: String,
    pub entries: u64,
    pub buckets: usize,
}

#[derive(Default)]
pub struct Registry {
    dbs: RwLock<HashMap<String, Arc<Db>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Db>> {
        self.dbs.read().get(&name.to_uppercase()).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.dbs.read().contains_key(&name.to_uppercase())
    }

    /// Register an open database. Returns false (and leaves the registry
    /// untouched) when the name is already taken.
    pub fn install(&self, db: Arc<Db>) -> bool {
        let mut dbs = self.dbs.write();
        match dbs.entry(db.name().to_string()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(db);
                true
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Db>> {
        self.dbs.write().remove(&name.to_uppercase())
    }

    /// Take every database out of the registry, for shutdown.
    pub fn drain(&self) -> Vec<Arc<Db>> {
        self.dbs.write().drain().map(|(_, db)| db).collect()
    }

    pub fn list(&self) -> Vec<DbInfo> {
        self.dbs
            .read()
            .values()
            .map(|db| DbInfo {
                name: db.name().to_string(),
                entries: db.entry_count(),
                buckets: db.bucket_count(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.dbs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dbs.read().is_empty()
    }
}
