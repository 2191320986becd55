//! Catalog layer — registries of tables and dictionaries.
//!
//! The catalog owns every table and dictionary handle and a monotonic
//! schema epoch that bumps on any structural change. Long-lived observers
//! (the refresh scheduler) compare the epoch instead of diffing the
//! registries.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::dictionary::{DictionaryDef, PathDictionary};
use crate::error::CascadeError;
use crate::schema::TableDef;
use crate::table::VersionedTable;

#[derive(Default)]
pub struct Catalog {
    tables: RwLock<HashMap<String, Arc<VersionedTable>>>,
    dictionaries: RwLock<HashMap<String, Arc<PathDictionary>>>,
    epoch: AtomicU64,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic counter of structural changes.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    // ── Tables ─────────────────────────────────────────────────────────

    pub fn create_table(&self, def: TableDef) -> Result<Arc<VersionedTable>, CascadeError> {
        let name = def.name.clone();
        let table = Arc::new(VersionedTable::new(def)?);
        let mut tables = self.tables.write();
        if tables.contains_key(&name) {
            return Err(CascadeError::AlreadyExists(format!("table '{name}'")));
        }
        tables.insert(name, table.clone());
        drop(tables);
        self.bump_epoch();
        Ok(table)
    }

    /// Idempotent create. Returns `(handle, created)`.
    pub fn create_table_if_not_exists(
        &self,
        def: TableDef,
    ) -> Result<(Arc<VersionedTable>, bool), CascadeError> {
        let name = def.name.clone();
        {
            let tables = self.tables.read();
            if let Some(existing) = tables.get(&name) {
                return Ok((existing.clone(), false));
            }
        }
        match self.create_table(def) {
            Ok(t) => Ok((t, true)),
            // Lost a race with a concurrent create; the table exists now.
            Err(CascadeError::AlreadyExists(_)) => {
                let t = self.table(&name)?;
                Ok((t, false))
            }
            Err(e) => Err(e),
        }
    }

    /// Idempotent drop. Returns whether the table existed.
    pub fn drop_table_if_exists(&self, name: &str) -> bool {
        let removed = self.tables.write().remove(name).is_some();
        if removed {
            self.bump_epoch();
        }
        removed
    }

    pub fn table(&self, name: &str) -> Result<Arc<VersionedTable>, CascadeError> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CascadeError::UnknownTable(name.to_string()))
    }

    pub fn try_table(&self, name: &str) -> Option<Arc<VersionedTable>> {
        self.tables.read().get(name).cloned()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    // ── Dictionaries ───────────────────────────────────────────────────

    pub fn register_dictionary(
        &self,
        def: DictionaryDef,
    ) -> Result<Arc<PathDictionary>, CascadeError> {
        let name = def.name.clone();
        let dict = Arc::new(PathDictionary::new(def)?);
        let mut dicts = self.dictionaries.write();
        if dicts.contains_key(&name) {
            return Err(CascadeError::AlreadyExists(format!("dictionary '{name}'")));
        }
        dicts.insert(name, dict.clone());
        drop(dicts);
        self.bump_epoch();
        Ok(dict)
    }

    /// Idempotent registration. Returns `(handle, created)`.
    pub fn register_dictionary_if_absent(
        &self,
        def: DictionaryDef,
    ) -> Result<(Arc<PathDictionary>, bool), CascadeError> {
        {
            let dicts = self.dictionaries.read();
            if let Some(existing) = dicts.get(&def.name) {
                return Ok((existing.clone(), false));
            }
        }
        self.register_dictionary(def).map(|d| (d, true))
    }

    pub fn drop_dictionary_if_exists(&self, name: &str) -> bool {
        let removed = self.dictionaries.write().remove(name).is_some();
        if removed {
            self.bump_epoch();
        }
        removed
    }

    pub fn dictionary(&self, name: &str) -> Result<Arc<PathDictionary>, CascadeError> {
        self.dictionaries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CascadeError::UnknownDictionary(name.to_string()))
    }

    pub fn dictionary_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dictionaries.read().keys().cloned().collect();
        names.sort();
        names
    }
}
