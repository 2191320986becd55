//! Traversal-path dictionaries.
//!
//! A dictionary is a read-optimized `numeric id → materialized ancestry
//! path` cache built by re-running a reconciled projection over its backing
//! ingest table. It resolves deeply nested hierarchical identifiers without
//! recursion at read time.
//!
//! # Generations
//!
//! The active cache is an immutable [`Generation`] behind an `Arc`; a
//! rebuild constructs the next generation off to the side and swaps the
//! pointer. Lookups clone the `Arc` under a read lock and keep serving the
//! old generation while a rebuild is in flight — the staleness window is
//! bounded by the refresh interval, and a failed rebuild simply leaves the
//! previous generation in place.
//!
//! # Resolution contract
//!
//! `resolve(id, default)` returns `default` when `id` is zero, unknown, or
//! was tombstoned as of the last refresh (tombstoned rows never enter a
//! generation because the rebuild reconciles its input). Access grants are
//! enforced one level up, by `Pipeline` — never by silently returning the
//! default.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::CascadeError;
use crate::table::VersionedTable;
use crate::value::Value;
use crate::version::Version;

/// Declaration of a dictionary: primary key, rebuild projection, refresh
/// interval bounds, and the in-memory cache bound.
#[derive(Debug, Clone, PartialEq)]
pub struct DictionaryDef {
    pub name: String,
    /// Ingest table the rebuild query reconciles.
    pub source_table: String,
    /// Numeric key column in the source table.
    pub key_column: String,
    /// Path column in the source table.
    pub path_column: String,
    /// Lower bound of the refresh interval, seconds.
    pub refresh_lower_secs: u64,
    /// Upper bound of the refresh interval, seconds.
    pub refresh_upper_secs: u64,
    /// Bound on the in-memory cache; a rebuild producing more entries fails.
    pub max_entries: usize,
    /// Grant required for lookups, if any.
    pub required_grant: Option<String>,
    /// Optional explicit schedule: a duration string (`"5m"`) or a cron
    /// expression. Absent, refresh uses the midpoint of the bounds.
    pub schedule: Option<String>,
}

impl DictionaryDef {
    pub fn new(
        name: impl Into<String>,
        source_table: impl Into<String>,
        key_column: impl Into<String>,
        path_column: impl Into<String>,
    ) -> Self {
        DictionaryDef {
            name: name.into(),
            source_table: source_table.into(),
            key_column: key_column.into(),
            path_column: path_column.into(),
            refresh_lower_secs: 60,
            refresh_upper_secs: 300,
            max_entries: 1_000_000,
            required_grant: None,
            schedule: None,
        }
    }

    pub fn with_refresh_bounds(mut self, lower_secs: u64, upper_secs: u64) -> Self {
        self.refresh_lower_secs = lower_secs;
        self.refresh_upper_secs = upper_secs;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_required_grant(mut self, grant: impl Into<String>) -> Self {
        self.required_grant = Some(grant.into());
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    pub fn validate(&self) -> Result<(), CascadeError> {
        if self.name.is_empty() {
            return Err(CascadeError::InvalidArgument(
                "dictionary name cannot be empty".into(),
            ));
        }
        if self.refresh_lower_secs == 0 || self.refresh_lower_secs > self.refresh_upper_secs {
            return Err(CascadeError::InvalidArgument(format!(
                "dictionary '{}': refresh bounds must satisfy 0 < lower <= upper, got {}..{}",
                self.name, self.refresh_lower_secs, self.refresh_upper_secs
            )));
        }
        if self.max_entries == 0 {
            return Err(CascadeError::InvalidArgument(format!(
                "dictionary '{}': max_entries must be positive",
                self.name
            )));
        }
        Ok(())
    }

    /// Effective refresh interval when no explicit schedule is set: the
    /// midpoint of the declared bounds.
    pub fn effective_refresh_secs(&self) -> u64 {
        self.refresh_lower_secs + (self.refresh_upper_secs - self.refresh_lower_secs) / 2
    }
}

/// One immutable cache generation.
#[derive(Debug, Default)]
pub struct Generation {
    entries: HashMap<i64, String>,
    /// Maximum source row version that contributed, if any.
    pub built_from: Option<Version>,
    /// Monotonic rebuild counter; generation 0 is the empty initial cache.
    pub ordinal: u64,
}

/// A traversal-path dictionary: declaration plus the active generation.
#[derive(Debug)]
pub struct PathDictionary {
    def: DictionaryDef,
    current: RwLock<Arc<Generation>>,
}

impl PathDictionary {
    pub fn new(def: DictionaryDef) -> Result<Self, CascadeError> {
        def.validate()?;
        Ok(PathDictionary {
            def,
            current: RwLock::new(Arc::new(Generation::default())),
        })
    }

    pub fn def(&self) -> &DictionaryDef {
        &self.def
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Snapshot of the active generation.
    pub fn generation(&self) -> Arc<Generation> {
        self.current.read().clone()
    }

    pub fn generation_ordinal(&self) -> u64 {
        self.current.read().ordinal
    }

    pub fn len(&self) -> usize {
        self.current.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().entries.is_empty()
    }

    /// Resolve an id to its path, or `default` for zero/unknown ids.
    pub fn resolve(&self, id: i64, default: &str) -> String {
        if id == 0 {
            return default.to_string();
        }
        let generation = self.current.read().clone();
        match generation.entries.get(&id) {
            Some(path) => path.clone(),
            None => default.to_string(),
        }
    }

    /// Resolve from a cell value; NULL and non-integer values take the
    /// default.
    pub fn resolve_value(&self, value: &Value, default: &str) -> String {
        match value.as_i64() {
            Some(id) => self.resolve(id, default),
            None => default.to_string(),
        }
    }

    /// Rebuild the cache from a reconciled scan of the source table and
    /// swap in the new generation.
    ///
    /// Reconciliation already excludes tombstones, which is what upholds the
    /// "never resolve a tombstoned id" invariant. A rebuild exceeding
    /// `max_entries` fails without touching the active generation. Returns
    /// the entry count of the new generation.
    pub fn rebuild_from(&self, source: &VersionedTable) -> Result<usize, CascadeError> {
        let source_def = source.def();
        let key_idx = source_def.require_column(&self.def.key_column)?;
        let path_idx = source_def.require_column(&self.def.path_column)?;

        let rows = source.reconciled_stored();
        let mut entries = HashMap::with_capacity(rows.len().min(self.def.max_entries));
        let mut built_from: Option<Version> = None;

        for row in &rows {
            let Some(id) = row.values.get(key_idx).and_then(|v| v.as_i64()) else {
                continue;
            };
            let Some(path) = row.values.get(path_idx).and_then(|v| v.as_str()) else {
                continue;
            };
            if id == 0 {
                continue;
            }
            entries.insert(id, path.to_string());
            if entries.len() > self.def.max_entries {
                return Err(CascadeError::DictionaryCapacity {
                    dictionary: self.def.name.clone(),
                    entries: entries.len(),
                    max_entries: self.def.max_entries,
                });
            }
            built_from = built_from.max(Some(row.version));
        }

        let count = entries.len();
        let mut slot = self.current.write();
        let next = Generation {
            entries,
            built_from,
            ordinal: slot.ordinal + 1,
        };
        *slot = Arc::new(next);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, TableDef};
    use crate::table::Row;
    use crate::value::DataType;

    fn namespaces() -> VersionedTable {
        VersionedTable::new(TableDef::replacing(
            "namespaces",
            vec![
                ColumnDef::new("id", DataType::Int64),
                ColumnDef::new("traversal_path", DataType::String),
            ],
            &["id"],
        ))
        .unwrap()
    }

    fn ns_row(id: i64, path: &str, v: i64) -> Row {
        Row::new(
            vec![Value::Int64(id), Value::String(path.into())],
            Version(v),
        )
    }

    fn dict() -> PathDictionary {
        PathDictionary::new(DictionaryDef::new(
            "namespace_paths",
            "namespaces",
            "id",
            "traversal_path",
        ))
        .unwrap()
    }

    #[test]
    fn test_initial_generation_is_empty_ordinal_zero() {
        let d = dict();
        assert!(d.is_empty());
        assert_eq!(d.generation_ordinal(), 0);
        assert_eq!(d.resolve(5, "0/"), "0/");
    }

    #[test]
    fn test_rebuild_and_resolve() {
        let t = namespaces();
        t.append(vec![ns_row(5, "0/5/", 10), ns_row(7, "0/7/", 10)])
            .unwrap();

        let d = dict();
        let count = d.rebuild_from(&t).unwrap();
        assert_eq!(count, 2);
        assert_eq!(d.generation_ordinal(), 1);
        assert_eq!(d.resolve(5, "0/"), "0/5/");
        assert_eq!(d.resolve(7, "0/"), "0/7/");
    }

    #[test]
    fn test_zero_and_unknown_resolve_to_default() {
        let t = namespaces();
        t.append(vec![ns_row(5, "0/5/", 10)]).unwrap();
        let d = dict();
        d.rebuild_from(&t).unwrap();

        assert_eq!(d.resolve(0, "0/"), "0/");
        assert_eq!(d.resolve(999, "0/"), "0/");
    }

    #[test]
    fn test_tombstoned_id_not_resolved_after_refresh() {
        let t = namespaces();
        t.append(vec![ns_row(5, "0/5/", 10)]).unwrap();
        let d = dict();
        d.rebuild_from(&t).unwrap();
        assert_eq!(d.resolve(5, "0/"), "0/5/");

        t.append(vec![Row::tombstone(
            vec![Value::Int64(5), Value::String(String::new())],
            Version(20),
        )])
        .unwrap();
        d.rebuild_from(&t).unwrap();
        assert_eq!(d.resolve(5, "0/"), "0/");
    }

    #[test]
    fn test_stale_generation_serves_until_refresh() {
        let t = namespaces();
        t.append(vec![ns_row(5, "0/5/", 10)]).unwrap();
        let d = dict();
        d.rebuild_from(&t).unwrap();

        // Source moves on; the active generation is a point-in-time
        // materialization with a bounded staleness window.
        t.append(vec![ns_row(5, "0/9/5/", 20)]).unwrap();
        assert_eq!(d.resolve(5, "0/"), "0/5/");

        d.rebuild_from(&t).unwrap();
        assert_eq!(d.resolve(5, "0/"), "0/9/5/");
    }

    #[test]
    fn test_capacity_exceeded_keeps_previous_generation() {
        let t = namespaces();
        t.append(vec![ns_row(1, "0/1/", 10)]).unwrap();

        let d = PathDictionary::new(
            DictionaryDef::new("small", "namespaces", "id", "traversal_path")
                .with_max_entries(1),
        )
        .unwrap();
        d.rebuild_from(&t).unwrap();
        assert_eq!(d.resolve(1, "0/"), "0/1/");

        t.append(vec![ns_row(2, "0/2/", 10), ns_row(3, "0/3/", 10)])
            .unwrap();
        let err = d.rebuild_from(&t).unwrap_err();
        assert!(matches!(err, CascadeError::DictionaryCapacity { .. }));
        // Old generation untouched.
        assert_eq!(d.generation_ordinal(), 1);
        assert_eq!(d.resolve(1, "0/"), "0/1/");
    }

    #[test]
    fn test_resolve_value_null_defaults() {
        let d = dict();
        assert_eq!(d.resolve_value(&Value::Null, "0/"), "0/");
        assert_eq!(d.resolve_value(&Value::String("x".into()), "0/"), "0/");
    }

    #[test]
    fn test_validate_bounds() {
        let bad = DictionaryDef::new("d", "t", "k", "p").with_refresh_bounds(300, 60);
        assert!(bad.validate().is_err());
        let zero = DictionaryDef::new("d", "t", "k", "p").with_refresh_bounds(0, 60);
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_effective_refresh_midpoint() {
        let d = DictionaryDef::new("d", "t", "k", "p").with_refresh_bounds(60, 300);
        assert_eq!(d.effective_refresh_secs(), 180);
    }
}
