//! Table definitions and DDL-shape conventions.
//!
//! Every versioned table declares:
//! - its ordered, typed columns,
//! - a `dedup_key` (the business-key columns reconciliation groups by),
//! - a `sort_key` (the composite read-ordering key; defaults to the dedup
//!   key). Denormalized hierarchy tables put the hierarchical path first in
//!   the sort key while keeping the entity id as the dedup key, so an entity
//!   whose path moved still collapses to one current row.
//! - an engine: `Replacing` (last-version-wins) or `Additive` (mergeable
//!   partial-aggregate state).
//!
//! Definitions serialize with serde; [`TableDef::fingerprint`] hashes the
//! serialized form so schema drift can be detected with a string compare.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CascadeError;
use crate::value::DataType;

/// A single column declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnDef {
    /// A non-nullable column.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        ColumnDef {
            name: name.into(),
            data_type,
            nullable: false,
        }
    }

    /// A nullable column.
    pub fn nullable(name: impl Into<String>, data_type: DataType) -> Self {
        ColumnDef {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }
}

/// How reads collapse the physical row set for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableEngine {
    /// Last-version-wins per dedup key; tombstones remove the key.
    Replacing,
    /// Rows per dedup key merge: numeric columns sum, sketches merge.
    /// Physical duplicates sharing (key, version) collapse first, which is
    /// what makes partition backfill idempotent.
    Additive,
}

/// A table definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Business-key columns used by reconciliation.
    pub dedup_key: Vec<String>,
    /// Read-ordering composite key. Empty means "same as dedup_key".
    pub sort_key: Vec<String>,
    pub engine: TableEngine,
}

impl TableDef {
    /// A replacing (last-version-wins) table.
    pub fn replacing(
        name: impl Into<String>,
        columns: Vec<ColumnDef>,
        dedup_key: &[&str],
    ) -> Self {
        TableDef {
            name: name.into(),
            columns,
            dedup_key: dedup_key.iter().map(|s| s.to_string()).collect(),
            sort_key: Vec::new(),
            engine: TableEngine::Replacing,
        }
    }

    /// An additive (partial-aggregate merging) table.
    pub fn additive(name: impl Into<String>, columns: Vec<ColumnDef>, dedup_key: &[&str]) -> Self {
        TableDef {
            name: name.into(),
            columns,
            dedup_key: dedup_key.iter().map(|s| s.to_string()).collect(),
            sort_key: Vec::new(),
            engine: TableEngine::Additive,
        }
    }

    /// Override the sort key (e.g. path-first for hierarchy tables).
    pub fn with_sort_key(mut self, sort_key: &[&str]) -> Self {
        self.sort_key = sort_key.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Validate internal consistency: names unique, keys resolve, dedup key
    /// non-empty, key columns not nullable sketches.
    pub fn validate(&self) -> Result<(), CascadeError> {
        if self.name.is_empty() {
            return Err(CascadeError::InvalidArgument(
                "table name cannot be empty".into(),
            ));
        }
        if self.columns.is_empty() {
            return Err(CascadeError::InvalidArgument(format!(
                "table '{}' declares no columns",
                self.name
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for col in &self.columns {
            if !seen.insert(col.name.as_str()) {
                return Err(CascadeError::InvalidArgument(format!(
                    "table '{}' declares duplicate column '{}'",
                    self.name, col.name
                )));
            }
        }

        if self.dedup_key.is_empty() {
            return Err(CascadeError::InvalidArgument(format!(
                "table '{}' must declare at least one dedup key column",
                self.name
            )));
        }

        for key in self.dedup_key.iter().chain(self.sort_key.iter()) {
            let col = self.column(key).ok_or_else(|| CascadeError::UnknownColumn {
                table: self.name.clone(),
                column: key.clone(),
            })?;
            if col.data_type == DataType::Sketch {
                return Err(CascadeError::InvalidArgument(format!(
                    "table '{}': sketch column '{}' cannot be key material",
                    self.name, key
                )));
            }
        }

        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Resolve a column name to its index or an [`CascadeError::UnknownColumn`].
    pub fn require_column(&self, name: &str) -> Result<usize, CascadeError> {
        self.column_index(name)
            .ok_or_else(|| CascadeError::UnknownColumn {
                table: self.name.clone(),
                column: name.to_string(),
            })
    }

    /// Indices of the dedup key columns, in declaration order.
    pub fn dedup_indices(&self) -> Vec<usize> {
        self.dedup_key
            .iter()
            .filter_map(|k| self.column_index(k))
            .collect()
    }

    /// Indices of the effective sort key columns.
    pub fn sort_indices(&self) -> Vec<usize> {
        let key = if self.sort_key.is_empty() {
            &self.dedup_key
        } else {
            &self.sort_key
        };
        key.iter().filter_map(|k| self.column_index(k)).collect()
    }

    /// SHA-256 fingerprint of the serialized definition.
    ///
    /// Two defs fingerprint equal iff their serialized forms are equal;
    /// used for fast schema-drift equality checks.
    pub fn fingerprint(&self) -> String {
        let serialized = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&serialized);
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TableDef {
        TableDef::replacing(
            "issues",
            vec![
                ColumnDef::new("id", DataType::Int64),
                ColumnDef::nullable("title", DataType::String),
                ColumnDef::new("project_id", DataType::Int64),
            ],
            &["id"],
        )
    }

    #[test]
    fn test_validate_ok() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_dedup_key() {
        let mut def = sample();
        def.dedup_key.clear();
        assert!(matches!(
            def.validate(),
            Err(CascadeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_key_column() {
        let mut def = sample();
        def.dedup_key = vec!["nope".into()];
        assert!(matches!(
            def.validate(),
            Err(CascadeError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_columns() {
        let mut def = sample();
        def.columns.push(ColumnDef::new("id", DataType::Int64));
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_sketch_key() {
        let mut def = sample();
        def.columns.push(ColumnDef::new("q", DataType::Sketch));
        def.dedup_key = vec!["q".into()];
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_sort_indices_default_to_dedup() {
        let def = sample();
        assert_eq!(def.sort_indices(), def.dedup_indices());
    }

    #[test]
    fn test_sort_key_override() {
        let def = TableDef::replacing(
            "hierarchy_issues",
            vec![
                ColumnDef::new("path", DataType::String),
                ColumnDef::new("id", DataType::Int64),
            ],
            &["id"],
        )
        .with_sort_key(&["path", "id"]);
        assert_eq!(def.sort_indices(), vec![0, 1]);
        assert_eq!(def.dedup_indices(), vec![1]);
    }

    #[test]
    fn test_fingerprint_stable_and_sensitive() {
        let a = sample();
        let b = sample();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut c = sample();
        c.columns[1].nullable = false;
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_serde_roundtrip() {
        let def = sample();
        let json = serde_json::to_string(&def).unwrap();
        let back: TableDef = serde_json::from_str(&json).unwrap();
        assert_eq!(def, back);
    }
}
