//! Append-only versioned tables.
//!
//! A [`VersionedTable`] stores physical rows exactly as appended — including
//! duplicates, stale versions, and tombstones — and assigns each row a
//! monotonic insertion sequence. Nothing is ever updated in place; all
//! mutation is by appending a dominating version (or a tombstone) and
//! letting reconciliation collapse the key at read time.
//!
//! [`VersionedTable::compact`] is the background physical deduplication:
//! it rewrites the part list down to the reconciled row set. It runs on an
//! engine-chosen schedule and is explicitly *not* awaited by any reader or
//! propagation rule — every read path reconciles logically regardless.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::CascadeError;
use crate::reconcile;
use crate::schema::{ColumnDef, TableDef};
use crate::value::Value;
use crate::version::Version;

/// A logical row as handed to `append` and returned by reconciled reads.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub values: Vec<Value>,
    pub version: Version,
    pub deleted: bool,
}

impl Row {
    /// A live row.
    pub fn new(values: Vec<Value>, version: Version) -> Self {
        Row {
            values,
            version,
            deleted: false,
        }
    }

    /// A tombstone: the key's payload columns may carry anything; the
    /// deletion flag is what matters.
    pub fn tombstone(values: Vec<Value>, version: Version) -> Self {
        Row {
            values,
            version,
            deleted: true,
        }
    }
}

/// A physical row: a [`Row`] plus its insertion sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub values: Vec<Value>,
    pub version: Version,
    pub deleted: bool,
    /// Per-table monotonic insertion sequence; the documented tie-break for
    /// identical (key, version) pairs.
    pub seq: u64,
}

impl StoredRow {
    pub fn to_row(&self) -> Row {
        Row {
            values: self.values.clone(),
            version: self.version,
            deleted: self.deleted,
        }
    }
}

#[derive(Debug)]
struct Parts {
    rows: Vec<StoredRow>,
    next_seq: u64,
}

/// An append-only, internally synchronized versioned table.
#[derive(Debug)]
pub struct VersionedTable {
    def: RwLock<Arc<TableDef>>,
    parts: RwLock<Parts>,
}

impl VersionedTable {
    pub fn new(def: TableDef) -> Result<Self, CascadeError> {
        def.validate()?;
        Ok(VersionedTable {
            def: RwLock::new(Arc::new(def)),
            parts: RwLock::new(Parts {
                rows: Vec::new(),
                next_seq: 0,
            }),
        })
    }

    pub fn name(&self) -> String {
        self.def.read().name.clone()
    }

    /// Snapshot of the current definition.
    pub fn def(&self) -> Arc<TableDef> {
        self.def.read().clone()
    }

    /// Append a batch of rows.
    ///
    /// Every row is coerced against the declared column types first; a
    /// malformed row rejects the whole batch before any mutation (there is
    /// no partial-row recovery — the producer retries the batch). On
    /// success, returns the coerced batch, which is what propagation rules
    /// receive.
    pub fn append(&self, batch: Vec<Row>) -> Result<Vec<Row>, CascadeError> {
        let def = self.def();
        let key_indices = def.dedup_indices();

        let mut coerced = Vec::with_capacity(batch.len());
        for row in batch {
            coerced.push(coerce_row(&def, &key_indices, row)?);
        }

        let mut parts = self.parts.write();
        for row in &coerced {
            let seq = parts.next_seq;
            parts.next_seq += 1;
            parts.rows.push(StoredRow {
                values: row.values.clone(),
                version: row.version,
                deleted: row.deleted,
                seq,
            });
        }
        Ok(coerced)
    }

    /// Clone of the physical row set, duplicates and tombstones included.
    pub fn physical(&self) -> Vec<StoredRow> {
        self.parts.read().rows.clone()
    }

    pub fn physical_len(&self) -> usize {
        self.parts.read().rows.len()
    }

    /// Reconciled read: the current logical rows (see `reconcile`).
    pub fn reconciled(&self) -> Vec<Row> {
        self.reconciled_stored()
            .iter()
            .map(StoredRow::to_row)
            .collect()
    }

    /// Reconciled read keeping insertion sequences.
    pub fn reconciled_stored(&self) -> Vec<StoredRow> {
        let def = self.def();
        let parts = self.parts.read();
        reconcile::reconcile(&parts.rows, &def)
    }

    /// Physically deduplicate: rewrite the part list to the compacted set.
    ///
    /// Winning tombstones are retained so late out-of-order versions cannot
    /// resurrect a deleted key. Returns the number of physical rows removed.
    /// Readers never depend on this having run; it only reclaims space and
    /// speeds up future scans.
    pub fn compact(&self) -> usize {
        let def = self.def();
        let mut parts = self.parts.write();
        let before = parts.rows.len();
        parts.rows = reconcile::compact_physical(&parts.rows, &def);
        before - parts.rows.len()
    }

    // ── Schema evolution ───────────────────────────────────────────────

    /// Add a column, padding existing physical rows with `default`.
    ///
    /// Idempotent: returns `Ok(false)` if the column already exists.
    pub fn add_column(&self, column: ColumnDef, default: Value) -> Result<bool, CascadeError> {
        let mut def_slot = self.def.write();
        if def_slot.column(&column.name).is_some() {
            return Ok(false);
        }
        if !default.is_null() {
            let Some(default) = column.data_type.coerce(default.clone()) else {
                return Err(CascadeError::TypeMismatch {
                    table: def_slot.name.clone(),
                    column: column.name.clone(),
                    expected: column.data_type,
                    got: default.type_name().to_string(),
                });
            };
            return self.add_column_locked(&mut *def_slot, column, default);
        }
        if !column.nullable {
            return Err(CascadeError::InvalidArgument(format!(
                "column '{}' is not nullable; a non-null default is required",
                column.name
            )));
        }
        self.add_column_locked(&mut *def_slot, column, Value::Null)
    }

    fn add_column_locked(
        &self,
        def_slot: &mut Arc<TableDef>,
        column: ColumnDef,
        default: Value,
    ) -> Result<bool, CascadeError> {
        let mut new_def = (**def_slot).clone();
        new_def.columns.push(column);
        new_def.validate()?;

        let mut parts = self.parts.write();
        for row in &mut parts.rows {
            row.values.push(default.clone());
        }
        *def_slot = Arc::new(new_def);
        Ok(true)
    }

    /// Drop a column and its stored values.
    ///
    /// Idempotent: returns `Ok(false)` if the column does not exist. Key
    /// columns cannot be dropped.
    pub fn drop_column(&self, name: &str) -> Result<bool, CascadeError> {
        let mut def_slot = self.def.write();
        let Some(idx) = def_slot.column_index(name) else {
            return Ok(false);
        };
        if def_slot.dedup_key.iter().any(|k| k == name)
            || def_slot.sort_key.iter().any(|k| k == name)
        {
            return Err(CascadeError::InvalidArgument(format!(
                "cannot drop key column '{}' from table '{}'",
                name, def_slot.name
            )));
        }

        let mut new_def = (**def_slot).clone();
        new_def.columns.remove(idx);
        new_def.validate()?;

        let mut parts = self.parts.write();
        for row in &mut parts.rows {
            if idx < row.values.len() {
                row.values.remove(idx);
            }
        }
        *def_slot = Arc::new(new_def);
        Ok(true)
    }
}

/// Coerce one row against the table definition.
fn coerce_row(
    def: &TableDef,
    key_indices: &[usize],
    row: Row,
) -> Result<Row, CascadeError> {
    if row.values.len() != def.columns.len() {
        return Err(CascadeError::InvalidArgument(format!(
            "table '{}' expects {} columns, row has {}",
            def.name,
            def.columns.len(),
            row.values.len()
        )));
    }

    let mut values = Vec::with_capacity(row.values.len());
    for (i, (col, value)) in def.columns.iter().zip(row.values).enumerate() {
        if value.is_null() {
            if key_indices.contains(&i) {
                return Err(CascadeError::InvalidArgument(format!(
                    "dedup key column '{}' of table '{}' may not be NULL",
                    col.name, def.name
                )));
            }
            if !col.nullable {
                return Err(CascadeError::TypeMismatch {
                    table: def.name.clone(),
                    column: col.name.clone(),
                    expected: col.data_type,
                    got: "NULL".to_string(),
                });
            }
            values.push(Value::Null);
            continue;
        }

        let got = value.type_name();
        match col.data_type.coerce(value) {
            Some(v) => values.push(v),
            None => {
                return Err(CascadeError::TypeMismatch {
                    table: def.name.clone(),
                    column: col.name.clone(),
                    expected: col.data_type,
                    got: got.to_string(),
                });
            }
        }
    }

    Ok(Row {
        values,
        version: row.version,
        deleted: row.deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TableEngine;
    use crate::value::DataType;

    fn issues() -> VersionedTable {
        VersionedTable::new(TableDef::replacing(
            "issues",
            vec![
                ColumnDef::new("id", DataType::Int64),
                ColumnDef::nullable("title", DataType::String),
            ],
            &["id"],
        ))
        .unwrap()
    }

    fn live(id: i64, title: &str, v: i64) -> Row {
        Row::new(
            vec![Value::Int64(id), Value::String(title.into())],
            Version(v),
        )
    }

    #[test]
    fn test_append_assigns_monotonic_seq() {
        let t = issues();
        t.append(vec![live(1, "a", 10), live(2, "b", 10)]).unwrap();
        t.append(vec![live(3, "c", 10)]).unwrap();
        let phys = t.physical();
        assert_eq!(
            phys.iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_append_coerces_types() {
        let t = VersionedTable::new(TableDef::replacing(
            "t",
            vec![
                ColumnDef::new("id", DataType::UInt64),
                ColumnDef::new("score", DataType::Float64),
            ],
            &["id"],
        ))
        .unwrap();
        let out = t
            .append(vec![Row::new(
                vec![Value::Int64(5), Value::Int64(3)],
                Version(1),
            )])
            .unwrap();
        assert_eq!(out[0].values[0], Value::UInt64(5));
        assert_eq!(out[0].values[1], Value::Float64(3.0));
    }

    #[test]
    fn test_malformed_row_rejects_whole_batch() {
        let t = issues();
        let err = t
            .append(vec![
                live(1, "ok", 10),
                Row::new(vec![Value::String("x".into()), Value::Null], Version(10)),
            ])
            .unwrap_err();
        assert!(matches!(err, CascadeError::TypeMismatch { .. }));
        // Nothing was written.
        assert_eq!(t.physical_len(), 0);
    }

    #[test]
    fn test_null_key_rejected() {
        let t = issues();
        let err = t
            .append(vec![Row::new(
                vec![Value::Null, Value::String("x".into())],
                Version(10),
            )])
            .unwrap_err();
        assert!(matches!(err, CascadeError::InvalidArgument(_)));
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let t = issues();
        let err = t
            .append(vec![Row::new(vec![Value::Int64(1)], Version(10))])
            .unwrap_err();
        assert!(matches!(err, CascadeError::InvalidArgument(_)));
    }

    #[test]
    fn test_reconciled_read_collapses() {
        let t = issues();
        t.append(vec![live(1, "old", 10)]).unwrap();
        t.append(vec![live(1, "new", 20)]).unwrap();
        t.append(vec![Row::tombstone(
            vec![Value::Int64(2), Value::Null],
            Version(20),
        )])
        .unwrap();

        let rows = t.reconciled();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values[1], Value::String("new".into()));
        // Physical storage still holds everything.
        assert_eq!(t.physical_len(), 3);
    }

    #[test]
    fn test_compact_preserves_reconciled_view() {
        let t = issues();
        t.append(vec![live(1, "a", 10), live(1, "b", 20), live(2, "c", 10)])
            .unwrap();
        t.append(vec![Row::tombstone(
            vec![Value::Int64(2), Value::Null],
            Version(30),
        )])
        .unwrap();

        let before = t.reconciled();
        let removed = t.compact();
        assert!(removed > 0);
        assert_eq!(t.reconciled(), before);
        // One live winner for key 1, plus the retained tombstone for key 2.
        assert_eq!(t.physical_len(), 2);
    }

    #[test]
    fn test_compact_keeps_tombstone_against_out_of_order_arrival() {
        let t = issues();
        t.append(vec![live(1, "a", 10)]).unwrap();
        t.append(vec![Row::tombstone(
            vec![Value::Int64(1), Value::Null],
            Version(30),
        )])
        .unwrap();
        t.compact();
        // A replicated duplicate of the old version arrives late.
        t.append(vec![live(1, "a", 10)]).unwrap();
        assert!(t.reconciled().is_empty(), "tombstone must keep suppressing");
    }

    #[test]
    fn test_add_column_pads_existing_rows() {
        let t = issues();
        t.append(vec![live(1, "a", 10)]).unwrap();
        let added = t
            .add_column(
                ColumnDef::nullable("weight", DataType::Int64),
                Value::Null,
            )
            .unwrap();
        assert!(added);
        let rows = t.reconciled();
        assert_eq!(rows[0].values.len(), 3);
        assert_eq!(rows[0].values[2], Value::Null);

        // Idempotent.
        let again = t
            .add_column(
                ColumnDef::nullable("weight", DataType::Int64),
                Value::Null,
            )
            .unwrap();
        assert!(!again);
    }

    #[test]
    fn test_add_non_nullable_column_requires_default() {
        let t = issues();
        let err = t
            .add_column(ColumnDef::new("n", DataType::Int64), Value::Null)
            .unwrap_err();
        assert!(matches!(err, CascadeError::InvalidArgument(_)));

        let ok = t
            .add_column(ColumnDef::new("n", DataType::Int64), Value::Int64(0))
            .unwrap();
        assert!(ok);
    }

    #[test]
    fn test_drop_column() {
        let t = issues();
        t.append(vec![live(1, "a", 10)]).unwrap();
        assert!(t.drop_column("title").unwrap());
        assert_eq!(t.reconciled()[0].values.len(), 1);
        // Idempotent.
        assert!(!t.drop_column("title").unwrap());
        // Key columns protected.
        assert!(t.drop_column("id").is_err());
    }

    #[test]
    fn test_additive_table_reconciled_merges() {
        let t = VersionedTable::new(TableDef::additive(
            "agg",
            vec![
                ColumnDef::new("k", DataType::Int64),
                ColumnDef::new("count", DataType::UInt64),
            ],
            &["k"],
        ))
        .unwrap();
        assert_eq!(t.def().engine, TableEngine::Additive);
        t.append(vec![
            Row::new(vec![Value::Int64(1), Value::UInt64(2)], Version(10)),
            Row::new(vec![Value::Int64(1), Value::UInt64(3)], Version(20)),
        ])
        .unwrap();
        let rows = t.reconciled();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values[1], Value::UInt64(5));
    }
}
