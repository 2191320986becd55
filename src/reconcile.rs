//! Read-time reconciliation of versioned rows.
//!
//! This is the single most important correctness rule in the pipeline.
//! Physical deduplication (compaction) is asynchronous and must be assumed
//! *not yet done* by every reader, so every dictionary rebuild, every
//! propagation transform, every rollup re-aggregation, and every reconciled
//! read applies these pure functions to its inputs:
//!
//! 1. Group physical rows by business (dedup) key.
//! 2. Select the row with the maximum `(version, seq)` per group. The
//!    insertion sequence `seq` is the documented tie-break for two physical
//!    rows sharing an identical key and version — a data-quality condition,
//!    not a protocol guarantee.
//! 3. Discard groups whose selected row is a tombstone.
//!
//! Additive tables replace step 2 with a merge: duplicates sharing
//! `(key, version)` collapse first (they are replicated copies of one
//! logical row — this is what makes partition backfill idempotent), then
//! the surviving distinct versions merge per key by summing numeric columns
//! and merging sketches.
//!
//! Output is sorted by the table's sort-key encoding, so consumers see a
//! deterministic order regardless of physical insertion order.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::schema::{TableDef, TableEngine};
use crate::table::StoredRow;
use crate::value::{DataType, Value};

/// Stable byte encoding of the key columns at `indices`.
pub fn encode_key(values: &[Value], indices: &[usize]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(indices.len() * 9);
    for &i in indices {
        match values.get(i) {
            Some(v) => v.encode_to(&mut buf),
            None => Value::Null.encode_to(&mut buf),
        }
    }
    buf
}

/// Collapse a physical row set according to the table's engine.
pub fn reconcile(rows: &[StoredRow], def: &TableDef) -> Vec<StoredRow> {
    match def.engine {
        TableEngine::Replacing => reconcile_replacing(rows, def),
        TableEngine::Additive => reconcile_additive(rows, def),
    }
}

/// Last-version-wins, tombstone-excluding reconciliation.
pub fn reconcile_replacing(rows: &[StoredRow], def: &TableDef) -> Vec<StoredRow> {
    let key = def.dedup_indices();
    let mut best: HashMap<Vec<u8>, &StoredRow> = HashMap::new();

    for row in rows {
        let k = encode_key(&row.values, &key);
        match best.entry(k) {
            Entry::Occupied(mut e) => {
                if (e.get().version, e.get().seq) < (row.version, row.seq) {
                    e.insert(row);
                }
            }
            Entry::Vacant(e) => {
                e.insert(row);
            }
        }
    }

    let mut out: Vec<StoredRow> = best
        .into_values()
        .filter(|r| !r.deleted)
        .cloned()
        .collect();
    sort_by_sort_key(&mut out, def);
    out
}

/// Additive reconciliation: collapse exact (key, version) duplicates, drop
/// tombstones, then merge the remaining partial states per key.
pub fn reconcile_additive(rows: &[StoredRow], def: &TableDef) -> Vec<StoredRow> {
    let key = def.dedup_indices();

    // Step 1: (key, version) duplicate collapse — last seq wins.
    let mut distinct: HashMap<Vec<u8>, &StoredRow> = HashMap::new();
    for row in rows {
        let mut k = encode_key(&row.values, &key);
        k.extend_from_slice(&row.version.as_micros().to_le_bytes());
        match distinct.entry(k) {
            Entry::Occupied(mut e) => {
                if e.get().seq < row.seq {
                    e.insert(row);
                }
            }
            Entry::Vacant(e) => {
                e.insert(row);
            }
        }
    }

    // Step 2 + 3: group the surviving versions per key and merge.
    let mut groups: HashMap<Vec<u8>, Vec<&StoredRow>> = HashMap::new();
    for row in distinct.into_values() {
        if row.deleted {
            continue;
        }
        groups
            .entry(encode_key(&row.values, &key))
            .or_default()
            .push(row);
    }

    let mut out: Vec<StoredRow> = groups
        .into_values()
        .map(|group| merge_group(group, def))
        .collect();
    sort_by_sort_key(&mut out, def);
    out
}

/// Physical compaction: the row set a background merge may legally keep.
///
/// Differs from the read-side functions in one way: for replacing tables the
/// winning tombstone per key is *retained* rather than dropped. Dropping it
/// would let an out-of-order older version resurrect a deleted key on a
/// later read. Additive tombstones are inert (reads exclude them before
/// merging), so additive compaction equals the reconciled read.
pub fn compact_physical(rows: &[StoredRow], def: &TableDef) -> Vec<StoredRow> {
    match def.engine {
        TableEngine::Additive => reconcile_additive(rows, def),
        TableEngine::Replacing => {
            let key = def.dedup_indices();
            let mut best: HashMap<Vec<u8>, &StoredRow> = HashMap::new();
            for row in rows {
                let k = encode_key(&row.values, &key);
                match best.entry(k) {
                    Entry::Occupied(mut e) => {
                        if (e.get().version, e.get().seq) < (row.version, row.seq) {
                            e.insert(row);
                        }
                    }
                    Entry::Vacant(e) => {
                        e.insert(row);
                    }
                }
            }
            let mut out: Vec<StoredRow> = best.into_values().cloned().collect();
            sort_by_sort_key(&mut out, def);
            out
        }
    }
}

/// Merge one key group of an additive table into a single partial state.
fn merge_group(mut group: Vec<&StoredRow>, def: &TableDef) -> StoredRow {
    // Deterministic fold order, and the (version, seq) maximum supplies the
    // non-summable columns.
    group.sort_by_key(|r| (r.version, r.seq));
    let winner = group[group.len() - 1];

    let key_indices = def.dedup_indices();
    let mut values = winner.values.clone();

    for (i, col) in def.columns.iter().enumerate() {
        if key_indices.contains(&i) {
            continue;
        }
        match col.data_type {
            DataType::Int64 => {
                let mut any = false;
                let mut acc: i64 = 0;
                for r in &group {
                    if let Some(v) = r.values.get(i).and_then(|v| v.as_i64()) {
                        acc = acc.saturating_add(v);
                        any = true;
                    }
                }
                values[i] = if any { Value::Int64(acc) } else { Value::Null };
            }
            DataType::UInt64 => {
                let mut any = false;
                let mut acc: u64 = 0;
                for r in &group {
                    if let Some(Value::UInt64(v)) = r.values.get(i) {
                        acc = acc.saturating_add(*v);
                        any = true;
                    }
                }
                values[i] = if any { Value::UInt64(acc) } else { Value::Null };
            }
            DataType::Float64 => {
                let mut any = false;
                let mut acc: f64 = 0.0;
                for r in &group {
                    if let Some(v) = r.values.get(i).and_then(|v| v.as_f64()) {
                        acc += v;
                        any = true;
                    }
                }
                values[i] = if any { Value::Float64(acc) } else { Value::Null };
            }
            DataType::Sketch => {
                let mut acc: Option<crate::sketch::QuantileSketch> = None;
                for r in &group {
                    if let Some(Value::Sketch(s)) = r.values.get(i) {
                        match acc.as_mut() {
                            Some(a) => a.merge(s),
                            None => acc = Some(s.clone()),
                        }
                    }
                }
                values[i] = match acc {
                    Some(s) => Value::Sketch(s),
                    None => Value::Null,
                };
            }
            DataType::Timestamp => {
                let max = group
                    .iter()
                    .filter_map(|r| r.values.get(i).and_then(|v| v.as_timestamp_micros()))
                    .max();
                values[i] = match max {
                    Some(t) => Value::Timestamp(t),
                    None => Value::Null,
                };
            }
            // Not meaningfully summable; the winning version's value stands.
            DataType::Bool | DataType::String => {}
        }
    }

    StoredRow {
        values,
        version: winner.version,
        deleted: false,
        seq: winner.seq,
    }
}

fn sort_by_sort_key(rows: &mut [StoredRow], def: &TableDef) {
    let sort = def.sort_indices();
    rows.sort_by(|a, b| {
        encode_key(&a.values, &sort)
            .cmp(&encode_key(&b.values, &sort))
            .then(a.version.cmp(&b.version))
            .then(a.seq.cmp(&b.seq))
    });
}
