//! Replication-source interface.
//!
//! The upstream change-capture producer emits rows as
//! `{payload, replicated_at, deleted}` with at-least-once delivery:
//! duplicates and out-of-order arrival are expected, which is exactly why
//! the replication timestamp becomes the row's version. The pipeline never
//! mutates payload fields — it only consumes them.

use crate::error::CascadeError;
use crate::pipeline::{Pipeline, PropagationReport};
use crate::table::Row;
use crate::value::Value;
use crate::version::Version;

/// One replicated row as delivered by the change-capture producer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatedRow {
    /// Payload values matching the ingest table's columns.
    pub payload: Vec<Value>,
    /// Capture timestamp; becomes the row version.
    pub replicated_at: Version,
    /// Tombstone flag.
    pub deleted: bool,
}

impl ReplicatedRow {
    pub fn upsert(payload: Vec<Value>, replicated_at: Version) -> Self {
        ReplicatedRow {
            payload,
            replicated_at,
            deleted: false,
        }
    }

    pub fn tombstone(payload: Vec<Value>, replicated_at: Version) -> Self {
        ReplicatedRow {
            payload,
            replicated_at,
            deleted: true,
        }
    }
}

/// Append a replicated batch to an ingest table, firing its propagation
/// rules synchronously.
///
/// Typed-column coercion is the only validation; a malformed row rejects
/// the batch atomically and the source retries.
pub fn ingest(
    pipeline: &Pipeline,
    table: &str,
    batch: Vec<ReplicatedRow>,
) -> Result<PropagationReport, CascadeError> {
    let rows = batch
        .into_iter()
        .map(|r| Row {
            values: r.payload,
            version: r.replicated_at,
            deleted: r.deleted,
        })
        .collect();
    pipeline.insert(table, rows)
}
