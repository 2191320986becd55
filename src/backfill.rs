//! Partitioned backfill and sync-cursor bookkeeping.
//!
//! Historical gaps in a rollup are closed by re-running its propagation
//! rule over reconciled source rows, one coarse time partition at a time.
//! Partitioning bounds per-step cost and makes the whole backfill
//! resumable: each partition's result set is disjoint by construction, a
//! failed partition is retried in isolation, and re-running a partition
//! converges because the transform is deterministic over the reconciled
//! source — an additive target collapses the identical `(key, version)`
//! rows, a replacing target resolves them last-wins.
//!
//! A [`SyncCursorStore`] records the upper bound of the last completed
//! partition per source table, itself as versioned rows. Cursors are used
//! only for idempotent resumption, never for correctness of the live
//! pipeline.

use std::sync::Arc;

use crate::error::CascadeError;
use crate::pipeline::Pipeline;
use crate::propagate::{PropagationRule, RuleContext};
use crate::schema::{ColumnDef, TableDef};
use crate::table::Row;
use crate::value::{DataType, Value};
use crate::version::{Granularity, Version};

/// One half-open time partition `[start, end)` in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub start: i64,
    pub end: i64,
}

/// Outcome of one partition.
#[derive(Debug, Clone)]
pub struct PartitionResult {
    pub partition: Partition,
    pub rows: usize,
    /// Present when the partition failed; other partitions still ran.
    pub error: Option<String>,
}

/// Outcome of a whole backfill run.
#[derive(Debug, Clone, Default)]
pub struct BackfillReport {
    pub partitions: Vec<PartitionResult>,
}

impl BackfillReport {
    pub fn rows_written(&self) -> usize {
        self.partitions.iter().map(|p| p.rows).sum()
    }

    pub fn failed_partitions(&self) -> Vec<&PartitionResult> {
        self.partitions
            .iter()
            .filter(|p| p.error.is_some())
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.partitions.iter().all(|p| p.error.is_none())
    }
}

/// Batch driver reconstructing a rollup from reconciled source history.
pub struct BackfillDriver {
    rule: Arc<dyn PropagationRule>,
    /// Source timestamp column the partitioning ranges over.
    time_column: String,
    granularity: Granularity,
}

impl BackfillDriver {
    pub fn new(
        rule: Arc<dyn PropagationRule>,
        time_column: impl Into<String>,
        granularity: Granularity,
    ) -> Self {
        BackfillDriver {
            rule,
            time_column: time_column.into(),
            granularity,
        }
    }

    /// Partition list covering the reconciled source's time range.
    pub fn partitions(&self, pipeline: &Pipeline) -> Result<Vec<Partition>, CascadeError> {
        let source = pipeline.table(self.rule.source_table())?;
        let def = source.def();
        let idx = def.require_column(&self.time_column)?;

        let mut min: Option<i64> = None;
        let mut max: Option<i64> = None;
        for row in source.reconciled() {
            if let Some(t) = row.values.get(idx).and_then(|v| v.as_timestamp_micros()) {
                min = Some(min.map_or(t, |m| m.min(t)));
                max = Some(max.map_or(t, |m| m.max(t)));
            }
        }
        let (Some(min), Some(max)) = (min, max) else {
            return Ok(Vec::new());
        };

        let mut partitions = Vec::new();
        let mut start = self.granularity.truncate(min);
        while start <= max {
            let end = self.granularity.advance(start);
            partitions.push(Partition { start, end });
            start = end;
        }
        Ok(partitions)
    }

    /// Run every partition; records a sync cursor after each completed one.
    ///
    /// A partition failure is local: it is reported and the remaining
    /// partitions still run.
    pub fn run(&self, pipeline: &Pipeline) -> Result<BackfillReport, CascadeError> {
        self.run_inner(pipeline, None)
    }

    /// Like [`run`](Self::run), but skips partitions at or below the last
    /// recorded cursor — resuming a crashed backfill.
    pub fn resume(&self, pipeline: &Pipeline) -> Result<BackfillReport, CascadeError> {
        let cursor = SyncCursorStore::last(pipeline, self.rule.source_table())?;
        self.run_inner(pipeline, cursor)
    }

    fn run_inner(
        &self,
        pipeline: &Pipeline,
        resume_after: Option<i64>,
    ) -> Result<BackfillReport, CascadeError> {
        SyncCursorStore::ensure(pipeline)?;
        let partitions = self.partitions(pipeline)?;
        let mut report = BackfillReport::default();

        for partition in partitions {
            if let Some(cursor) = resume_after
                && partition.end <= cursor
            {
                log::debug!(
                    "backfill '{}': skipping partition [{}, {}) at cursor {}",
                    self.rule.name(),
                    partition.start,
                    partition.end,
                    cursor
                );
                continue;
            }
            match self.run_partition(pipeline, partition) {
                Ok(rows) => {
                    SyncCursorStore::record(
                        pipeline,
                        self.rule.source_table(),
                        partition.end,
                        Version(partition.end),
                    )?;
                    report.partitions.push(PartitionResult {
                        partition,
                        rows,
                        error: None,
                    });
                }
                Err(e) => {
                    log::warn!(
                        "backfill '{}': partition [{}, {}) failed: {e}",
                        self.rule.name(),
                        partition.start,
                        partition.end
                    );
                    report.partitions.push(PartitionResult {
                        partition,
                        rows: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        log::info!(
            "backfill '{}': {} partition(s), {} row(s), {} failure(s)",
            self.rule.name(),
            report.partitions.len(),
            report.rows_written(),
            report.failed_partitions().len()
        );
        Ok(report)
    }

    /// One bounded step: reconciled source rows inside the partition run
    /// through the rule's transform and append to the target (firing the
    /// target's own downstream rules). Returns rows written.
    pub fn run_partition(
        &self,
        pipeline: &Pipeline,
        partition: Partition,
    ) -> Result<usize, CascadeError> {
        let source = pipeline.table(self.rule.source_table())?;
        let def = source.def();
        let idx = def.require_column(&self.time_column)?;

        let batch: Vec<Row> = source
            .reconciled()
            .into_iter()
            .filter(|row| {
                row.values
                    .get(idx)
                    .and_then(|v| v.as_timestamp_micros())
                    .is_some_and(|t| t >= partition.start && t < partition.end)
            })
            .collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let out = {
            let ctx = RuleContext { pipeline };
            self.rule.transform(&batch, &ctx)?
        };
        if out.is_empty() {
            return Ok(0);
        }
        let written = out.len();
        pipeline.insert(self.rule.target_table(), out)?;
        Ok(written)
    }
}

// ── Sync cursors ───────────────────────────────────────────────────────────

/// Bookkeeping table of the highest primary-key/partition value replicated
/// per source, stored as versioned rows in the pipeline itself.
pub struct SyncCursorStore;

impl SyncCursorStore {
    pub const TABLE: &'static str = "sync_cursors";

    /// Definition of the cursor table: one logical row per source.
    pub fn table_def() -> TableDef {
        TableDef::replacing(
            Self::TABLE,
            vec![
                ColumnDef::new("table_name", DataType::String),
                ColumnDef::new("primary_key_value", DataType::Int64),
                ColumnDef::new("recorded_at", DataType::Timestamp),
            ],
            &["table_name"],
        )
    }

    /// Create the cursor table if missing.
    pub fn ensure(pipeline: &Pipeline) -> Result<(), CascadeError> {
        pipeline.create_table_if_not_exists(Self::table_def())?;
        Ok(())
    }

    /// Record the highest replicated value for a source.
    pub fn record(
        pipeline: &Pipeline,
        source: &str,
        primary_key_value: i64,
        at: Version,
    ) -> Result<(), CascadeError> {
        Self::ensure(pipeline)?;
        pipeline.insert(
            Self::TABLE,
            vec![Row::new(
                vec![
                    Value::String(source.to_string()),
                    Value::Int64(primary_key_value),
                    Value::Timestamp(at.as_micros()),
                ],
                at,
            )],
        )?;
        Ok(())
    }

    /// The last recorded value for a source, if any.
    pub fn last(pipeline: &Pipeline, source: &str) -> Result<Option<i64>, CascadeError> {
        if !pipeline.has_table(Self::TABLE) {
            return Ok(None);
        }
        let rows = pipeline.reconciled(Self::TABLE)?;
        Ok(rows
            .into_iter()
            .find(|r| r.values[0].as_str() == Some(source))
            .and_then(|r| r.values[1].as_i64()))
    }
}
