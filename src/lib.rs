//! cascade — an embeddable analytics-pipeline engine.
//!
//! Versioned soft-delete tables fed by change-data-capture, cached
//! traversal-path dictionaries, and cascading incremental rollups, built on
//! one discipline: never mutate in place — append a dominating version (or
//! a tombstone) and reconcile at read time. Physical deduplication is
//! asynchronous and never awaited; every consumer applies the same pure
//! last-version-wins, tombstone-excluding reconciliation to its inputs.
//!
//! # Theoretical Basis
//!
//! - **Gupta & Mumick (1995)**: "Maintenance of Materialized Views:
//!   Problems, Techniques, and Applications", IEEE Data Engineering
//!   Bulletin — the propagation-rule chain is an incremental-view
//!   maintenance DAG made explicit.
//! - **ClickHouse ReplacingMergeTree / SummingMergeTree** semantics:
//!   eventually-consistent background merges with read-time collapse.
//!
//! # Dataflow
//!
//! ```text
//! replication source
//!   └── ingest table            (append-only versioned rows)
//!        ├── dictionary         (id → path, timer-refreshed snapshot)
//!        └── hierarchy rule     (denormalized, path-keyed fact table)
//!             └── rollup rule   (time-bucketed partial aggregates)
//!                  └── rollup   (re-aggregation at coarser grain)
//! ```
//!
//! Each arrow fires synchronously on insert; the chain across hops is not
//! transactional. Backfill closes historical gaps one time partition at a
//! time, resumable through sync cursors.

#![deny(unsafe_code)]
#![allow(dead_code)]

pub mod backfill;
pub mod catalog;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod graph;
pub mod hash;
pub mod hierarchy;
pub mod ingest;
pub mod migrate;
pub mod pipeline;
pub mod propagate;
pub mod reconcile;
pub mod rollup;
pub mod scheduler;
pub mod schema;
pub mod sketch;
pub mod table;
pub mod value;
pub mod version;

pub use backfill::{BackfillDriver, BackfillReport, Partition, PartitionResult, SyncCursorStore};
pub use config::PipelineConfig;
pub use dictionary::{DictionaryDef, PathDictionary};
pub use error::{CascadeError, ErrorKind, RetryPolicy, RetryState};
pub use hierarchy::{HierarchyRule, OwnerLookup, SideRelation, flatten_ids};
pub use ingest::{ReplicatedRow, ingest};
pub use migrate::{Migration, Migrator, SchemaOp};
pub use pipeline::{CascadeStep, Pipeline, PropagationReport};
pub use propagate::{PropagationRule, RuleContext};
pub use rollup::{Aggregate, AggregateKind, Dimension, DimensionSource, RollupKind, RollupRule};
pub use scheduler::{RefreshScheduler, Schedule, SchedulerState};
pub use schema::{ColumnDef, TableDef, TableEngine};
pub use sketch::QuantileSketch;
pub use table::{Row, StoredRow, VersionedTable};
pub use value::{DataType, Value};
pub use version::{Granularity, Version, micros_at};
