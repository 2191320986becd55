//! Propagation rules — the edges of the materialization DAG.
//!
//! A rule declares one upstream table, one target table, and a pure
//! transform from an inserted batch to target rows. The pipeline fires
//! rules synchronously on insert; the transform never mutates anything
//! itself, which is what keeps ordering and re-derivation testable in
//! isolation.

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::dictionary::PathDictionary;
use crate::error::CascadeError;
use crate::pipeline::Pipeline;
use crate::table::{Row, VersionedTable};

/// A propagation rule: `source_table` batch → rows for `target_table`.
pub trait PropagationRule: Send + Sync {
    /// Unique rule name (for registration, logs, and reverts).
    fn name(&self) -> &str;

    /// The upstream table whose inserts trigger this rule.
    fn source_table(&self) -> &str;

    /// The table the transform's output is appended to.
    fn target_table(&self) -> &str;

    /// Check the rule against the live catalog (columns exist, dictionaries
    /// resolvable, engines match). Called once at registration.
    fn validate(&self, _ctx: &RuleContext<'_>) -> Result<(), CascadeError> {
        Ok(())
    }

    /// Derive target rows from an inserted source batch.
    ///
    /// The batch is the whole insert (not a diff) and may contain
    /// tombstones; each rule decides how they propagate. Reads of side
    /// tables must go through the context's reconciled accessors.
    fn transform(&self, batch: &[Row], ctx: &RuleContext<'_>) -> Result<Vec<Row>, CascadeError>;
}

/// Read-only view of the pipeline handed to rule transforms.
pub struct RuleContext<'a> {
    pub(crate) pipeline: &'a Pipeline,
}

impl RuleContext<'_> {
    pub fn table(&self, name: &str) -> Result<Arc<VersionedTable>, CascadeError> {
        self.pipeline.table(name)
    }

    /// Grant-checked dictionary access; a missing grant is a loud error,
    /// never a silent default.
    pub fn dictionary(&self, name: &str) -> Result<Arc<PathDictionary>, CascadeError> {
        self.pipeline.dictionary(name)
    }

    /// Reconciled read of any table (last-version-wins, tombstones out).
    pub fn reconciled(&self, name: &str) -> Result<Vec<Row>, CascadeError> {
        Ok(self.table(name)?.reconciled())
    }

    pub fn config(&self) -> &PipelineConfig {
        self.pipeline.config()
    }
}
