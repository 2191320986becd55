//! Pipeline facade: registration, the synchronous insert cascade, grants.
//!
//! Data flows strictly downstream: replication source → ingest table →
//! (dictionary lookup ∪ denormalization join) → hierarchy fact table →
//! rollup table(s). Each hop is a propagation rule fired synchronously on
//! insert into its upstream table — a batch of N rows deterministically
//! produces its downstream rows before the triggering insert returns. The
//! chain is *not* transactional: an error mid-cascade leaves upstream
//! appends in place (the source retries; reconciliation absorbs the
//! duplicates).

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::Catalog;
use crate::config::PipelineConfig;
use crate::dictionary::{DictionaryDef, PathDictionary};
use crate::error::CascadeError;
use crate::graph::PropagationGraph;
use crate::propagate::{PropagationRule, RuleContext};
use crate::schema::TableDef;
use crate::table::{Row, VersionedTable};

/// One hop of a cascade, for observability and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeStep {
    pub rule: String,
    pub target: String,
    pub rows: usize,
}

/// What an insert did: the direct append plus every downstream hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationReport {
    pub table: String,
    pub appended: usize,
    pub steps: Vec<CascadeStep>,
}

/// The pipeline: catalog, rule registry, grants, and configuration.
pub struct Pipeline {
    config: PipelineConfig,
    catalog: Catalog,
    rules: RwLock<Vec<Arc<dyn PropagationRule>>>,
    grants: RwLock<BTreeSet<String>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, CascadeError> {
        config.validate()?;
        Ok(Pipeline {
            config,
            catalog: Catalog::new(),
            rules: RwLock::new(Vec::new()),
            grants: RwLock::new(BTreeSet::new()),
        })
    }

    /// A pipeline with default configuration.
    pub fn with_defaults() -> Self {
        Pipeline {
            config: PipelineConfig::default(),
            catalog: Catalog::new(),
            rules: RwLock::new(Vec::new()),
            grants: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Monotonic counter of structural changes (tables, dictionaries,
    /// rules). Observed by the scheduler instead of diffing registries.
    pub fn schema_epoch(&self) -> u64 {
        self.catalog.epoch()
    }

    // ── Tables ─────────────────────────────────────────────────────────

    pub fn create_table(&self, def: TableDef) -> Result<Arc<VersionedTable>, CascadeError> {
        let table = self.catalog.create_table(def)?;
        log::info!("created table '{}'", table.name());
        Ok(table)
    }

    pub fn create_table_if_not_exists(
        &self,
        def: TableDef,
    ) -> Result<Arc<VersionedTable>, CascadeError> {
        let (table, created) = self.catalog.create_table_if_not_exists(def)?;
        if created {
            log::info!("created table '{}'", table.name());
        }
        Ok(table)
    }

    /// Drop a table and every rule attached to it. Idempotent.
    pub fn drop_table_if_exists(&self, name: &str) -> bool {
        let existed = self.catalog.drop_table_if_exists(name);
        if existed {
            let mut rules = self.rules.write();
            let before = rules.len();
            rules.retain(|r| r.source_table() != name && r.target_table() != name);
            let dropped_rules = before - rules.len();
            if dropped_rules > 0 {
                log::info!("dropped table '{name}' and {dropped_rules} attached rule(s)");
            } else {
                log::info!("dropped table '{name}'");
            }
        }
        existed
    }

    pub fn table(&self, name: &str) -> Result<Arc<VersionedTable>, CascadeError> {
        self.catalog.table(name)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.catalog.has_table(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.catalog.table_names()
    }

    /// Reconciled read of a table (last-version-wins, tombstones out).
    pub fn reconciled(&self, name: &str) -> Result<Vec<Row>, CascadeError> {
        Ok(self.table(name)?.reconciled())
    }

    /// Compact every table; returns total physical rows removed.
    pub fn compact_all(&self) -> usize {
        let mut removed = 0;
        for name in self.catalog.table_names() {
            if let Some(table) = self.catalog.try_table(&name) {
                let n = table.compact();
                if n > 0 {
                    log::debug!("compacted table '{name}': removed {n} physical rows");
                }
                removed += n;
            }
        }
        removed
    }

    // ── Rules ──────────────────────────────────────────────────────────

    /// Register a propagation rule.
    ///
    /// Validates the rule against the live catalog and rejects any rule
    /// that would close a cycle in the propagation graph — acyclicity is
    /// what guarantees the synchronous cascade terminates.
    pub fn register_rule(&self, rule: Arc<dyn PropagationRule>) -> Result<(), CascadeError> {
        self.catalog.table(rule.source_table())?;
        self.catalog.table(rule.target_table())?;

        {
            let ctx = RuleContext { pipeline: self };
            rule.validate(&ctx)?;
        }

        let mut rules = self.rules.write();
        if rules.iter().any(|r| r.name() == rule.name()) {
            return Err(CascadeError::AlreadyExists(format!(
                "rule '{}'",
                rule.name()
            )));
        }

        let mut graph = PropagationGraph::new();
        for r in rules.iter() {
            graph.add_edge(r.source_table(), r.target_table());
        }
        graph.add_edge(rule.source_table(), rule.target_table());
        graph.detect_cycles()?;

        log::info!(
            "registered rule '{}': {} -> {}",
            rule.name(),
            rule.source_table(),
            rule.target_table()
        );
        rules.push(rule);
        Ok(())
    }

    /// Idempotent registration keyed by rule name.
    pub fn register_rule_if_absent(
        &self,
        rule: Arc<dyn PropagationRule>,
    ) -> Result<bool, CascadeError> {
        if self.has_rule(rule.name()) {
            return Ok(false);
        }
        self.register_rule(rule).map(|_| true)
    }

    /// Idempotent removal. Returns whether the rule existed.
    pub fn drop_rule_if_exists(&self, name: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.name() != name);
        let removed = rules.len() < before;
        if removed {
            log::info!("dropped rule '{name}'");
        }
        removed
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.rules.read().iter().any(|r| r.name() == name)
    }

    pub fn rule_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .rules
            .read()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// The current propagation graph.
    pub fn graph(&self) -> PropagationGraph {
        let mut graph = PropagationGraph::new();
        for r in self.rules.read().iter() {
            graph.add_edge(r.source_table(), r.target_table());
        }
        graph
    }

    // ── Inserts and the cascade ────────────────────────────────────────

    /// Append a batch and synchronously fire every downstream rule.
    pub fn insert(&self, table: &str, rows: Vec<Row>) -> Result<PropagationReport, CascadeError> {
        let handle = self.catalog.table(table)?;
        let coerced = handle.append(rows)?;
        let mut report = PropagationReport {
            table: table.to_string(),
            appended: coerced.len(),
            steps: Vec::new(),
        };
        self.cascade(table, &coerced, &mut report)?;
        if !report.steps.is_empty() {
            log::debug!(
                "insert into '{}': {} rows, {} downstream hop(s)",
                table,
                report.appended,
                report.steps.len()
            );
        }
        Ok(report)
    }

    fn cascade(
        &self,
        source: &str,
        batch: &[Row],
        report: &mut PropagationReport,
    ) -> Result<(), CascadeError> {
        if batch.is_empty() {
            return Ok(());
        }
        // Clone the matching rules out so no lock is held across transforms.
        let matching: Vec<Arc<dyn PropagationRule>> = self
            .rules
            .read()
            .iter()
            .filter(|r| r.source_table() == source)
            .cloned()
            .collect();

        for rule in matching {
            let ctx = RuleContext { pipeline: self };
            let out = rule.transform(batch, &ctx)?;
            if out.is_empty() {
                continue;
            }
            let target = self.catalog.table(rule.target_table())?;
            let coerced = target.append(out)?;
            report.steps.push(CascadeStep {
                rule: rule.name().to_string(),
                target: rule.target_table().to_string(),
                rows: coerced.len(),
            });
            self.cascade(rule.target_table(), &coerced, report)?;
        }
        Ok(())
    }

    // ── Dictionaries and grants ────────────────────────────────────────

    pub fn register_dictionary(
        &self,
        def: DictionaryDef,
    ) -> Result<Arc<PathDictionary>, CascadeError> {
        self.catalog.table(&def.source_table)?;
        let dict = self.catalog.register_dictionary(def)?;
        log::info!("registered dictionary '{}'", dict.name());
        Ok(dict)
    }

    pub fn register_dictionary_if_absent(
        &self,
        def: DictionaryDef,
    ) -> Result<Arc<PathDictionary>, CascadeError> {
        self.catalog.table(&def.source_table)?;
        let (dict, _) = self.catalog.register_dictionary_if_absent(def)?;
        Ok(dict)
    }

    pub fn drop_dictionary_if_exists(&self, name: &str) -> bool {
        self.catalog.drop_dictionary_if_exists(name)
    }

    pub fn dictionary_names(&self) -> Vec<String> {
        self.catalog.dictionary_names()
    }

    /// Grant-checked dictionary access.
    ///
    /// A dictionary declaring `required_grant` is unusable until the grant
    /// is issued; the error carries remediation instructions. Silently
    /// returning defaults here would corrupt every downstream path.
    pub fn dictionary(&self, name: &str) -> Result<Arc<PathDictionary>, CascadeError> {
        let dict = self.catalog.dictionary(name)?;
        if let Some(grant) = &dict.def().required_grant
            && !self.grants.read().contains(grant)
        {
            return Err(CascadeError::MissingGrant {
                dictionary: name.to_string(),
                grant: grant.clone(),
            });
        }
        Ok(dict)
    }

    /// Dictionary handle without the grant gate. The scheduler uses this
    /// for rebuilds — grants govern lookups, not the engine's own refresh.
    pub(crate) fn dictionary_ungated(
        &self,
        name: &str,
    ) -> Result<Arc<PathDictionary>, CascadeError> {
        self.catalog.dictionary(name)
    }

    /// Issue a lookup grant.
    pub fn grant(&self, grant: impl Into<String>) {
        let grant = grant.into();
        log::info!("granted '{grant}'");
        self.grants.write().insert(grant);
    }

    pub fn revoke(&self, grant: &str) {
        self.grants.write().remove(grant);
    }

    /// Permission self-test: verify every registered dictionary is
    /// resolvable under the current grants. Run this at startup so a
    /// missing grant surfaces as one actionable error instead of a
    /// corrupted cascade later.
    pub fn check_dictionary_grants(&self) -> Result<(), CascadeError> {
        for name in self.catalog.dictionary_names() {
            self.dictionary(&name)?;
        }
        Ok(())
    }

    // ── Dictionary refresh ─────────────────────────────────────────────

    /// Rebuild one dictionary from its reconciled source. Returns the new
    /// generation's entry count.
    pub fn refresh_dictionary(&self, name: &str) -> Result<usize, CascadeError> {
        let dict = self.catalog.dictionary(name)?;
        let source = self.catalog.table(&dict.def().source_table)?;
        let count = dict.rebuild_from(&source)?;
        log::info!(
            "refreshed dictionary '{}': generation {} with {} entries",
            name,
            dict.generation_ordinal(),
            count
        );
        Ok(count)
    }

    /// Rebuild every dictionary; stops at the first failure.
    pub fn refresh_all_dictionaries(&self) -> Result<(), CascadeError> {
        for name in self.catalog.dictionary_names() {
            self.refresh_dictionary(&name)?;
        }
        Ok(())
    }
}
