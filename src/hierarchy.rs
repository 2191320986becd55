//! Hierarchy denormalization propagation.
//!
//! Flattens nested ownership into fact rows keyed by hierarchical path:
//! for every inserted source row, the rule resolves the owning hierarchical
//! id through a dictionary (owners tried in a fixed precedence order,
//! falling back to a sentinel path when no owner column is set), folds each
//! declared 1:N side relation into a sorted, delimiter-wrapped id string,
//! and emits one fact row carrying the source `version`/`deleted` verbatim
//! — tombstones propagate.
//!
//! Target tables keep the entity id as their dedup key and a path-first
//! sort key, so an entity whose owner moved still reconciles to exactly one
//! current row at the new path.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::error::CascadeError;
use crate::propagate::{PropagationRule, RuleContext};
use crate::table::Row;
use crate::value::{DataType, Value};

/// One owner-resolution step: read `id_column`, look it up in `dictionary`.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerLookup {
    pub id_column: String,
    pub dictionary: String,
}

/// One flattened 1:N child relation.
#[derive(Debug, Clone, PartialEq)]
pub struct SideRelation {
    /// Child table holding the relation rows (e.g. label links).
    pub child_table: String,
    /// Column of the child table referencing the source row's entity id.
    pub parent_key_column: String,
    /// Column of the child table holding the flattened child id.
    pub child_id_column: String,
    /// Target column receiving the flattened string.
    pub output_column: String,
}

/// The denormalization rule.
pub struct HierarchyRule {
    name: String,
    source_table: String,
    target_table: String,
    /// Source column holding the entity id (also the side-relation parent).
    entity_id_column: String,
    /// Target column receiving the resolved path.
    path_column: String,
    owners: Vec<OwnerLookup>,
    side_relations: Vec<SideRelation>,
    /// Sentinel used when no owner resolves; overrides the config default.
    fallback_path: Option<String>,
    delimiter: char,
}

impl HierarchyRule {
    pub fn new(
        name: impl Into<String>,
        source_table: impl Into<String>,
        target_table: impl Into<String>,
        entity_id_column: impl Into<String>,
        path_column: impl Into<String>,
    ) -> Self {
        HierarchyRule {
            name: name.into(),
            source_table: source_table.into(),
            target_table: target_table.into(),
            entity_id_column: entity_id_column.into(),
            path_column: path_column.into(),
            owners: Vec::new(),
            side_relations: Vec::new(),
            fallback_path: None,
            delimiter: '/',
        }
    }

    /// Append an owner lookup; call order is precedence order.
    pub fn owner(mut self, id_column: impl Into<String>, dictionary: impl Into<String>) -> Self {
        self.owners.push(OwnerLookup {
            id_column: id_column.into(),
            dictionary: dictionary.into(),
        });
        self
    }

    pub fn side_relation(
        mut self,
        child_table: impl Into<String>,
        parent_key_column: impl Into<String>,
        child_id_column: impl Into<String>,
        output_column: impl Into<String>,
    ) -> Self {
        self.side_relations.push(SideRelation {
            child_table: child_table.into(),
            parent_key_column: parent_key_column.into(),
            child_id_column: child_id_column.into(),
            output_column: output_column.into(),
        });
        self
    }

    pub fn with_fallback_path(mut self, path: impl Into<String>) -> Self {
        self.fallback_path = Some(path.into());
        self
    }

    fn fallback<'a>(&'a self, ctx: &'a RuleContext<'_>) -> &'a str {
        self.fallback_path
            .as_deref()
            .unwrap_or(&ctx.config().fallback_path)
    }

    /// Resolve the owning path for one source row: the first owner column
    /// holding a non-null, non-zero integer wins; unknown ids resolve to
    /// the fallback inside the dictionary; no owner at all takes the
    /// fallback directly. Every fact row gets a path.
    fn resolve_path(
        &self,
        row: &Row,
        source_indices: &BTreeMap<String, usize>,
        ctx: &RuleContext<'_>,
    ) -> Result<String, CascadeError> {
        let fallback = self.fallback(ctx);
        for owner in &self.owners {
            let Some(&idx) = source_indices.get(&owner.id_column) else {
                continue;
            };
            let Some(id) = row.values.get(idx).and_then(|v| v.as_i64()) else {
                continue;
            };
            if id == 0 {
                continue;
            }
            let dict = ctx.dictionary(&owner.dictionary)?;
            return Ok(dict.resolve(id, fallback));
        }
        Ok(fallback.to_string())
    }
}

impl PropagationRule for HierarchyRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_table(&self) -> &str {
        &self.source_table
    }

    fn target_table(&self) -> &str {
        &self.target_table
    }

    fn validate(&self, ctx: &RuleContext<'_>) -> Result<(), CascadeError> {
        let source = ctx.table(&self.source_table)?.def();
        let target = ctx.table(&self.target_table)?.def();

        source.require_column(&self.entity_id_column)?;
        let path_idx = target.require_column(&self.path_column)?;
        if target.columns[path_idx].data_type != DataType::String {
            return Err(CascadeError::InvalidArgument(format!(
                "rule '{}': path column '{}' must be String",
                self.name, self.path_column
            )));
        }
        // Denormalized tables declare a path-first composite sort key.
        match target.sort_key.first() {
            Some(first) if *first == self.path_column => {}
            _ => {
                return Err(CascadeError::InvalidArgument(format!(
                    "rule '{}': target '{}' must declare a sort key starting \
                     with its path column '{}'",
                    self.name, self.target_table, self.path_column
                )));
            }
        }

        for owner in &self.owners {
            source.require_column(&owner.id_column)?;
            // Surfaces both unknown dictionaries and missing grants now,
            // instead of mid-cascade.
            ctx.dictionary(&owner.dictionary)?;
        }

        for rel in &self.side_relations {
            let child = ctx.table(&rel.child_table)?.def();
            child.require_column(&rel.parent_key_column)?;
            child.require_column(&rel.child_id_column)?;
            let out_idx = target.require_column(&rel.output_column)?;
            if target.columns[out_idx].data_type != DataType::String {
                return Err(CascadeError::InvalidArgument(format!(
                    "rule '{}': side-relation output column '{}' must be String",
                    self.name, rel.output_column
                )));
            }
        }

        // Every remaining target column must be fed by a same-named source
        // column or be nullable.
        for col in &target.columns {
            if col.name == self.path_column
                || self.side_relations.iter().any(|r| r.output_column == col.name)
                || source.column(&col.name).is_some()
                || col.nullable
            {
                continue;
            }
            return Err(CascadeError::InvalidArgument(format!(
                "rule '{}': target column '{}' has no source and no default",
                self.name, col.name
            )));
        }

        Ok(())
    }

    fn transform(&self, batch: &[Row], ctx: &RuleContext<'_>) -> Result<Vec<Row>, CascadeError> {
        let source = ctx.table(&self.source_table)?.def();
        let target = ctx.table(&self.target_table)?.def();

        let source_indices: BTreeMap<String, usize> = source
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        let entity_idx = source.require_column(&self.entity_id_column)?;

        // Entity ids present in this batch scope the side-relation reads.
        let batch_ids: HashSet<i64> = batch
            .iter()
            .filter_map(|r| r.values.get(entity_idx).and_then(|v| v.as_i64()))
            .collect();

        // Reconcile each child table once, scoped to the batch's keys, and
        // fold child ids per parent.
        let mut flattened: Vec<BTreeMap<i64, BTreeSet<i64>>> =
            Vec::with_capacity(self.side_relations.len());
        for rel in &self.side_relations {
            let child = ctx.table(&rel.child_table)?;
            let child_def = child.def();
            let parent_idx = child_def.require_column(&rel.parent_key_column)?;
            let child_idx = child_def.require_column(&rel.child_id_column)?;

            let mut by_parent: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
            for row in child.reconciled() {
                let Some(parent) = row.values.get(parent_idx).and_then(|v| v.as_i64()) else {
                    continue;
                };
                if !batch_ids.contains(&parent) {
                    continue;
                }
                if let Some(id) = row.values.get(child_idx).and_then(|v| v.as_i64()) {
                    by_parent.entry(parent).or_default().insert(id);
                }
            }
            flattened.push(by_parent);
        }

        let mut out = Vec::with_capacity(batch.len());
        for row in batch {
            let path = self.resolve_path(row, &source_indices, ctx)?;
            let entity_id = row.values.get(entity_idx).and_then(|v| v.as_i64());

            let mut values = Vec::with_capacity(target.columns.len());
            for col in &target.columns {
                if col.name == self.path_column {
                    values.push(Value::String(path.clone()));
                    continue;
                }
                if let Some(rel_pos) = self
                    .side_relations
                    .iter()
                    .position(|r| r.output_column == col.name)
                {
                    let ids: Vec<i64> = entity_id
                        .and_then(|eid| flattened[rel_pos].get(&eid))
                        .map(|set| set.iter().copied().collect())
                        .unwrap_or_default();
                    values.push(Value::String(flatten_ids(&ids, self.delimiter)));
                    continue;
                }
                match source.column_index(&col.name) {
                    Some(idx) => values.push(row.values[idx].clone()),
                    None => values.push(Value::Null),
                }
            }

            // Version and tombstone flag carry forward verbatim.
            out.push(Row {
                values,
                version: row.version,
                deleted: row.deleted,
            });
        }
        Ok(out)
    }
}

/// Fold child ids into the canonical flattened representation: sorted,
/// delimiter-wrapped (`"/1/5/9/"`). Sorting makes the string deterministic
/// and comparable across versions; an empty set folds to the empty string.
pub fn flatten_ids(ids: &[i64], delimiter: char) -> String {
    if ids.is_empty() {
        return String::new();
    }
    let mut sorted: Vec<i64> = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out = String::with_capacity(sorted.len() * 4 + 2);
    out.push(delimiter);
    for id in sorted {
        out.push_str(&id.to_string());
        out.push(delimiter);
    }
    out
}
