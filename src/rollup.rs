//! Rollup propagation and re-aggregation.
//!
//! A rollup rule groups its inserted batch by declared dimensions
//! (typically a truncated-to-bucket timestamp plus a handful of categorical
//! columns) and appends one bucket row of partial-aggregate state per
//! group. Two flavors:
//!
//! - **Additive** rollups hold mergeable state (counts, sums, quantile
//!   sketches). The target's additive engine merges bucket rows per key at
//!   read time, and a second-level rollup may consume the partial columns
//!   directly — `Sum` over partial counts/sums, `QuantileMerge` over
//!   sketches — instead of re-scanning raw facts.
//! - **Replacing** rollups track a full row snapshot per dimension tuple,
//!   last-version-wins. Their buckets cannot be merged across grains;
//!   declaring a re-aggregation over a replacing source is rejected when
//!   the rule is registered, not discovered at runtime.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::error::CascadeError;
use crate::propagate::{PropagationRule, RuleContext};
use crate::reconcile::encode_key;
use crate::schema::{TableDef, TableEngine};
use crate::sketch::QuantileSketch;
use crate::table::Row;
use crate::value::{DataType, Value};
use crate::version::{Granularity, Version};

/// Where a dimension value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum DimensionSource {
    /// Copy a source column through.
    Column(String),
    /// Truncate a source timestamp column to its bucket start.
    TimeBucket {
        column: String,
        granularity: Granularity,
    },
}

/// One rollup dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub output_column: String,
    pub source: DimensionSource,
}

impl Dimension {
    /// A categorical dimension copied through under the same name.
    pub fn passthrough(column: impl Into<String>) -> Self {
        let column = column.into();
        Dimension {
            output_column: column.clone(),
            source: DimensionSource::Column(column),
        }
    }

    pub fn column(output: impl Into<String>, source: impl Into<String>) -> Self {
        Dimension {
            output_column: output.into(),
            source: DimensionSource::Column(source.into()),
        }
    }

    /// A time-bucket dimension.
    pub fn bucket(
        output: impl Into<String>,
        source: impl Into<String>,
        granularity: Granularity,
    ) -> Self {
        Dimension {
            output_column: output.into(),
            source: DimensionSource::TimeBucket {
                column: source.into(),
                granularity,
            },
        }
    }
}

/// Partial-aggregate kinds. All four are additive (mergeable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    /// Count input rows.
    Count,
    /// Sum a numeric column. Also how partial counts/sums re-aggregate.
    Sum,
    /// Build a quantile sketch from a numeric column.
    Quantile,
    /// Merge upstream sketch columns; the re-aggregation form of Quantile.
    QuantileMerge,
}

/// One aggregate output.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub output_column: String,
    pub kind: AggregateKind,
    /// Source column; `None` only for Count.
    pub source_column: Option<String>,
}

impl Aggregate {
    pub fn count(output: impl Into<String>) -> Self {
        Aggregate {
            output_column: output.into(),
            kind: AggregateKind::Count,
            source_column: None,
        }
    }

    pub fn sum(output: impl Into<String>, source: impl Into<String>) -> Self {
        Aggregate {
            output_column: output.into(),
            kind: AggregateKind::Sum,
            source_column: Some(source.into()),
        }
    }

    pub fn quantile(output: impl Into<String>, source: impl Into<String>) -> Self {
        Aggregate {
            output_column: output.into(),
            kind: AggregateKind::Quantile,
            source_column: Some(source.into()),
        }
    }

    pub fn quantile_merge(output: impl Into<String>, source: impl Into<String>) -> Self {
        Aggregate {
            output_column: output.into(),
            kind: AggregateKind::QuantileMerge,
            source_column: Some(source.into()),
        }
    }
}

/// Additive vs. replacing rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupKind {
    Additive,
    Replacing,
}

/// A rollup propagation rule.
pub struct RollupRule {
    name: String,
    source_table: String,
    target_table: String,
    kind: RollupKind,
    dimensions: Vec<Dimension>,
    aggregates: Vec<Aggregate>,
    /// Replacing only: `(target column, source column)` snapshot pairs.
    snapshots: Vec<(String, String)>,
    /// True when this rule consumes another rollup's partial state.
    reaggregation: bool,
}

impl RollupRule {
    /// An additive rollup over raw facts.
    pub fn additive(
        name: impl Into<String>,
        source_table: impl Into<String>,
        target_table: impl Into<String>,
    ) -> Self {
        RollupRule {
            name: name.into(),
            source_table: source_table.into(),
            target_table: target_table.into(),
            kind: RollupKind::Additive,
            dimensions: Vec::new(),
            aggregates: Vec::new(),
            snapshots: Vec::new(),
            reaggregation: false,
        }
    }

    /// A replacing rollup: last-version-wins snapshot per dimension tuple.
    pub fn replacing(
        name: impl Into<String>,
        source_table: impl Into<String>,
        target_table: impl Into<String>,
    ) -> Self {
        RollupRule {
            kind: RollupKind::Replacing,
            ..Self::additive(name, source_table, target_table)
        }
    }

    /// A second-level rollup consuming a first-level rollup's partial
    /// columns. Only valid over an additive source; checked at validation.
    pub fn reaggregate(
        name: impl Into<String>,
        source_table: impl Into<String>,
        target_table: impl Into<String>,
    ) -> Self {
        RollupRule {
            reaggregation: true,
            ..Self::additive(name, source_table, target_table)
        }
    }

    pub fn dimension(mut self, dim: Dimension) -> Self {
        self.dimensions.push(dim);
        self
    }

    pub fn aggregate(mut self, agg: Aggregate) -> Self {
        self.aggregates.push(agg);
        self
    }

    /// Replacing only: copy `source` into `target` on the winning row.
    pub fn snapshot(mut self, target: impl Into<String>, source: impl Into<String>) -> Self {
        self.snapshots.push((target.into(), source.into()));
        self
    }

    fn dimension_value(&self, dim: &Dimension, row: &Row, source: &TableDef) -> Value {
        match &dim.source {
            DimensionSource::Column(name) => source
                .column_index(name)
                .and_then(|i| row.values.get(i).cloned())
                .unwrap_or(Value::Null),
            DimensionSource::TimeBucket { column, granularity } => source
                .column_index(column)
                .and_then(|i| row.values.get(i))
                .and_then(|v| v.as_timestamp_micros())
                .map(|t| Value::Timestamp(granularity.truncate(t)))
                .unwrap_or(Value::Null),
        }
    }

    fn transform_additive(
        &self,
        batch: &[Row],
        source: &TableDef,
        target: &TableDef,
        sketch_capacity: usize,
    ) -> Result<Vec<Row>, CascadeError> {
        // Group live rows by dimension tuple; BTreeMap keeps the output
        // deterministic regardless of batch order.
        let mut groups: BTreeMap<Vec<u8>, (Vec<Value>, Vec<&Row>)> = BTreeMap::new();
        for row in batch {
            if row.deleted {
                continue;
            }
            let dims: Vec<Value> = self
                .dimensions
                .iter()
                .map(|d| self.dimension_value(d, row, source))
                .collect();
            let all: Vec<usize> = (0..dims.len()).collect();
            let key = encode_key(&dims, &all);
            groups.entry(key).or_insert_with(|| (dims, Vec::new())).1.push(row);
        }

        let mut out = Vec::with_capacity(groups.len());
        for (_, (dims, rows)) in groups {
            let version = rows
                .iter()
                .map(|r| r.version)
                .max()
                .unwrap_or(Version(0));

            let mut values = Vec::with_capacity(target.columns.len());
            for col in &target.columns {
                if let Some(pos) = self
                    .dimensions
                    .iter()
                    .position(|d| d.output_column == col.name)
                {
                    values.push(dims[pos].clone());
                    continue;
                }
                if let Some(agg) = self
                    .aggregates
                    .iter()
                    .find(|a| a.output_column == col.name)
                {
                    values.push(compute_aggregate(
                        agg,
                        &rows,
                        source,
                        col.data_type,
                        sketch_capacity,
                    )?);
                    continue;
                }
                values.push(Value::Null);
            }
            out.push(Row::new(values, version));
        }
        Ok(out)
    }

    fn transform_replacing(
        &self,
        batch: &[Row],
        source: &TableDef,
        target: &TableDef,
    ) -> Result<Vec<Row>, CascadeError> {
        // Last (version, batch position) wins per dimension tuple; the
        // winner's tombstone flag carries into the bucket.
        let mut groups: BTreeMap<Vec<u8>, (Vec<Value>, usize)> = BTreeMap::new();
        for (pos, row) in batch.iter().enumerate() {
            let dims: Vec<Value> = self
                .dimensions
                .iter()
                .map(|d| self.dimension_value(d, row, source))
                .collect();
            let all: Vec<usize> = (0..dims.len()).collect();
            let key = encode_key(&dims, &all);
            match groups.entry(key) {
                Entry::Occupied(mut e) => {
                    let winner = e.get().1;
                    if (batch[winner].version, winner) < (row.version, pos) {
                        e.insert((dims, pos));
                    }
                }
                Entry::Vacant(e) => {
                    e.insert((dims, pos));
                }
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for (_, (dims, pos)) in groups {
            let winner = &batch[pos];
            let mut values = Vec::with_capacity(target.columns.len());
            for col in &target.columns {
                if let Some(dpos) = self
                    .dimensions
                    .iter()
                    .position(|d| d.output_column == col.name)
                {
                    values.push(dims[dpos].clone());
                    continue;
                }
                if let Some((_, src)) = self.snapshots.iter().find(|(t, _)| *t == col.name) {
                    let v = source
                        .column_index(src)
                        .and_then(|i| winner.values.get(i).cloned())
                        .unwrap_or(Value::Null);
                    values.push(v);
                    continue;
                }
                values.push(Value::Null);
            }
            out.push(Row {
                values,
                version: winner.version,
                deleted: winner.deleted,
            });
        }
        Ok(out)
    }
}

/// Compute one aggregate over a group, coerced to the target column type.
fn compute_aggregate(
    agg: &Aggregate,
    rows: &[&Row],
    source: &TableDef,
    target_type: DataType,
    sketch_capacity: usize,
) -> Result<Value, CascadeError> {
    match agg.kind {
        AggregateKind::Count => {
            let n = rows.len() as u64;
            Ok(match target_type {
                DataType::Int64 => Value::Int64(n as i64),
                _ => Value::UInt64(n),
            })
        }
        AggregateKind::Sum => {
            let col = agg.source_column.as_deref().unwrap_or_default();
            let idx = source.require_column(col)?;
            match target_type {
                DataType::Float64 => {
                    let mut acc = 0.0;
                    for r in rows {
                        if let Some(v) = r.values.get(idx).and_then(|v| v.as_f64()) {
                            acc += v;
                        }
                    }
                    Ok(Value::Float64(acc))
                }
                DataType::UInt64 => {
                    let mut acc: u64 = 0;
                    for r in rows {
                        if let Some(v) = r.values.get(idx).and_then(|v| v.as_i64())
                            && v >= 0
                        {
                            acc = acc.saturating_add(v as u64);
                        }
                    }
                    Ok(Value::UInt64(acc))
                }
                _ => {
                    let mut acc: i64 = 0;
                    for r in rows {
                        if let Some(v) = r.values.get(idx).and_then(|v| v.as_i64()) {
                            acc = acc.saturating_add(v);
                        }
                    }
                    Ok(Value::Int64(acc))
                }
            }
        }
        AggregateKind::Quantile => {
            let col = agg.source_column.as_deref().unwrap_or_default();
            let idx = source.require_column(col)?;
            let mut sketch = QuantileSketch::with_capacity(sketch_capacity);
            for r in rows {
                if let Some(v) = r.values.get(idx).and_then(|v| v.as_f64()) {
                    sketch.insert(v);
                }
            }
            Ok(Value::Sketch(sketch))
        }
        AggregateKind::QuantileMerge => {
            let col = agg.source_column.as_deref().unwrap_or_default();
            let idx = source.require_column(col)?;
            let mut sketch = QuantileSketch::with_capacity(sketch_capacity);
            for r in rows {
                if let Some(Value::Sketch(s)) = r.values.get(idx) {
                    sketch.merge(s);
                }
            }
            Ok(Value::Sketch(sketch))
        }
    }
}

impl PropagationRule for RollupRule {
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

        if self.dimensions.is_empty() {
            return Err(CascadeError::InvalidArgument(format!(
                "rollup '{}' declares no dimensions",
                self.name
            )));
        }

        // Re-aggregating from partial state is only valid when the source
        // holds additive (merge-compatible) state.
        if self.reaggregation && source.engine != TableEngine::Additive {
            return Err(CascadeError::NonAdditiveReaggregation(
                self.source_table.clone(),
            ));
        }

        match self.kind {
            RollupKind::Additive => {
                if target.engine != TableEngine::Additive {
                    return Err(CascadeError::InvalidArgument(format!(
                        "rollup '{}': additive rollup requires an additive target, \
                         but '{}' is replacing",
                        self.name, self.target_table
                    )));
                }
                if self.aggregates.is_empty() {
                    return Err(CascadeError::InvalidArgument(format!(
                        "rollup '{}' declares no aggregates",
                        self.name
                    )));
                }
            }
            RollupKind::Replacing => {
                if target.engine != TableEngine::Replacing {
                    return Err(CascadeError::InvalidArgument(format!(
                        "rollup '{}': replacing rollup requires a replacing target, \
                         but '{}' is additive",
                        self.name, self.target_table
                    )));
                }
                if !self.aggregates.is_empty() {
                    return Err(CascadeError::InvalidArgument(format!(
                        "rollup '{}': replacing rollups snapshot, they do not aggregate",
                        self.name
                    )));
                }
            }
        }

        // The target's dedup key must be exactly the dimension set, or
        // merging would collapse across dimensions.
        let dim_names: Vec<&str> = self.dimensions.iter().map(|d| d.output_column.as_str()).collect();
        for key in &target.dedup_key {
            if !dim_names.contains(&key.as_str()) {
                return Err(CascadeError::InvalidArgument(format!(
                    "rollup '{}': target dedup key column '{}' is not a dimension",
                    self.name, key
                )));
            }
        }
        for dim in &self.dimensions {
            target.require_column(&dim.output_column)?;
            if !target.dedup_key.contains(&dim.output_column) {
                return Err(CascadeError::InvalidArgument(format!(
                    "rollup '{}': dimension '{}' must be part of the target dedup key",
                    self.name, dim.output_column
                )));
            }
            match &dim.source {
                DimensionSource::Column(c) => {
                    source.require_column(c)?;
                }
                DimensionSource::TimeBucket { column, .. } => {
                    let idx = source.require_column(column)?;
                    if source.columns[idx].data_type != DataType::Timestamp {
                        return Err(CascadeError::InvalidArgument(format!(
                            "rollup '{}': bucket column '{}' must be Timestamp",
                            self.name, column
                        )));
                    }
                }
            }
        }

        for agg in &self.aggregates {
            let out_idx = target.require_column(&agg.output_column)?;
            let out_type = target.columns[out_idx].data_type;
            match agg.kind {
                AggregateKind::Count | AggregateKind::Sum => {
                    if !matches!(
                        out_type,
                        DataType::Int64 | DataType::UInt64 | DataType::Float64
                    ) {
                        return Err(CascadeError::InvalidArgument(format!(
                            "rollup '{}': aggregate column '{}' must be numeric",
                            self.name, agg.output_column
                        )));
                    }
                }
                AggregateKind::Quantile | AggregateKind::QuantileMerge => {
                    if out_type != DataType::Sketch {
                        return Err(CascadeError::InvalidArgument(format!(
                            "rollup '{}': aggregate column '{}' must be Sketch",
                            self.name, agg.output_column
                        )));
                    }
                }
            }
            if let Some(src) = &agg.source_column {
                let idx = source.require_column(src)?;
                if agg.kind == AggregateKind::QuantileMerge
                    && source.columns[idx].data_type != DataType::Sketch
                {
                    return Err(CascadeError::InvalidArgument(format!(
                        "rollup '{}': QuantileMerge source '{}' must be Sketch",
                        self.name, src
                    )));
                }
            }
        }

        for (target_col, source_col) in &self.snapshots {
            target.require_column(target_col)?;
            source.require_column(source_col)?;
        }

        Ok(())
    }

    fn transform(&self, batch: &[Row], ctx: &RuleContext<'_>) -> Result<Vec<Row>, CascadeError> {
        let source = ctx.table(&self.source_table)?.def();
        let target = ctx.table(&self.target_table)?.def();
        match self.kind {
            RollupKind::Additive => self.transform_additive(
                batch,
                &source,
                &target,
                ctx.config().quantile_sketch_capacity,
            ),
            RollupKind::Replacing => self.transform_replacing(batch, &source, &target),
        }
    }
}
