//! Shared fixtures for integration tests.
//!
//! Builds the canonical pipeline the suites exercise:
//!
//! ```text
//! projects ──► project_paths ┐
//! namespaces ► namespace_paths ┤ (dictionaries)
//! issues ──────────────────────┴► hierarchy_issues ──► issues_daily ──► issues_monthly
//! label_links ─────────────────────────┘ (side relation)
//! ```

#![allow(dead_code)]

use std::sync::Arc;

use cascade::{
    Aggregate, ColumnDef, DataType, Dimension, DictionaryDef, Granularity, HierarchyRule,
    Pipeline, ReplicatedRow, Row, RollupRule, TableDef, Value, Version, micros_at,
};

pub const FALLBACK_PATH: &str = "0/";

pub fn issues_def() -> TableDef {
    TableDef::replacing(
        "issues",
        vec![
            ColumnDef::new("id", DataType::Int64),
            ColumnDef::nullable("title", DataType::String),
            ColumnDef::nullable("project_id", DataType::Int64),
            ColumnDef::nullable("namespace_id", DataType::Int64),
            ColumnDef::new("updated_at", DataType::Timestamp),
        ],
        &["id"],
    )
}

pub fn namespaces_def() -> TableDef {
    TableDef::replacing(
        "namespaces",
        vec![
            ColumnDef::new("id", DataType::Int64),
            ColumnDef::new("traversal_path", DataType::String),
        ],
        &["id"],
    )
}

pub fn projects_def() -> TableDef {
    TableDef::replacing(
        "projects",
        vec![
            ColumnDef::new("id", DataType::Int64),
            ColumnDef::new("traversal_path", DataType::String),
        ],
        &["id"],
    )
}

pub fn label_links_def() -> TableDef {
    TableDef::replacing(
        "label_links",
        vec![
            ColumnDef::new("id", DataType::Int64),
            ColumnDef::new("issue_id", DataType::Int64),
            ColumnDef::new("label_id", DataType::Int64),
        ],
        &["id"],
    )
}

pub fn hierarchy_issues_def() -> TableDef {
    TableDef::replacing(
        "hierarchy_issues",
        vec![
            ColumnDef::new("traversal_path", DataType::String),
            ColumnDef::new("id", DataType::Int64),
            ColumnDef::nullable("title", DataType::String),
            ColumnDef::nullable("label_ids", DataType::String),
            ColumnDef::new("updated_at", DataType::Timestamp),
        ],
        &["id"],
    )
    .with_sort_key(&["traversal_path", "id"])
}

pub fn issues_daily_def() -> TableDef {
    TableDef::additive(
        "issues_daily",
        vec![
            ColumnDef::new("bucket", DataType::Timestamp),
            ColumnDef::new("count", DataType::UInt64),
        ],
        &["bucket"],
    )
}

pub fn issues_monthly_def() -> TableDef {
    TableDef::additive(
        "issues_monthly",
        vec![
            ColumnDef::new("bucket", DataType::Timestamp),
            ColumnDef::new("count", DataType::UInt64),
        ],
        &["bucket"],
    )
}

pub fn hierarchy_rule() -> HierarchyRule {
    HierarchyRule::new(
        "issues_to_hierarchy",
        "issues",
        "hierarchy_issues",
        "id",
        "traversal_path",
    )
    .owner("project_id", "project_paths")
    .owner("namespace_id", "namespace_paths")
    .side_relation("label_links", "issue_id", "label_id", "label_ids")
    .with_fallback_path(FALLBACK_PATH)
}

pub fn daily_rule() -> RollupRule {
    RollupRule::additive("hierarchy_daily", "hierarchy_issues", "issues_daily")
        .dimension(Dimension::bucket("bucket", "updated_at", Granularity::Day))
        .aggregate(Aggregate::count("count"))
}

pub fn monthly_rule() -> RollupRule {
    RollupRule::reaggregate("daily_monthly", "issues_daily", "issues_monthly")
        .dimension(Dimension::bucket("bucket", "bucket", Granularity::Month))
        .aggregate(Aggregate::sum("count", "count"))
}

/// The full fixture pipeline with refreshed dictionaries left empty.
pub fn build_pipeline() -> Pipeline {
    let p = Pipeline::with_defaults();
    p.create_table(issues_def()).unwrap();
    p.create_table(namespaces_def()).unwrap();
    p.create_table(projects_def()).unwrap();
    p.create_table(label_links_def()).unwrap();
    p.create_table(hierarchy_issues_def()).unwrap();
    p.create_table(issues_daily_def()).unwrap();
    p.create_table(issues_monthly_def()).unwrap();

    p.register_dictionary(DictionaryDef::new(
        "project_paths",
        "projects",
        "id",
        "traversal_path",
    ))
    .unwrap();
    p.register_dictionary(DictionaryDef::new(
        "namespace_paths",
        "namespaces",
        "id",
        "traversal_path",
    ))
    .unwrap();

    p.register_rule(Arc::new(hierarchy_rule())).unwrap();
    p.register_rule(Arc::new(daily_rule())).unwrap();
    p.register_rule(Arc::new(monthly_rule())).unwrap();
    p
}

/// An issue replication event. `project_id`/`namespace_id` of 0 mean NULL.
pub fn issue(
    id: i64,
    title: &str,
    project_id: i64,
    namespace_id: i64,
    updated_at: i64,
    version: i64,
) -> ReplicatedRow {
    let opt = |v: i64| if v == 0 { Value::Null } else { Value::Int64(v) };
    ReplicatedRow::upsert(
        vec![
            Value::Int64(id),
            Value::String(title.into()),
            opt(project_id),
            opt(namespace_id),
            Value::Timestamp(updated_at),
        ],
        Version(version),
    )
}

pub fn issue_tombstone(id: i64, updated_at: i64, version: i64) -> ReplicatedRow {
    ReplicatedRow::tombstone(
        vec![
            Value::Int64(id),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Timestamp(updated_at),
        ],
        Version(version),
    )
}

pub fn namespace(id: i64, path: &str, version: i64) -> ReplicatedRow {
    ReplicatedRow::upsert(
        vec![Value::Int64(id), Value::String(path.into())],
        Version(version),
    )
}

pub fn label_link(id: i64, issue_id: i64, label_id: i64, version: i64) -> ReplicatedRow {
    ReplicatedRow::upsert(
        vec![
            Value::Int64(id),
            Value::Int64(issue_id),
            Value::Int64(label_id),
        ],
        Version(version),
    )
}

/// Midday on a calendar date, in micros.
pub fn at(year: i32, month: u32, day: u32) -> i64 {
    micros_at(year, month, day, 12, 0, 0)
}

/// Find the single reconciled row matching a predicate, panicking with
/// context otherwise.
pub fn single_row<F>(rows: &[Row], pred: F, what: &str) -> Row
where
    F: Fn(&Row) -> bool,
{
    let matches: Vec<&Row> = rows.iter().filter(|r| pred(r)).collect();
    assert_eq!(matches.len(), 1, "expected exactly one {what}, got {matches:?}");
    matches[0].clone()
}
