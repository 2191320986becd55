//! Schema evolution: ordered, named, reversible operations.
//!
//! Each schema change is a [`Migration`] — a name plus a list of
//! [`SchemaOp`]s with states {pending, applied}. Forward application is
//! idempotent at the statement level ("create if not exists", "drop if
//! exists", "add column if not exists") so partial or repeated runs
//! converge rather than fail. Reverse application restores the prior
//! physical shape; destructive reverses (dropping a freshly added column)
//! lose data, explicitly. A pure data-migration records a no-op reverse
//! rather than attempting to undo bulk data motion.
//!
//! The [`Migrator`] applies pending migrations in order and halts the
//! sequence on the first failure — later operations may assume the failed
//! one succeeded. Applied names are recorded in an append-only
//! `schema_migrations` ledger table (reverts append tombstones), read back
//! under the same reconciliation as every other table.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::dictionary::DictionaryDef;
use crate::error::CascadeError;
use crate::pipeline::Pipeline;
use crate::propagate::PropagationRule;
use crate::schema::{ColumnDef, TableDef};
use crate::table::Row;
use crate::value::{DataType, Value};
use crate::version::Version;

/// Forward-applied function of a data migration.
pub type DataFn = Arc<dyn Fn(&Pipeline) -> Result<(), CascadeError> + Send + Sync>;

/// One reversible schema operation.
pub enum SchemaOp {
    /// `CREATE TABLE IF NOT EXISTS`; reverse drops it.
    CreateTable(TableDef),
    /// `DROP TABLE IF EXISTS`; reverse recreates the definition when given
    /// (the data is gone — destructive, explicit).
    DropTable {
        name: String,
        recreate: Option<TableDef>,
    },
    /// `ADD COLUMN IF NOT EXISTS` with a fill default; reverse drops it.
    AddColumn {
        table: String,
        column: ColumnDef,
        default: Value,
    },
    /// `DROP COLUMN IF EXISTS`; reverse re-adds the column filled with
    /// `default` (the old values are gone — destructive, explicit).
    DropColumn {
        table: String,
        column: ColumnDef,
        default: Value,
    },
    /// Register a dictionary; reverse deregisters it.
    CreateDictionary(DictionaryDef),
    /// Deregister a dictionary; reverse re-registers when given.
    DropDictionary {
        name: String,
        recreate: Option<DictionaryDef>,
    },
    /// Register a propagation rule; reverse drops it by name.
    RegisterRule(Arc<dyn PropagationRule>),
    /// Drop a rule by name; reverse re-registers when given.
    DropRule {
        name: String,
        recreate: Option<Arc<dyn PropagationRule>>,
    },
    /// A pure data migration. The reverse is a recorded no-op.
    DataMigration { label: String, forward: DataFn },
}

impl std::fmt::Debug for SchemaOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SchemaOp({})", self.describe())
    }
}

impl SchemaOp {
    fn describe(&self) -> String {
        match self {
            SchemaOp::CreateTable(def) => format!("create table '{}'", def.name),
            SchemaOp::DropTable { name, .. } => format!("drop table '{name}'"),
            SchemaOp::AddColumn { table, column, .. } => {
                format!("add column '{}.{}'", table, column.name)
            }
            SchemaOp::DropColumn { table, column, .. } => {
                format!("drop column '{}.{}'", table, column.name)
            }
            SchemaOp::CreateDictionary(def) => format!("create dictionary '{}'", def.name),
            SchemaOp::DropDictionary { name, .. } => format!("drop dictionary '{name}'"),
            SchemaOp::RegisterRule(rule) => format!("register rule '{}'", rule.name()),
            SchemaOp::DropRule { name, .. } => format!("drop rule '{name}'"),
            SchemaOp::DataMigration { label, .. } => format!("data migration '{label}'"),
        }
    }

    fn apply(&self, pipeline: &Pipeline) -> Result<(), CascadeError> {
        match self {
            SchemaOp::CreateTable(def) => {
                pipeline.create_table_if_not_exists(def.clone())?;
                Ok(())
            }
            SchemaOp::DropTable { name, .. } => {
                pipeline.drop_table_if_exists(name);
                Ok(())
            }
            SchemaOp::AddColumn {
                table,
                column,
                default,
            } => {
                pipeline
                    .table(table)?
                    .add_column(column.clone(), default.clone())?;
                Ok(())
            }
            SchemaOp::DropColumn { table, column, .. } => {
                pipeline.table(table)?.drop_column(&column.name)?;
                Ok(())
            }
            SchemaOp::CreateDictionary(def) => {
                pipeline.register_dictionary_if_absent(def.clone())?;
                Ok(())
            }
            SchemaOp::DropDictionary { name, .. } => {
                pipeline.drop_dictionary_if_exists(name);
                Ok(())
            }
            SchemaOp::RegisterRule(rule) => {
                pipeline.register_rule_if_absent(rule.clone())?;
                Ok(())
            }
            SchemaOp::DropRule { name, .. } => {
                pipeline.drop_rule_if_exists(name);
                Ok(())
            }
            SchemaOp::DataMigration { forward, .. } => forward(pipeline),
        }
    }

    fn revert(&self, pipeline: &Pipeline) -> Result<(), CascadeError> {
        match self {
            SchemaOp::CreateTable(def) => {
                pipeline.drop_table_if_exists(&def.name);
                Ok(())
            }
            SchemaOp::DropTable { recreate, .. } => {
                if let Some(def) = recreate {
                    pipeline.create_table_if_not_exists(def.clone())?;
                }
                Ok(())
            }
            SchemaOp::AddColumn { table, column, .. } => {
                if let Ok(t) = pipeline.table(table) {
                    t.drop_column(&column.name)?;
                }
                Ok(())
            }
            SchemaOp::DropColumn {
                table,
                column,
                default,
            } => {
                pipeline
                    .table(table)?
                    .add_column(column.clone(), default.clone())?;
                Ok(())
            }
            SchemaOp::CreateDictionary(def) => {
                pipeline.drop_dictionary_if_exists(&def.name);
                Ok(())
            }
            SchemaOp::DropDictionary { recreate, .. } => {
                if let Some(def) = recreate {
                    pipeline.register_dictionary_if_absent(def.clone())?;
                }
                Ok(())
            }
            SchemaOp::RegisterRule(rule) => {
                pipeline.drop_rule_if_exists(rule.name());
                Ok(())
            }
            SchemaOp::DropRule { recreate, .. } => {
                if let Some(rule) = recreate {
                    pipeline.register_rule_if_absent(rule.clone())?;
                }
                Ok(())
            }
            // Bulk data motion is not undone.
            SchemaOp::DataMigration { .. } => Ok(()),
        }
    }
}

/// A named, ordered group of schema operations.
#[derive(Debug)]
pub struct Migration {
    pub name: String,
    pub ops: Vec<SchemaOp>,
}

impl Migration {
    pub fn new(name: impl Into<String>, ops: Vec<SchemaOp>) -> Self {
        Migration {
            name: name.into(),
            ops,
        }
    }
}

/// Applies an ordered migration list against a pipeline.
#[derive(Debug)]
pub struct Migrator {
    migrations: Vec<Migration>,
}

impl Migrator {
    pub const LEDGER_TABLE: &'static str = "schema_migrations";

    /// Build a migrator. Names must be unique and in ascending order —
    /// the name prefix is the sequence (e.g. `0003_add_labels_column`).
    pub fn new(migrations: Vec<Migration>) -> Result<Self, CascadeError> {
        for pair in migrations.windows(2) {
            if pair[0].name >= pair[1].name {
                return Err(CascadeError::InvalidArgument(format!(
                    "migrations must be uniquely named in ascending order: \
                     '{}' then '{}'",
                    pair[0].name, pair[1].name
                )));
            }
        }
        Ok(Migrator { migrations })
    }

    fn ledger_def() -> TableDef {
        TableDef::replacing(
            Self::LEDGER_TABLE,
            vec![
                ColumnDef::new("name", DataType::String),
                ColumnDef::new("applied_at", DataType::Timestamp),
            ],
            &["name"],
        )
    }

    fn ensure_ledger(pipeline: &Pipeline) -> Result<(), CascadeError> {
        pipeline.create_table_if_not_exists(Self::ledger_def())?;
        Ok(())
    }

    /// Names of applied migrations, under reconciled read.
    pub fn applied(&self, pipeline: &Pipeline) -> Result<BTreeSet<String>, CascadeError> {
        if !pipeline.has_table(Self::LEDGER_TABLE) {
            return Ok(BTreeSet::new());
        }
        Ok(pipeline
            .reconciled(Self::LEDGER_TABLE)?
            .into_iter()
            .filter_map(|r| r.values[0].as_str().map(str::to_string))
            .collect())
    }

    /// Pending migration names, in application order.
    pub fn pending(&self, pipeline: &Pipeline) -> Result<Vec<String>, CascadeError> {
        let applied = self.applied(pipeline)?;
        Ok(self
            .migrations
            .iter()
            .filter(|m| !applied.contains(&m.name))
            .map(|m| m.name.clone())
            .collect())
    }

    /// Apply every pending migration in order. Halts on the first failure:
    /// the error names the migration, previously applied ones stay
    /// recorded, and nothing after the failure runs. Returns how many
    /// migrations were applied.
    pub fn up(&self, pipeline: &Pipeline) -> Result<usize, CascadeError> {
        Self::ensure_ledger(pipeline)?;
        let applied = self.applied(pipeline)?;

        let mut count = 0;
        for migration in &self.migrations {
            if applied.contains(&migration.name) {
                continue;
            }
            for op in &migration.ops {
                op.apply(pipeline).map_err(|e| CascadeError::MigrationHalted {
                    name: migration.name.clone(),
                    reason: format!("{}: {e}", op.describe()),
                })?;
            }
            Self::record(pipeline, &migration.name, false)?;
            log::info!("applied migration '{}'", migration.name);
            count += 1;
        }
        Ok(count)
    }

    /// Revert the last `n` applied migrations, most recent first. Each
    /// migration's operations revert in reverse declaration order.
    pub fn down(&self, pipeline: &Pipeline, n: usize) -> Result<usize, CascadeError> {
        Self::ensure_ledger(pipeline)?;
        let applied = self.applied(pipeline)?;

        let mut count = 0;
        for migration in self.migrations.iter().rev() {
            if count == n {
                break;
            }
            if !applied.contains(&migration.name) {
                continue;
            }
            for op in migration.ops.iter().rev() {
                op.revert(pipeline)
                    .map_err(|e| CascadeError::MigrationHalted {
                        name: migration.name.clone(),
                        reason: format!("revert {}: {e}", op.describe()),
                    })?;
            }
            Self::record(pipeline, &migration.name, true)?;
            log::info!("reverted migration '{}'", migration.name);
            count += 1;
        }
        Ok(count)
    }

    /// Append a ledger row (tombstone for reverts). Ledger versions come
    /// from the wall clock; equal-timestamp writes resolve by insertion
    /// sequence, so apply-then-revert within one microsecond still reads
    /// back correctly.
    fn record(pipeline: &Pipeline, name: &str, revert: bool) -> Result<(), CascadeError> {
        let now = Version::now();
        let values = vec![
            Value::String(name.to_string()),
            Value::Timestamp(now.as_micros()),
        ];
        let row = if revert {
            Row::tombstone(values, now)
        } else {
            Row::new(values, now)
        };
        pipeline.insert(Self::LEDGER_TABLE, vec![row])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_def(name: &str) -> TableDef {
        TableDef::replacing(
            name,
            vec![
                ColumnDef::new("id", DataType::Int64),
                ColumnDef::nullable("title", DataType::String),
            ],
            &["id"],
        )
    }

    fn create_tables() -> Migrator {
        Migrator::new(vec![
            Migration::new(
                "0001_create_issues",
                vec![SchemaOp::CreateTable(table_def("issues"))],
            ),
            Migration::new(
                "0002_create_labels",
                vec![SchemaOp::CreateTable(table_def("labels"))],
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_up_applies_in_order_and_records() {
        let p = Pipeline::with_defaults();
        let m = create_tables();
        assert_eq!(m.up(&p).unwrap(), 2);
        assert!(p.has_table("issues"));
        assert!(p.has_table("labels"));

        let applied = m.applied(&p).unwrap();
        assert!(applied.contains("0001_create_issues"));
        assert!(applied.contains("0002_create_labels"));

        // Converges: a second run applies nothing.
        assert_eq!(m.up(&p).unwrap(), 0);
    }

    #[test]
    fn test_down_reverts_most_recent_first() {
        let p = Pipeline::with_defaults();
        let m = create_tables();
        m.up(&p).unwrap();

        assert_eq!(m.down(&p, 1).unwrap(), 1);
        assert!(p.has_table("issues"));
        assert!(!p.has_table("labels"));
        assert_eq!(
            m.pending(&p).unwrap(),
            vec!["0002_create_labels".to_string()]
        );

        // Forward-then-reverse is structurally a no-op; up re-applies.
        assert_eq!(m.up(&p).unwrap(), 1);
        assert!(p.has_table("labels"));
    }

    #[test]
    fn test_halt_on_failure_keeps_earlier_applied(){
        let p = Pipeline::with_defaults();
        let m = Migrator::new(vec![
            Migration::new(
                "0001_ok",
                vec![SchemaOp::CreateTable(table_def("issues"))],
            ),
            Migration::new(
                "0002_broken",
                vec![SchemaOp::AddColumn {
                    table: "missing".into(),
                    column: ColumnDef::nullable("x", DataType::Int64),
                    default: Value::Null,
                }],
            ),
            Migration::new(
                "0003_never_runs",
                vec![SchemaOp::CreateTable(table_def("labels"))],
            ),
        ])
        .unwrap();

        let err = m.up(&p).unwrap_err();
        match &err {
            CascadeError::MigrationHalted { name, .. } => {
                assert_eq!(name, "0002_broken");
            }
            other => panic!("expected MigrationHalted, got {other:?}"),
        }

        // The failed run halted the sequence.
        assert!(p.has_table("issues"));
        assert!(!p.has_table("labels"));
        let applied = m.applied(&p).unwrap();
        assert!(applied.contains("0001_ok"));
        assert!(!applied.contains("0002_broken"));
    }

    #[test]
    fn test_add_and_drop_column_ops() {
        let p = Pipeline::with_defaults();
        let m = Migrator::new(vec![
            Migration::new(
                "0001_create",
                vec![SchemaOp::CreateTable(table_def("issues"))],
            ),
            Migration::new(
                "0002_add_weight",
                vec![SchemaOp::AddColumn {
                    table: "issues".into(),
                    column: ColumnDef::nullable("weight", DataType::Int64),
                    default: Value::Null,
                }],
            ),
        ])
        .unwrap();
        m.up(&p).unwrap();
        assert!(p.table("issues").unwrap().def().column("weight").is_some());

        // Reverting the add drops the column (destructive, explicit).
        m.down(&p, 1).unwrap();
        assert!(p.table("issues").unwrap().def().column("weight").is_none());
    }

    #[test]
    fn test_data_migration_no_op_reverse() {
        let p = Pipeline::with_defaults();
        let m = Migrator::new(vec![
            Migration::new(
                "0001_create",
                vec![SchemaOp::CreateTable(table_def("issues"))],
            ),
            Migration::new(
                "0002_seed",
                vec![SchemaOp::DataMigration {
                    label: "seed issues".into(),
                    forward: Arc::new(|p: &Pipeline| {
                        p.insert(
                            "issues",
                            vec![Row::new(
                                vec![Value::Int64(1), Value::String("seeded".into())],
                                Version(10),
                            )],
                        )?;
                        Ok(())
                    }),
                }],
            ),
        ])
        .unwrap();
        m.up(&p).unwrap();
        assert_eq!(p.reconciled("issues").unwrap().len(), 1);

        // Reverting does not undo the data motion.
        m.down(&p, 1).unwrap();
        assert_eq!(p.reconciled("issues").unwrap().len(), 1);
        assert_eq!(
            m.pending(&p).unwrap(),
            vec!["0002_seed".to_string()]
        );
    }

    #[test]
    fn test_out_of_order_names_rejected() {
        let err = Migrator::new(vec![
            Migration::new("0002_b", vec![]),
            Migration::new("0001_a", vec![]),
        ])
        .unwrap_err();
        assert!(matches!(err, CascadeError::InvalidArgument(_)));
    }

    #[test]
    fn test_partial_rerun_converges() {
        // Simulates a crash between the op and the ledger write: the table
        // exists but the migration is unrecorded. Re-running converges
        // because ops are statement-level idempotent.
        let p = Pipeline::with_defaults();
        p.create_table(table_def("issues")).unwrap();

        let m = create_tables();
        assert_eq!(m.up(&p).unwrap(), 2);
        assert!(p.has_table("issues"));
        assert!(p.has_table("labels"));
    }
}
