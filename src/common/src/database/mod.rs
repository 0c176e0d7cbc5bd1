//! Database collaborators used by the partition manager.
//!
//! [`Queryable`] is the read/execute surface shared by a pooled connection and an
//! open transaction. Catalog introspection is exposed as typed methods so that
//! callers never parse catalog rows themselves.

mod postgres;

pub use postgres::{PgDatabase, PgTransaction};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Schema holding every partition created by the manager.
pub const DYNAMIC_PARTITIONS_SCHEMA: &str = "dynamic_partitions";

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";
/// SQLSTATE raised when `statement_timeout` expires.
const QUERY_CANCELED: &str = "57014";

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("timed out waiting for a lock")]
    LockTimeout,

    #[error("statement timed out")]
    StatementTimeout,

    #[error("could not acquire the required locks after {attempts} attempts")]
    LockRetriesExhausted { attempts: usize },

    #[error("database error: {0}")]
    Sqlx(#[source] sqlx::Error),

    #[error("unsupported statement: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

impl DatabaseError {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, DatabaseError::LockTimeout)
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.code().as_deref() {
                Some(LOCK_NOT_AVAILABLE) => return DatabaseError::LockTimeout,
                Some(QUERY_CANCELED) => return DatabaseError::StatementTimeout,
                _ => {}
            }
        }
        DatabaseError::Sqlx(err)
    }
}

/// A partition attached to a parent table, as reported by `pg_inherits`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresPartition {
    pub parent_table: String,
    pub schema: String,
    pub name: String,
    /// Bound expression, e.g. `FOR VALUES IN ('1')`
    pub condition: String,
}

impl PostgresPartition {
    pub fn identifier(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresForeignKey {
    pub name: String,
    /// `schema.table` owning the constraint
    pub constrained_table: String,
    /// `schema.table` the constraint points at
    pub referenced_table: String,
    /// Output of `pg_get_constraintdef`, e.g. `FOREIGN KEY (project_id) REFERENCES projects(id)`
    pub definition: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    Check,
    ForeignKey,
    Other,
}

impl ConstraintKind {
    pub fn from_contype(contype: &str) -> Self {
        match contype {
            "p" => ConstraintKind::PrimaryKey,
            "u" => ConstraintKind::Unique,
            "c" => ConstraintKind::Check,
            "f" => ConstraintKind::ForeignKey,
            _ => ConstraintKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConstraint {
    pub name: String,
    pub kind: ConstraintKind,
    pub valid: bool,
    pub column_names: Vec<String>,
    /// Output of `pg_get_constraintdef`, e.g. `CHECK ((partition_id = 100))`
    pub definition: String,
}

/// A sequence owned by a table column (`ALTER SEQUENCE .. OWNED BY`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedSequence {
    /// `schema.sequence`
    pub name: String,
    pub column_name: String,
}

/// Bookkeeping row for a partition that was detached and awaits its drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedPartition {
    pub id: i64,
    /// Bare partition name inside [`DYNAMIC_PARTITIONS_SCHEMA`], or
    /// `<schema>.<name>` for a partition living elsewhere
    pub table_name: String,
    pub drop_after: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueBound {
    Min,
    Max,
}

impl ValueBound {
    fn aggregate(&self) -> &'static str {
        match self {
            ValueBound::Min => "MIN",
            ValueBound::Max => "MAX",
        }
    }
}

/// Outcome of a transaction body that may decide to back out harmlessly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    /// The work was already done by someone else; nothing was changed
    AbortedBenignly,
}

#[async_trait]
pub trait Queryable: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<(), DatabaseError>;

    async fn table_exists(&self, table: &str) -> Result<bool, DatabaseError>;

    /// Whether `table` is registered in `pg_partitioned_table`.
    async fn is_partitioned(&self, table: &str) -> Result<bool, DatabaseError>;

    /// Partitions currently attached to `parent`, ordered by name.
    async fn partitions(&self, parent: &str) -> Result<Vec<PostgresPartition>, DatabaseError>;

    /// Parent of `table` if it is currently attached as a partition.
    async fn partition_parent(&self, table: &str) -> Result<Option<String>, DatabaseError>;

    /// `SELECT 1 FROM table LIMIT 1` returned a row.
    async fn holds_data(&self, table: &str) -> Result<bool, DatabaseError>;

    async fn timestamp_bound(
        &self,
        table: &str,
        column: &str,
        bound: ValueBound,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    /// Raw `information_schema.columns.column_default` of a column.
    async fn column_default(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Option<String>, DatabaseError>;

    /// Minimum value of the sequence backing `table.column`, if any.
    async fn sequence_min_value(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Option<i64>, DatabaseError>;

    /// Foreign keys on other tables pointing at `table`.
    async fn foreign_keys_referencing(
        &self,
        table: &str,
    ) -> Result<Vec<PostgresForeignKey>, DatabaseError>;

    /// Foreign keys defined on `table`.
    async fn foreign_keys_constrained_by(
        &self,
        table: &str,
    ) -> Result<Vec<PostgresForeignKey>, DatabaseError>;

    async fn constraints(&self, table: &str) -> Result<Vec<PostgresConstraint>, DatabaseError>;

    async fn owned_sequences(&self, table: &str) -> Result<Vec<OwnedSequence>, DatabaseError>;

    /// `pg_stat_all_tables.last_analyze` of `table`.
    async fn last_analyzed_at(
        &self,
        table: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    async fn detached_partitions_ready_to_drop(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DetachedPartition>, DatabaseError>;

    /// Re-fetch a detached partition record with a row lock (`FOR UPDATE`).
    async fn lock_detached_partition(
        &self,
        id: i64,
    ) -> Result<Option<DetachedPartition>, DatabaseError>;

    async fn insert_detached_partition(
        &self,
        table_name: &str,
        drop_after: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn delete_detached_partition(&self, id: i64) -> Result<(), DatabaseError>;
}

/// A pooled handle to one logical database.
#[async_trait]
pub trait Connection: Queryable {
    /// Connection name from the configuration (e.g. `main`)
    fn name(&self) -> &str;

    /// Whether data reads may be served by replicas. Catalog reads, DDL and
    /// transactions always run on the primary.
    fn load_balanced(&self) -> bool;

    /// Open a transaction on the primary.
    async fn begin(&self) -> Result<Box<dyn Transaction>, DatabaseError>;
}

/// An open transaction. Dropping it without committing rolls it back.
#[async_trait]
pub trait Transaction: Queryable {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}

/// Quote a single identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified table name: `a.b` becomes `"a"."b"`.
pub fn quote_table_name(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

/// Quote a string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Split `schema.table` into its parts; unqualified names have no schema.
pub fn split_identifier(name: &str) -> (Option<&str>, &str) {
    match name.split_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, name),
    }
}

/// Qualify a bare partition name with [`DYNAMIC_PARTITIONS_SCHEMA`]; names
/// that already carry a schema are kept.
pub fn qualify_partition_name(name: &str) -> String {
    match split_identifier(name) {
        (Some(_), _) => name.to_string(),
        (None, _) => format!("{DYNAMIC_PARTITIONS_SCHEMA}.{name}"),
    }
}
