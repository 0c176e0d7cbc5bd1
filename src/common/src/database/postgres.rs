use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::{PgExecutor, PgPool, Row, query, query_as, query_scalar};
use tokio::sync::Mutex;

use super::{
    ConstraintKind, DYNAMIC_PARTITIONS_SCHEMA, DatabaseError, DetachedPartition, OwnedSequence,
    PostgresConstraint, PostgresForeignKey, PostgresPartition, Queryable, Transaction, ValueBound,
    quote_ident, quote_table_name, split_identifier,
};
use crate::config::DatabaseConfig;

/// A PostgreSQL database: one primary pool plus optional read replicas.
#[derive(Debug)]
pub struct PgDatabase {
    name: String,
    primary: PgPool,
    replicas: Vec<PgPool>,
    next_replica: AtomicUsize,
}

impl PgDatabase {
    /// Connect to the primary and replicas of `config` and bootstrap the
    /// bookkeeping schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        tracing::info!(connection_name = %config.name, "Connecting to database");

        let primary = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.dsn)
            .await
            .map_err(|e| {
                tracing::error!(connection_name = %config.name, error = %e, "Failed to connect to primary");
                e
            })?;

        let mut replicas = Vec::with_capacity(config.replica_dsns.len());
        for dsn in &config.replica_dsns {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(dsn)
                .await?;
            replicas.push(pool);
        }

        let database = Self::from_pools(config.name.clone(), primary, replicas);
        database.init().await.map_err(|e| {
            tracing::error!(connection_name = %config.name, error = %e, "Failed to initialize bookkeeping schema");
            e
        })?;
        tracing::info!(
            connection_name = %config.name,
            replicas = database.replicas.len(),
            "Database connection established successfully"
        );
        Ok(database)
    }

    pub fn from_pools(name: String, primary: PgPool, replicas: Vec<PgPool>) -> Self {
        Self {
            name,
            primary,
            replicas,
            next_replica: AtomicUsize::new(0),
        }
    }

    pub fn primary_pool(&self) -> &PgPool {
        &self.primary
    }

    /// Create the partitions schema, the detached partition bookkeeping table
    /// and the trigger function used to lock writes, if they do not exist.
    async fn init(&self) -> Result<(), DatabaseError> {
        let create_schema = format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(DYNAMIC_PARTITIONS_SCHEMA)
        );
        query(&create_schema).execute(&self.primary).await?;

        let create_detached_partitions = r#"
        CREATE TABLE IF NOT EXISTS detached_partitions (
            id BIGSERIAL PRIMARY KEY,
            table_name TEXT NOT NULL UNIQUE,
            drop_after TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#;
        query(create_detached_partitions)
            .execute(&self.primary)
            .await?;

        let create_prevent_write = r#"
        CREATE OR REPLACE FUNCTION prevent_partition_write() RETURNS TRIGGER
        LANGUAGE plpgsql AS $$
        BEGIN
            RAISE EXCEPTION 'Table: "%" is write protected within this database', TG_TABLE_NAME;
        END
        $$"#;
        query(create_prevent_write).execute(&self.primary).await?;

        Ok(())
    }

    /// Pick a pool for a data read: round-robin over replicas, else the primary.
    fn read_pool(&self) -> &PgPool {
        if self.replicas.is_empty() {
            return &self.primary;
        }
        let index = self.next_replica.fetch_add(1, Ordering::Relaxed) % self.replicas.len();
        &self.replicas[index]
    }
}

#[async_trait]
impl Queryable for PgDatabase {
    async fn execute(&self, sql: &str) -> Result<(), DatabaseError> {
        queries::execute(&self.primary, sql).await
    }

    async fn table_exists(&self, table: &str) -> Result<bool, DatabaseError> {
        queries::table_exists(&self.primary, table).await
    }

    async fn is_partitioned(&self, table: &str) -> Result<bool, DatabaseError> {
        queries::is_partitioned(&self.primary, table).await
    }

    async fn partitions(&self, parent: &str) -> Result<Vec<PostgresPartition>, DatabaseError> {
        queries::partitions(&self.primary, parent).await
    }

    async fn partition_parent(&self, table: &str) -> Result<Option<String>, DatabaseError> {
        queries::partition_parent(&self.primary, table).await
    }

    async fn holds_data(&self, table: &str) -> Result<bool, DatabaseError> {
        queries::holds_data(self.read_pool(), table).await
    }

    async fn timestamp_bound(
        &self,
        table: &str,
        column: &str,
        bound: ValueBound,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        queries::timestamp_bound(self.read_pool(), table, column, bound).await
    }

    async fn column_default(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Option<String>, DatabaseError> {
        queries::column_default(&self.primary, table, column).await
    }

    async fn sequence_min_value(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Option<i64>, DatabaseError> {
        queries::sequence_min_value(&self.primary, table, column).await
    }

    async fn foreign_keys_referencing(
        &self,
        table: &str,
    ) -> Result<Vec<PostgresForeignKey>, DatabaseError> {
        queries::foreign_keys(&self.primary, table, queries::ForeignKeySide::Referenced).await
    }

    async fn foreign_keys_constrained_by(
        &self,
        table: &str,
    ) -> Result<Vec<PostgresForeignKey>, DatabaseError> {
        queries::foreign_keys(&self.primary, table, queries::ForeignKeySide::Constrained).await
    }

    async fn constraints(&self, table: &str) -> Result<Vec<PostgresConstraint>, DatabaseError> {
        queries::constraints(&self.primary, table).await
    }

    async fn owned_sequences(&self, table: &str) -> Result<Vec<OwnedSequence>, DatabaseError> {
        queries::owned_sequences(&self.primary, table).await
    }

    async fn last_analyzed_at(
        &self,
        table: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        // Statistics views on replicas are unreliable.
        queries::last_analyzed_at(&self.primary, table).await
    }

    async fn detached_partitions_ready_to_drop(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DetachedPartition>, DatabaseError> {
        queries::detached_partitions_ready_to_drop(&self.primary, now).await
    }

    async fn lock_detached_partition(
        &self,
        id: i64,
    ) -> Result<Option<DetachedPartition>, DatabaseError> {
        queries::lock_detached_partition(&self.primary, id).await
    }

    async fn insert_detached_partition(
        &self,
        table_name: &str,
        drop_after: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        queries::insert_detached_partition(&self.primary, table_name, drop_after).await
    }

    async fn delete_detached_partition(&self, id: i64) -> Result<(), DatabaseError> {
        queries::delete_detached_partition(&self.primary, id).await
    }
}

#[async_trait]
impl super::Connection for PgDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_balanced(&self) -> bool {
        !self.replicas.is_empty()
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, DatabaseError> {
        let tx = self.primary.begin().await?;
        Ok(Box::new(PgTransaction { tx: Mutex::new(tx) }))
    }
}

/// A transaction on the primary pool.
pub struct PgTransaction {
    tx: Mutex<sqlx::Transaction<'static, Postgres>>,
}

#[async_trait]
impl Queryable for PgTransaction {
    async fn execute(&self, sql: &str) -> Result<(), DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::execute(&mut **tx, sql).await
    }

    async fn table_exists(&self, table: &str) -> Result<bool, DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::table_exists(&mut **tx, table).await
    }

    async fn is_partitioned(&self, table: &str) -> Result<bool, DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::is_partitioned(&mut **tx, table).await
    }

    async fn partitions(&self, parent: &str) -> Result<Vec<PostgresPartition>, DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::partitions(&mut **tx, parent).await
    }

    async fn partition_parent(&self, table: &str) -> Result<Option<String>, DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::partition_parent(&mut **tx, table).await
    }

    async fn holds_data(&self, table: &str) -> Result<bool, DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::holds_data(&mut **tx, table).await
    }

    async fn timestamp_bound(
        &self,
        table: &str,
        column: &str,
        bound: ValueBound,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::timestamp_bound(&mut **tx, table, column, bound).await
    }

    async fn column_default(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::column_default(&mut **tx, table, column).await
    }

    async fn sequence_min_value(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Option<i64>, DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::sequence_min_value(&mut **tx, table, column).await
    }

    async fn foreign_keys_referencing(
        &self,
        table: &str,
    ) -> Result<Vec<PostgresForeignKey>, DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::foreign_keys(&mut **tx, table, queries::ForeignKeySide::Referenced).await
    }

    async fn foreign_keys_constrained_by(
        &self,
        table: &str,
    ) -> Result<Vec<PostgresForeignKey>, DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::foreign_keys(&mut **tx, table, queries::ForeignKeySide::Constrained).await
    }

    async fn constraints(&self, table: &str) -> Result<Vec<PostgresConstraint>, DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::constraints(&mut **tx, table).await
    }

    async fn owned_sequences(&self, table: &str) -> Result<Vec<OwnedSequence>, DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::owned_sequences(&mut **tx, table).await
    }

    async fn last_analyzed_at(
        &self,
        table: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::last_analyzed_at(&mut **tx, table).await
    }

    async fn detached_partitions_ready_to_drop(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DetachedPartition>, DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::detached_partitions_ready_to_drop(&mut **tx, now).await
    }

    async fn lock_detached_partition(
        &self,
        id: i64,
    ) -> Result<Option<DetachedPartition>, DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::lock_detached_partition(&mut **tx, id).await
    }

    async fn insert_detached_partition(
        &self,
        table_name: &str,
        drop_after: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::insert_detached_partition(&mut **tx, table_name, drop_after).await
    }

    async fn delete_detached_partition(&self, id: i64) -> Result<(), DatabaseError> {
        let mut tx = self.tx.lock().await;
        queries::delete_detached_partition(&mut **tx, id).await
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let PgTransaction { tx } = *self;
        tx.into_inner().commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        let PgTransaction { tx } = *self;
        tx.into_inner().rollback().await?;
        Ok(())
    }
}

/// Catalog queries, usable on a pool or on an open transaction.
mod queries {
    use super::*;

    pub enum ForeignKeySide {
        Referenced,
        Constrained,
    }

    pub async fn execute<'e, E: PgExecutor<'e>>(
        executor: E,
        sql: &str,
    ) -> Result<(), DatabaseError> {
        query(sql).execute(executor).await?;
        Ok(())
    }

    pub async fn table_exists<'e, E: PgExecutor<'e>>(
        executor: E,
        table: &str,
    ) -> Result<bool, DatabaseError> {
        let exists = query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
            .bind(quote_table_name(table))
            .fetch_one(executor)
            .await?;
        Ok(exists)
    }

    pub async fn is_partitioned<'e, E: PgExecutor<'e>>(
        executor: E,
        table: &str,
    ) -> Result<bool, DatabaseError> {
        let (schema, name) = split_identifier(table);
        let stmt = r#"
        SELECT EXISTS (
            SELECT 1
            FROM pg_partitioned_table pt
            JOIN pg_class c ON c.oid = pt.partrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relname = $1 AND n.nspname = COALESCE($2, current_schema())
        )"#;
        let exists = query_scalar::<_, bool>(stmt)
            .bind(name)
            .bind(schema)
            .fetch_one(executor)
            .await?;
        Ok(exists)
    }

    pub async fn partitions<'e, E: PgExecutor<'e>>(
        executor: E,
        parent: &str,
    ) -> Result<Vec<PostgresPartition>, DatabaseError> {
        let (schema, name) = split_identifier(parent);
        let stmt = r#"
        SELECT c.relname AS name,
               n.nspname AS schema,
               pg_get_expr(c.relpartbound, c.oid) AS condition
        FROM pg_inherits i
        JOIN pg_class c ON c.oid = i.inhrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        JOIN pg_class p ON p.oid = i.inhparent
        JOIN pg_namespace pn ON pn.oid = p.relnamespace
        WHERE p.relname = $1 AND pn.nspname = COALESCE($2, current_schema())
        ORDER BY c.relname
        "#;
        let rows = query(stmt)
            .bind(name)
            .bind(schema)
            .fetch_all(executor)
            .await?;

        let mut partitions = Vec::with_capacity(rows.len());
        for row in rows {
            partitions.push(PostgresPartition {
                parent_table: parent.to_string(),
                schema: row.get("schema"),
                name: row.get("name"),
                condition: row.get("condition"),
            });
        }
        Ok(partitions)
    }

    pub async fn partition_parent<'e, E: PgExecutor<'e>>(
        executor: E,
        table: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let (schema, name) = split_identifier(table);
        let stmt = r#"
        SELECT p.relname
        FROM pg_inherits i
        JOIN pg_class c ON c.oid = i.inhrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        JOIN pg_class p ON p.oid = i.inhparent
        WHERE c.relname = $1 AND n.nspname = COALESCE($2, current_schema())
        "#;
        let parent = query_scalar::<_, String>(stmt)
            .bind(name)
            .bind(schema)
            .fetch_optional(executor)
            .await?;
        Ok(parent)
    }

    pub async fn holds_data<'e, E: PgExecutor<'e>>(
        executor: E,
        table: &str,
    ) -> Result<bool, DatabaseError> {
        let stmt = format!(
            "SELECT EXISTS (SELECT 1 FROM {} LIMIT 1)",
            quote_table_name(table)
        );
        let exists = query_scalar::<_, bool>(&stmt).fetch_one(executor).await?;
        Ok(exists)
    }

    pub async fn timestamp_bound<'e, E: PgExecutor<'e>>(
        executor: E,
        table: &str,
        column: &str,
        bound: ValueBound,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let stmt = format!(
            "SELECT {}({})::timestamptz FROM {}",
            bound.aggregate(),
            quote_ident(column),
            quote_table_name(table)
        );
        let value = query_scalar::<_, Option<DateTime<Utc>>>(&stmt)
            .fetch_one(executor)
            .await?;
        Ok(value)
    }

    pub async fn column_default<'e, E: PgExecutor<'e>>(
        executor: E,
        table: &str,
        column: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let (schema, name) = split_identifier(table);
        let stmt = r#"
        SELECT columns.column_default
        FROM information_schema.columns columns
        WHERE columns.table_name = $1
          AND columns.column_name = $2
          AND columns.table_schema = COALESCE($3, current_schema())
        "#;
        let value = query_scalar::<_, Option<String>>(stmt)
            .bind(name)
            .bind(column)
            .bind(schema)
            .fetch_optional(executor)
            .await?;
        Ok(value.flatten())
    }

    pub async fn sequence_min_value<'e, E: PgExecutor<'e>>(
        executor: E,
        table: &str,
        column: &str,
    ) -> Result<Option<i64>, DatabaseError> {
        let stmt = r#"
        SELECT seqmin
        FROM pg_sequence
        WHERE seqrelid = pg_get_serial_sequence($1, $2)::regclass
        "#;
        let value = query_scalar::<_, i64>(stmt)
            .bind(quote_table_name(table))
            .bind(column)
            .fetch_optional(executor)
            .await?;
        Ok(value)
    }

    pub async fn foreign_keys<'e, E: PgExecutor<'e>>(
        executor: E,
        table: &str,
        side: ForeignKeySide,
    ) -> Result<Vec<PostgresForeignKey>, DatabaseError> {
        let (schema, name) = split_identifier(table);
        let filter = match side {
            ForeignKeySide::Referenced => "r.relname = $1 AND rn.nspname = COALESCE($2, current_schema())",
            ForeignKeySide::Constrained => "c.relname = $1 AND cn.nspname = COALESCE($2, current_schema())",
        };
        let stmt = format!(
            r#"
        SELECT con.conname AS name,
               cn.nspname || '.' || c.relname AS constrained_table,
               rn.nspname || '.' || r.relname AS referenced_table,
               pg_get_constraintdef(con.oid) AS definition
        FROM pg_constraint con
        JOIN pg_class c ON c.oid = con.conrelid
        JOIN pg_namespace cn ON cn.oid = c.relnamespace
        JOIN pg_class r ON r.oid = con.confrelid
        JOIN pg_namespace rn ON rn.oid = r.relnamespace
        WHERE con.contype = 'f' AND {filter}
        ORDER BY con.conname
        "#
        );
        let rows = query(&stmt)
            .bind(name)
            .bind(schema)
            .fetch_all(executor)
            .await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            keys.push(PostgresForeignKey {
                name: row.get("name"),
                constrained_table: row.get("constrained_table"),
                referenced_table: row.get("referenced_table"),
                definition: row.get("definition"),
            });
        }
        Ok(keys)
    }

    pub async fn constraints<'e, E: PgExecutor<'e>>(
        executor: E,
        table: &str,
    ) -> Result<Vec<PostgresConstraint>, DatabaseError> {
        let (schema, name) = split_identifier(table);
        let stmt = r#"
        SELECT con.conname AS name,
               con.contype::text AS kind,
               con.convalidated AS valid,
               pg_get_constraintdef(con.oid) AS definition,
               ARRAY(
                   SELECT a.attname::text
                   FROM unnest(con.conkey) AS k(attnum)
                   JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
               ) AS column_names
        FROM pg_constraint con
        JOIN pg_class c ON c.oid = con.conrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE c.relname = $1 AND n.nspname = COALESCE($2, current_schema())
        ORDER BY con.conname
        "#;
        let rows = query(stmt)
            .bind(name)
            .bind(schema)
            .fetch_all(executor)
            .await?;

        let mut constraints = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.get("kind");
            constraints.push(PostgresConstraint {
                name: row.get("name"),
                kind: ConstraintKind::from_contype(&kind),
                valid: row.get("valid"),
                column_names: row.get("column_names"),
                definition: row.get("definition"),
            });
        }
        Ok(constraints)
    }

    pub async fn owned_sequences<'e, E: PgExecutor<'e>>(
        executor: E,
        table: &str,
    ) -> Result<Vec<OwnedSequence>, DatabaseError> {
        let (schema, name) = split_identifier(table);
        let stmt = r#"
        SELECT seq_ns.nspname || '.' || seq.relname AS name,
               a.attname::text AS column_name
        FROM pg_class seq
        JOIN pg_namespace seq_ns ON seq_ns.oid = seq.relnamespace
        JOIN pg_depend d ON d.objid = seq.oid
            AND d.classid = 'pg_class'::regclass
            AND d.refclassid = 'pg_class'::regclass
            AND d.deptype = 'a'
        JOIN pg_class t ON t.oid = d.refobjid
        JOIN pg_namespace tn ON tn.oid = t.relnamespace
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = d.refobjsubid
        WHERE seq.relkind = 'S' AND t.relname = $1 AND tn.nspname = COALESCE($2, current_schema())
        ORDER BY seq.relname
        "#;
        let rows = query(stmt)
            .bind(name)
            .bind(schema)
            .fetch_all(executor)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| OwnedSequence {
                name: row.get("name"),
                column_name: row.get("column_name"),
            })
            .collect())
    }

    pub async fn last_analyzed_at<'e, E: PgExecutor<'e>>(
        executor: E,
        table: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let value = query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT last_analyze FROM pg_stat_all_tables WHERE relid = to_regclass($1)",
        )
        .bind(quote_table_name(table))
        .fetch_optional(executor)
        .await?;
        Ok(value.flatten())
    }

    pub async fn detached_partitions_ready_to_drop<'e, E: PgExecutor<'e>>(
        executor: E,
        now: DateTime<Utc>,
    ) -> Result<Vec<DetachedPartition>, DatabaseError> {
        let rows = query_as::<_, (i64, String, DateTime<Utc>)>(
            "SELECT id, table_name, drop_after FROM detached_partitions WHERE drop_after < $1 ORDER BY id",
        )
        .bind(now)
        .fetch_all(executor)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, table_name, drop_after)| DetachedPartition {
                id,
                table_name,
                drop_after,
            })
            .collect())
    }

    pub async fn lock_detached_partition<'e, E: PgExecutor<'e>>(
        executor: E,
        id: i64,
    ) -> Result<Option<DetachedPartition>, DatabaseError> {
        let row = query_as::<_, (i64, String, DateTime<Utc>)>(
            "SELECT id, table_name, drop_after FROM detached_partitions WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(executor)
        .await?;
        Ok(row.map(|(id, table_name, drop_after)| DetachedPartition {
            id,
            table_name,
            drop_after,
        }))
    }

    pub async fn insert_detached_partition<'e, E: PgExecutor<'e>>(
        executor: E,
        table_name: &str,
        drop_after: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let stmt = r#"
        INSERT INTO detached_partitions (table_name, drop_after)
        VALUES ($1, $2)
        ON CONFLICT (table_name) DO UPDATE SET drop_after = EXCLUDED.drop_after
        "#;
        query(stmt)
            .bind(table_name)
            .bind(drop_after)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn delete_detached_partition<'e, E: PgExecutor<'e>>(
        executor: E,
        id: i64,
    ) -> Result<(), DatabaseError> {
        query("DELETE FROM detached_partitions WHERE id = $1")
            .bind(id)
            .execute(executor)
            .await?;
        Ok(())
    }
}
