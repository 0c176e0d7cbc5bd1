//! Turns an existing table into the first partition of a new list
//! partitioned parent.
//!
//! Conversion is done in two migrations. [`ConvertTable::prepare_for_partitioning`]
//! adds a check constraint pinning the partitioning column to the zero
//! partition values, which lets Postgres attach the table without scanning
//! it. [`ConvertTable::partition`] then creates the parent and swaps it in.

use std::collections::BTreeSet;
use std::sync::Arc;

use common::database::{
    Connection, ConstraintKind, PostgresConstraint, Queryable, quote_ident, quote_table_name,
};
use common::lock_retries::{DEFAULT_TIMING_CONFIGURATION, WithLockRetries, begin_with_lock_timeout};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use crate::error::{PartitioningError, Result};

pub const PARTITIONING_CONSTRAINT_NAME: &str = "partitioning_constraint";

static INTEGER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid regex"));

pub struct ConvertTable {
    connection: Arc<dyn Connection>,
    table_name: String,
    parent_table_name: String,
    partitioning_column: String,
    zero_partition_values: Vec<i64>,
    locking_order: Vec<String>,
    lock_retries: WithLockRetries,
}

impl ConvertTable {
    pub fn new(
        connection: Arc<dyn Connection>,
        table_name: &str,
        parent_table_name: &str,
        partitioning_column: &str,
        zero_partition_values: Vec<i64>,
    ) -> Result<Self> {
        let values: BTreeSet<i64> = zero_partition_values.into_iter().collect();
        if values.is_empty() {
            return Err(PartitioningError::InvalidArgument(format!(
                "at least one zero partition value is required to convert {table_name}"
            )));
        }
        Ok(Self {
            connection,
            table_name: table_name.to_string(),
            parent_table_name: parent_table_name.to_string(),
            partitioning_column: partitioning_column.to_string(),
            zero_partition_values: values.into_iter().collect(),
            locking_order: Vec::new(),
            lock_retries: WithLockRetries::new(DEFAULT_TIMING_CONFIGURATION.to_vec()),
        })
    }

    /// Tables locked, in this order, before the table is attached
    pub fn with_locking_order(mut self, tables: Vec<String>) -> Self {
        self.locking_order = tables;
        self
    }

    pub fn with_lock_retries(mut self, lock_retries: WithLockRetries) -> Self {
        self.lock_retries = lock_retries;
        self
    }

    pub async fn prepare_for_partitioning(&self) -> Result<()> {
        self.assert_existing_constraints_partitionable().await?;
        self.add_partitioning_check_constraint().await
    }

    pub async fn revert_preparation_for_partitioning(&self) -> Result<()> {
        let name = self
            .partitioning_constraint(self.connection.as_ref(), false)
            .await?
            .map(|c| c.name)
            .unwrap_or_else(|| PARTITIONING_CONSTRAINT_NAME.to_string());
        self.connection
            .execute(&format!(
                "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
                quote_table_name(&self.table_name),
                quote_ident(&name)
            ))
            .await?;
        Ok(())
    }

    pub async fn partition(&self) -> Result<()> {
        self.assert_existing_constraints_partitionable().await?;
        let constraint = self
            .partitioning_constraint(self.connection.as_ref(), true)
            .await?
            .ok_or_else(|| PartitioningError::UnableToPartition {
                table: self.table_name.clone(),
                reason: format!(
                    "a valid check constraint must enforce {} before partitioning",
                    self.check_expression()
                ),
            })?;

        self.create_parent_table().await?;

        let conn = self.connection.as_ref();
        let constraint_name = constraint.name.as_str();
        self.lock_retries
            .clone()
            .raise_on_exhaustion(true)
            .run(|lock_timeout| async move {
                let tx = begin_with_lock_timeout(conn, lock_timeout).await?;
                if !self.locking_order.is_empty() {
                    let tables = self
                        .locking_order
                        .iter()
                        .map(|t| quote_table_name(t))
                        .collect::<Vec<_>>()
                        .join(", ");
                    tx.execute(&format!("LOCK TABLE {tables} IN ACCESS EXCLUSIVE MODE"))
                        .await?;
                }
                tx.execute(&format!(
                    "ALTER TABLE {} ATTACH PARTITION {} FOR VALUES IN ({})",
                    quote_table_name(&self.parent_table_name),
                    quote_table_name(&self.table_name),
                    self.value_list()
                ))
                .await?;
                self.move_sequences(&*tx, &self.table_name, &self.parent_table_name)
                    .await?;
                // Enforced by the partition bounds from now on
                tx.execute(&format!(
                    "ALTER TABLE {} DROP CONSTRAINT {}",
                    quote_table_name(&self.parent_table_name),
                    quote_ident(constraint_name)
                ))
                .await?;
                tx.commit().await?;
                Ok::<_, PartitioningError>(())
            })
            .await?;

        info!(
            table_name = %self.table_name,
            parent_table_name = %self.parent_table_name,
            "Converted table into a partition"
        );
        Ok(())
    }

    pub async fn revert_partitioning(&self) -> Result<()> {
        let conn = self.connection.as_ref();
        self.lock_retries
            .clone()
            .raise_on_exhaustion(true)
            .run(|lock_timeout| async move {
                let tx = begin_with_lock_timeout(conn, lock_timeout).await?;
                tx.execute(&format!(
                    "ALTER TABLE {} DETACH PARTITION {}",
                    quote_table_name(&self.parent_table_name),
                    quote_table_name(&self.table_name)
                ))
                .await?;
                self.move_sequences(&*tx, &self.parent_table_name, &self.table_name)
                    .await?;
                tx.execute(&format!(
                    "DROP TABLE {}",
                    quote_table_name(&self.parent_table_name)
                ))
                .await?;
                tx.commit().await?;
                Ok::<_, PartitioningError>(())
            })
            .await?;

        self.add_partitioning_check_constraint().await
    }

    /// Every primary key and unique constraint must include the
    /// partitioning column.
    async fn assert_existing_constraints_partitionable(&self) -> Result<()> {
        let violations: Vec<String> = self
            .connection
            .constraints(&self.table_name)
            .await?
            .into_iter()
            .filter(|c| matches!(c.kind, ConstraintKind::PrimaryKey | ConstraintKind::Unique))
            .filter(|c| !c.column_names.contains(&self.partitioning_column))
            .map(|c| format!("{} on ({})", c.name, c.column_names.join(", ")))
            .collect();

        if violations.is_empty() {
            return Ok(());
        }
        Err(PartitioningError::UnableToPartition {
            table: self.table_name.clone(),
            reason: format!(
                "all primary key and unique constraints must include {}; violations: {}",
                self.partitioning_column,
                violations.join("; ")
            ),
        })
    }

    /// Check constraint restricting the column to exactly the zero values.
    async fn partitioning_constraint<Q: Queryable + ?Sized>(
        &self,
        conn: &Q,
        require_valid: bool,
    ) -> Result<Option<PostgresConstraint>> {
        let expected: BTreeSet<i64> = self.zero_partition_values.iter().copied().collect();
        Ok(conn
            .constraints(&self.table_name)
            .await?
            .into_iter()
            .filter(|c| c.kind == ConstraintKind::Check && (c.valid || !require_valid))
            .filter(|c| c.column_names.contains(&self.partitioning_column))
            .find(|c| {
                let body = c.definition.replace(&self.partitioning_column, "");
                let values: BTreeSet<i64> = INTEGER
                    .find_iter(&body)
                    .filter_map(|m| m.as_str().parse().ok())
                    .collect();
                c.definition.contains(&self.partitioning_column) && values == expected
            }))
    }

    /// Added `NOT VALID` and validated separately, so existing rows are
    /// scanned without holding an `ACCESS EXCLUSIVE` lock.
    async fn add_partitioning_check_constraint(&self) -> Result<()> {
        let name = match self
            .partitioning_constraint(self.connection.as_ref(), false)
            .await?
        {
            Some(existing) if existing.valid => return Ok(()),
            Some(existing) => existing.name,
            None => {
                self.connection
                    .execute(&format!(
                        "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({}) NOT VALID",
                        quote_table_name(&self.table_name),
                        quote_ident(PARTITIONING_CONSTRAINT_NAME),
                        self.check_expression()
                    ))
                    .await?;
                PARTITIONING_CONSTRAINT_NAME.to_string()
            }
        };

        self.connection
            .execute(&format!(
                "ALTER TABLE {} VALIDATE CONSTRAINT {}",
                quote_table_name(&self.table_name),
                quote_ident(&name)
            ))
            .await?;
        Ok(())
    }

    /// The parent is new, so nothing can reference it yet and copying the
    /// foreign keys cannot deadlock.
    async fn create_parent_table(&self) -> Result<()> {
        self.connection
            .execute(&format!(
                "CREATE TABLE IF NOT EXISTS {} (LIKE {} INCLUDING ALL) PARTITION BY LIST ({})",
                quote_table_name(&self.parent_table_name),
                quote_table_name(&self.table_name),
                quote_ident(&self.partitioning_column)
            ))
            .await?;

        let existing = self
            .connection
            .foreign_keys_constrained_by(&self.parent_table_name)
            .await?;
        for foreign_key in self
            .connection
            .foreign_keys_constrained_by(&self.table_name)
            .await?
        {
            if existing.iter().any(|fk| fk.name == foreign_key.name) {
                continue;
            }
            self.connection
                .execute(&format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} {}",
                    quote_table_name(&self.parent_table_name),
                    quote_ident(&foreign_key.name),
                    foreign_key.definition
                ))
                .await?;
        }
        Ok(())
    }

    async fn move_sequences<Q: Queryable + ?Sized>(
        &self,
        conn: &Q,
        from_table: &str,
        to_table: &str,
    ) -> Result<()> {
        for sequence in conn.owned_sequences(from_table).await? {
            conn.execute(&format!(
                "ALTER SEQUENCE {} OWNED BY {}.{}",
                quote_table_name(&sequence.name),
                quote_table_name(to_table),
                quote_ident(&sequence.column_name)
            ))
            .await?;
        }
        Ok(())
    }

    fn value_list(&self) -> String {
        self.zero_partition_values
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn check_expression(&self) -> String {
        let column = quote_ident(&self.partitioning_column);
        match self.zero_partition_values.as_slice() {
            [value] => format!("{column} = {value}"),
            _ => format!("{column} IN ({})", self.value_list()),
        }
    }
}
