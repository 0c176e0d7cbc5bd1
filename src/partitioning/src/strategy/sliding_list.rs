use std::sync::Arc;
use std::time::Duration;

use common::database::{Connection, Queryable, TxOutcome, quote_ident, quote_table_name};
use common::lock_retries::{WithLockRetries, begin_with_lock_timeout};
use common::time::TimeProvider;
use once_cell::sync::Lazy;
use regex::Regex;

use super::condition::PartitionCondition;
use crate::error::{PartitioningError, Result};
use crate::partition::SingleNumericListPartition;

static DEFAULT_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(*'?(\d+)'?").expect("valid regex"));

/// Parse a numeric column default as reported by `information_schema`,
/// e.g. `5` or `'100'::bigint`.
pub(crate) fn parse_default_value(raw: &str) -> Option<i64> {
    DEFAULT_VALUE
        .captures(raw.trim())
        .and_then(|caps| caps[1].parse().ok())
}

pub(crate) async fn list_partitions<Q: Queryable + ?Sized>(
    conn: &Q,
    table_name: &str,
) -> Result<Vec<SingleNumericListPartition>> {
    let mut partitions = Vec::new();
    for partition in conn.partitions(table_name).await? {
        partitions.push(SingleNumericListPartition::from_definition(
            table_name,
            &partition.name,
            &partition.condition,
        )?
        .in_schema(&partition.schema));
    }
    partitions.sort();
    Ok(partitions)
}

/// New rows go to the partition named by the column default. A new partition
/// is added when `next_partition_if` holds for the active one; the oldest
/// partitions are detached while `detach_partition_if` holds.
#[derive(Debug, Clone)]
pub struct SlidingListStrategy {
    table_name: String,
    partitioning_key: String,
    next_partition_if: PartitionCondition,
    detach_partition_if: PartitionCondition,
    analyze_interval: Option<Duration>,
    time_provider: Arc<dyn TimeProvider>,
}

impl SlidingListStrategy {
    pub fn new(
        table_name: &str,
        partitioning_key: &str,
        next_partition_if: PartitionCondition,
        detach_partition_if: PartitionCondition,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            table_name: table_name.to_string(),
            partitioning_key: partitioning_key.to_string(),
            next_partition_if,
            detach_partition_if,
            analyze_interval: None,
            time_provider,
        }
    }

    pub fn with_analyze_interval(mut self, interval: Option<Duration>) -> Self {
        self.analyze_interval = interval;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn partitioning_key(&self) -> &str {
        &self.partitioning_key
    }

    pub fn analyze_interval(&self) -> Option<Duration> {
        self.analyze_interval
    }

    pub fn initial_partition(&self) -> SingleNumericListPartition {
        SingleNumericListPartition::new(&self.table_name, 1)
    }

    pub fn next_partition(&self, active: &SingleNumericListPartition) -> SingleNumericListPartition {
        SingleNumericListPartition::new(&self.table_name, active.value + 1)
    }

    pub async fn current_partitions<Q: Queryable + ?Sized>(
        &self,
        conn: &Q,
    ) -> Result<Vec<SingleNumericListPartition>> {
        list_partitions(conn, &self.table_name).await
    }

    pub(crate) async fn missing_partitions<Q: Queryable + ?Sized>(
        &self,
        conn: &Q,
        current: &[SingleNumericListPartition],
    ) -> Result<Vec<SingleNumericListPartition>> {
        let Some(active) = current.last() else {
            return Ok(vec![self.initial_partition()]);
        };

        if self
            .next_partition_if
            .evaluate(conn, active, self.time_provider.now())
            .await?
        {
            Ok(vec![self.next_partition(active)])
        } else {
            Ok(Vec::new())
        }
    }

    pub(crate) async fn extra_partitions<Q: Queryable + ?Sized>(
        &self,
        conn: &Q,
        current: &[SingleNumericListPartition],
    ) -> Result<Vec<SingleNumericListPartition>> {
        // The active partition is never detached
        let Some((_, candidates)) = current.split_last() else {
            return Ok(Vec::new());
        };

        let now = self.time_provider.now();
        let mut extra = Vec::new();
        for partition in candidates {
            if !self.detach_partition_if.evaluate(conn, partition, now).await? {
                break;
            }
            extra.push(partition.clone());
        }
        if extra.is_empty() {
            return Ok(extra);
        }

        if let Some(default_value) = self.current_default_value(conn).await? {
            if extra.iter().any(|p| p.value == default_value) {
                tracing::error!(
                    table_name = %self.table_name,
                    partition_number = default_value,
                    "Inconsistent partition detected: partition is used as the default value and will not be detached"
                );
                extra.retain(|p| p.value != default_value);
            }
        }

        Ok(extra)
    }

    /// Point the column default at the active partition.
    pub(crate) async fn after_adding_partitions<Q: Queryable + ?Sized>(&self, conn: &Q) -> Result<()> {
        let current = self.current_partitions(conn).await?;
        if let Some(active) = current.last() {
            conn.execute(&self.set_default_sql(active.value)).await?;
        }
        Ok(())
    }

    /// Repair a column default that does not point at the active partition.
    /// Returns `None` when there was nothing to repair.
    pub(crate) async fn validate_and_fix<C: Connection + ?Sized>(
        &self,
        conn: &C,
        lock_retries: &WithLockRetries,
    ) -> Result<Option<TxOutcome>> {
        let current = self.current_partitions(conn).await?;
        let Some(active) = current.last() else {
            return Ok(None);
        };
        if self.current_default_value(conn).await? == Some(active.value) {
            return Ok(None);
        }

        let outcome = lock_retries
            .run(|lock_timeout| async move {
                let tx = begin_with_lock_timeout(conn, lock_timeout).await?;
                tx.execute(&format!(
                    "LOCK TABLE {} IN ACCESS EXCLUSIVE MODE",
                    quote_table_name(&self.table_name)
                ))
                .await?;

                let expected = self.current_partitions(&*tx).await?.last().map(|p| p.value);
                let old = self.current_default_value(&*tx).await?;

                let Some(expected) = expected.filter(|expected| old != Some(*expected)) else {
                    tracing::warn!(
                        table_name = %self.table_name,
                        partitioning_key = %self.partitioning_key,
                        "Table partitions or partition key default value have been changed by another process"
                    );
                    tx.rollback().await?;
                    return Ok(TxOutcome::AbortedBenignly);
                };

                tx.execute(&self.set_default_sql(expected)).await?;
                tx.commit().await?;
                tracing::warn!(
                    table_name = %self.table_name,
                    partitioning_key = %self.partitioning_key,
                    old_value = ?old,
                    new_value = expected,
                    "Fixed default value of sliding list partitioning key"
                );
                Ok::<_, PartitioningError>(TxOutcome::Committed)
            })
            .await?;

        Ok(Some(outcome))
    }

    async fn current_default_value<Q: Queryable + ?Sized>(&self, conn: &Q) -> Result<Option<i64>> {
        let raw = conn
            .column_default(&self.table_name, &self.partitioning_key)
            .await?;
        Ok(raw.as_deref().and_then(parse_default_value))
    }

    fn set_default_sql(&self, value: i64) -> String {
        format!(
            "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {value}",
            quote_table_name(&self.table_name),
            quote_ident(&self.partitioning_key)
        )
    }
}
