use std::time::Duration;

use common::database::Queryable;

use crate::error::{PartitioningError, Result};
use crate::partition::IntRangePartition;

/// Number of partitions kept ready ahead of the highest assigned id
pub const HEADROOM: usize = 6;
/// Lower bound of the first partition when no sequence says otherwise
pub const MIN_ID: i64 = 1;

/// Fixed-width integer ranges, grown ahead of demand.
#[derive(Debug, Clone)]
pub struct IntRangeStrategy {
    table_name: String,
    partitioning_key: String,
    partition_size: i64,
    analyze_interval: Option<Duration>,
}

impl IntRangeStrategy {
    pub fn new(table_name: &str, partitioning_key: &str, partition_size: i64) -> Result<Self> {
        if partition_size <= 0 {
            return Err(PartitioningError::InvalidArgument(format!(
                "partition size of {table_name} must be positive, got {partition_size}"
            )));
        }
        Ok(Self {
            table_name: table_name.to_string(),
            partitioning_key: partitioning_key.to_string(),
            partition_size,
            analyze_interval: None,
        })
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

    pub fn partition_size(&self) -> i64 {
        self.partition_size
    }

    pub fn analyze_interval(&self) -> Option<Duration> {
        self.analyze_interval
    }

    pub async fn current_partitions<Q: Queryable + ?Sized>(
        &self,
        conn: &Q,
    ) -> Result<Vec<IntRangePartition>> {
        let mut partitions = Vec::new();
        for partition in conn.partitions(&self.table_name).await? {
            partitions.push(IntRangePartition::from_definition(
                &self.table_name,
                &partition.name,
                &partition.condition,
            )?
            .in_schema(&partition.schema));
        }
        partitions.sort();
        Ok(partitions)
    }

    pub(crate) async fn missing_partitions<Q: Queryable + ?Sized>(
        &self,
        conn: &Q,
        current: &[IntRangePartition],
    ) -> Result<Vec<IntRangePartition>> {
        let desired = self.desired_partitions(conn, current).await?;
        Ok(desired
            .into_iter()
            .filter(|partition| !current.contains(partition))
            .collect())
    }

    /// Current partitions plus enough new ones to have [`HEADROOM`] empty
    /// partitions at the tail.
    async fn desired_partitions<Q: Queryable + ?Sized>(
        &self,
        conn: &Q,
        current: &[IntRangePartition],
    ) -> Result<Vec<IntRangePartition>> {
        let Some(last) = current.last() else {
            let min_id = self.min_id(conn).await?;
            return self.partitions_from(min_id, HEADROOM);
        };

        let mut empty_tail = 0;
        for partition in current.iter().rev().take(HEADROOM) {
            if conn
                .holds_data(&partition.identifier())
                .await?
            {
                break;
            }
            empty_tail += 1;
        }

        let mut desired = current.to_vec();
        desired.extend(self.partitions_from(last.to, HEADROOM - empty_tail)?);
        Ok(desired)
    }

    /// Looked up on every pass so a reset sequence is picked up.
    async fn min_id<Q: Queryable + ?Sized>(&self, conn: &Q) -> Result<i64> {
        let min_value = conn
            .sequence_min_value(&self.table_name, &self.partitioning_key)
            .await?;
        Ok(min_value.unwrap_or(MIN_ID).max(MIN_ID))
    }

    fn partitions_from(&self, start: i64, count: usize) -> Result<Vec<IntRangePartition>> {
        let mut partitions = Vec::with_capacity(count);
        let mut from = start;
        for _ in 0..count {
            let to = from.checked_add(self.partition_size).ok_or_else(|| {
                PartitioningError::InvalidArgument(format!(
                    "partition range of {} overflows after {from}",
                    self.table_name
                ))
            })?;
            partitions.push(IntRangePartition::new(&self.table_name, from, to)?);
            from = to;
        }
        Ok(partitions)
    }
}
