use std::sync::Arc;
use std::time::Duration;

use common::database::Queryable;
use common::time::TimeProvider;

use super::condition::PartitionCondition;
use super::sliding_list::list_partitions;
use crate::error::Result;
use crate::partition::SingleNumericListPartition;

const INITIAL_PARTITION_VALUE: i64 = 100;
const TABLE_PREFIX: &str = "p_";

/// Sliding list variant for the CI tables: partitions start at `100`, are
/// named without the `p_` table prefix and are never detached or repaired.
#[derive(Debug, Clone)]
pub struct CiSlidingListStrategy {
    table_name: String,
    partitioning_key: String,
    next_partition_if: PartitionCondition,
    analyze_interval: Option<Duration>,
    time_provider: Arc<dyn TimeProvider>,
}

impl CiSlidingListStrategy {
    pub fn new(
        table_name: &str,
        partitioning_key: &str,
        next_partition_if: PartitionCondition,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            table_name: table_name.to_string(),
            partitioning_key: partitioning_key.to_string(),
            next_partition_if,
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
        self.partition_for(INITIAL_PARTITION_VALUE)
    }

    pub fn next_partition(&self, active: &SingleNumericListPartition) -> SingleNumericListPartition {
        self.partition_for(active.value + 1)
    }

    fn partition_for(&self, value: i64) -> SingleNumericListPartition {
        let base = self
            .table_name
            .strip_prefix(TABLE_PREFIX)
            .unwrap_or(&self.table_name);
        SingleNumericListPartition::with_name(&self.table_name, value, format!("{base}_{value}"))
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::time::SystemProvider;

    #[test]
    fn test_partition_names_drop_table_prefix() {
        let strategy = CiSlidingListStrategy::new(
            "p_ci_builds",
            "partition_id",
            PartitionCondition::Never,
            Arc::new(SystemProvider::new()),
        );

        let initial = strategy.initial_partition();
        assert_eq!(initial.value, 100);
        assert_eq!(initial.partition_name, "ci_builds_100");
        assert_eq!(initial.table, "p_ci_builds");

        let next = strategy.next_partition(&initial);
        assert_eq!(next.partition_name, "ci_builds_101");
    }
}
