//! Partitioning strategies decide which partitions a table should have.
//!
//! Strategies are policy objects: they hold no connection and are handed the
//! one to inspect on every call, so a single registry can be synced against
//! several databases.

mod ci_sliding_list;
mod condition;
mod int_range;
mod monthly;
mod sliding_list;

pub use ci_sliding_list::CiSlidingListStrategy;
pub use condition::{PartitionCondition, PartitionPredicate};
pub use int_range::{HEADROOM, IntRangeStrategy, MIN_ID};
pub use monthly::{HEADROOM_MONTHS, MonthlyStrategy};
pub use sliding_list::SlidingListStrategy;

use std::sync::Arc;
use std::time::Duration;

use common::config::StrategyConfig;
use common::database::{Connection, Queryable, TxOutcome};
use common::lock_retries::WithLockRetries;
use common::time::TimeProvider;

use crate::error::Result;
use crate::partition::Partition;

/// Snapshot of one reconciliation pass: what exists, what should be
/// created and what should be detached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionPlan {
    pub current: Vec<Partition>,
    pub missing: Vec<Partition>,
    pub extra: Vec<Partition>,
}

impl PartitionPlan {
    pub fn is_noop(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum PartitioningStrategy {
    SlidingList(SlidingListStrategy),
    CiSlidingList(CiSlidingListStrategy),
    IntRange(IntRangeStrategy),
    Monthly(MonthlyStrategy),
}

fn wrap<P: Into<Partition>>(partitions: Vec<P>) -> Vec<Partition> {
    partitions.into_iter().map(Into::into).collect()
}

impl PartitioningStrategy {
    pub fn from_config(
        table_name: &str,
        config: &StrategyConfig,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Self> {
        Ok(match config {
            StrategyConfig::SlidingList {
                partitioning_key,
                next_partition_if,
                detach_partition_if,
                analyze_interval,
            } => PartitioningStrategy::SlidingList(
                SlidingListStrategy::new(
                    table_name,
                    partitioning_key,
                    PartitionCondition::from_config(next_partition_if)?,
                    PartitionCondition::from_config(detach_partition_if)?,
                    time_provider,
                )
                .with_analyze_interval(*analyze_interval),
            ),
            StrategyConfig::CiSlidingList {
                partitioning_key,
                next_partition_if,
                analyze_interval,
            } => PartitioningStrategy::CiSlidingList(
                CiSlidingListStrategy::new(
                    table_name,
                    partitioning_key,
                    PartitionCondition::from_config(next_partition_if)?,
                    time_provider,
                )
                .with_analyze_interval(*analyze_interval),
            ),
            StrategyConfig::IntRange {
                partitioning_key,
                partition_size,
                analyze_interval,
            } => PartitioningStrategy::IntRange(
                IntRangeStrategy::new(table_name, partitioning_key, *partition_size)?
                    .with_analyze_interval(*analyze_interval),
            ),
            StrategyConfig::Monthly {
                partitioning_key,
                retain_for,
                retain_non_empty_partitions,
                analyze_interval,
            } => PartitioningStrategy::Monthly(
                MonthlyStrategy::new(table_name, partitioning_key, *retain_for, time_provider)
                    .retain_non_empty_partitions(*retain_non_empty_partitions)
                    .with_analyze_interval(*analyze_interval),
            ),
        })
    }

    pub fn table_name(&self) -> &str {
        match self {
            PartitioningStrategy::SlidingList(s) => s.table_name(),
            PartitioningStrategy::CiSlidingList(s) => s.table_name(),
            PartitioningStrategy::IntRange(s) => s.table_name(),
            PartitioningStrategy::Monthly(s) => s.table_name(),
        }
    }

    pub fn partitioning_key(&self) -> &str {
        match self {
            PartitioningStrategy::SlidingList(s) => s.partitioning_key(),
            PartitioningStrategy::CiSlidingList(s) => s.partitioning_key(),
            PartitioningStrategy::IntRange(s) => s.partitioning_key(),
            PartitioningStrategy::Monthly(s) => s.partitioning_key(),
        }
    }

    pub fn analyze_interval(&self) -> Option<Duration> {
        match self {
            PartitioningStrategy::SlidingList(s) => s.analyze_interval(),
            PartitioningStrategy::CiSlidingList(s) => s.analyze_interval(),
            PartitioningStrategy::IntRange(s) => s.analyze_interval(),
            PartitioningStrategy::Monthly(s) => s.analyze_interval(),
        }
    }

    pub async fn current_partitions<Q: Queryable + ?Sized>(&self, conn: &Q) -> Result<Vec<Partition>> {
        Ok(match self {
            PartitioningStrategy::SlidingList(s) => wrap(s.current_partitions(conn).await?),
            PartitioningStrategy::CiSlidingList(s) => wrap(s.current_partitions(conn).await?),
            PartitioningStrategy::IntRange(s) => wrap(s.current_partitions(conn).await?),
            PartitioningStrategy::Monthly(s) => wrap(s.current_partitions(conn).await?),
        })
    }

    pub async fn missing_partitions<Q: Queryable + ?Sized>(&self, conn: &Q) -> Result<Vec<Partition>> {
        Ok(self.plan(conn).await?.missing)
    }

    pub async fn extra_partitions<Q: Queryable + ?Sized>(&self, conn: &Q) -> Result<Vec<Partition>> {
        Ok(self.plan(conn).await?.extra)
    }

    /// Read the catalog once and derive both the missing and the extra
    /// partitions from that single view.
    pub async fn plan<Q: Queryable + ?Sized>(&self, conn: &Q) -> Result<PartitionPlan> {
        match self {
            PartitioningStrategy::SlidingList(s) => {
                let current = s.current_partitions(conn).await?;
                let missing = s.missing_partitions(conn, &current).await?;
                let extra = s.extra_partitions(conn, &current).await?;
                Ok(PartitionPlan {
                    current: wrap(current),
                    missing: wrap(missing),
                    extra: wrap(extra),
                })
            }
            PartitioningStrategy::CiSlidingList(s) => {
                let current = s.current_partitions(conn).await?;
                let missing = s.missing_partitions(conn, &current).await?;
                Ok(PartitionPlan {
                    current: wrap(current),
                    missing: wrap(missing),
                    extra: Vec::new(),
                })
            }
            PartitioningStrategy::IntRange(s) => {
                let current = s.current_partitions(conn).await?;
                let missing = s.missing_partitions(conn, &current).await?;
                Ok(PartitionPlan {
                    current: wrap(current),
                    missing: wrap(missing),
                    extra: Vec::new(),
                })
            }
            PartitioningStrategy::Monthly(s) => {
                let current = s.current_partitions(conn).await?;
                let missing = s.missing_partitions(&current)?;
                let extra = s.extra_partitions(conn, &current).await?;
                Ok(PartitionPlan {
                    current: wrap(current),
                    missing: wrap(missing),
                    extra: wrap(extra),
                })
            }
        }
    }

    /// Runs inside the creation transaction once every missing partition
    /// has been created.
    pub async fn after_adding_partitions<Q: Queryable + ?Sized>(&self, conn: &Q) -> Result<()> {
        match self {
            PartitioningStrategy::SlidingList(s) => s.after_adding_partitions(conn).await,
            _ => Ok(()),
        }
    }

    pub async fn validate_and_fix<C: Connection + ?Sized>(
        &self,
        conn: &C,
        lock_retries: &WithLockRetries,
    ) -> Result<Option<TxOutcome>> {
        match self {
            PartitioningStrategy::SlidingList(s) => s.validate_and_fix(conn, lock_retries).await,
            _ => Ok(None),
        }
    }
}
