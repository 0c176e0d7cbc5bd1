//! Predicates deciding when a sliding list table moves on to a new partition
//! and when old partitions may be detached.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::config::ConditionConfig;
use common::database::{Queryable, ValueBound};

use crate::error::{PartitioningError, Result};
use crate::partition::SingleNumericListPartition;

pub type PartitionPredicate = Arc<dyn Fn(&SingleNumericListPartition) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum PartitionCondition {
    Never,
    Always,
    /// The partition holds no rows
    Empty,
    OldestRowOlderThan {
        column: String,
        age: chrono::Duration,
    },
    NewestRowOlderThan {
        column: String,
        age: chrono::Duration,
    },
    Custom(PartitionPredicate),
}

impl fmt::Debug for PartitionCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionCondition::Never => write!(f, "Never"),
            PartitionCondition::Always => write!(f, "Always"),
            PartitionCondition::Empty => write!(f, "Empty"),
            PartitionCondition::OldestRowOlderThan { column, age } => f
                .debug_struct("OldestRowOlderThan")
                .field("column", column)
                .field("age", age)
                .finish(),
            PartitionCondition::NewestRowOlderThan { column, age } => f
                .debug_struct("NewestRowOlderThan")
                .field("column", column)
                .field("age", age)
                .finish(),
            PartitionCondition::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl PartitionCondition {
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&SingleNumericListPartition) -> bool + Send + Sync + 'static,
    {
        PartitionCondition::Custom(Arc::new(predicate))
    }

    pub fn from_config(config: &ConditionConfig) -> Result<Self> {
        let age = |age: &std::time::Duration| {
            chrono::Duration::from_std(*age).map_err(|e| {
                PartitioningError::InvalidArgument(format!("condition age out of range: {e}"))
            })
        };
        Ok(match config {
            ConditionConfig::Never => PartitionCondition::Never,
            ConditionConfig::Always => PartitionCondition::Always,
            ConditionConfig::Empty => PartitionCondition::Empty,
            ConditionConfig::OldestRowOlderThan { column, age: a } => {
                PartitionCondition::OldestRowOlderThan {
                    column: column.clone(),
                    age: age(a)?,
                }
            }
            ConditionConfig::NewestRowOlderThan { column, age: a } => {
                PartitionCondition::NewestRowOlderThan {
                    column: column.clone(),
                    age: age(a)?,
                }
            }
        })
    }

    pub async fn evaluate<Q: Queryable + ?Sized>(
        &self,
        conn: &Q,
        partition: &SingleNumericListPartition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let identifier = partition.identifier();
        match self {
            PartitionCondition::Never => Ok(false),
            PartitionCondition::Always => Ok(true),
            PartitionCondition::Empty => Ok(!conn.holds_data(&identifier).await?),
            PartitionCondition::OldestRowOlderThan { column, age } => {
                let oldest = conn
                    .timestamp_bound(&identifier, column, ValueBound::Min)
                    .await?;
                Ok(oldest.is_some_and(|oldest| oldest < now - *age))
            }
            PartitionCondition::NewestRowOlderThan { column, age } => {
                let newest = conn
                    .timestamp_bound(&identifier, column, ValueBound::Max)
                    .await?;
                Ok(newest.is_some_and(|newest| newest < now - *age))
            }
            PartitionCondition::Custom(predicate) => Ok(predicate(partition)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::testing::InMemoryDatabase;

    #[tokio::test]
    async fn test_row_age_conditions() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        let db = InMemoryDatabase::new("main");
        db.create_partitioned_table("events");
        db.attach_partition("events", "events_1", "FOR VALUES IN ('1')");
        db.insert_timestamps(
            "dynamic_partitions.events_1",
            "created_at",
            &[now - chrono::Duration::days(3), now - chrono::Duration::hours(1)],
        );
        let partition = SingleNumericListPartition::new("events", 1);

        let oldest = PartitionCondition::from_config(&ConditionConfig::OldestRowOlderThan {
            column: "created_at".to_string(),
            age: std::time::Duration::from_secs(86400),
        })
        .unwrap();
        assert!(oldest.evaluate(&db, &partition, now).await.unwrap());

        let newest = PartitionCondition::from_config(&ConditionConfig::NewestRowOlderThan {
            column: "created_at".to_string(),
            age: std::time::Duration::from_secs(86400),
        })
        .unwrap();
        assert!(!newest.evaluate(&db, &partition, now).await.unwrap());

        assert!(!PartitionCondition::Empty.evaluate(&db, &partition, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_partition_has_no_oldest_row() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        let db = InMemoryDatabase::new("main");
        db.create_partitioned_table("events");
        db.attach_partition("events", "events_1", "FOR VALUES IN ('1')");
        let partition = SingleNumericListPartition::new("events", 1);

        let oldest = PartitionCondition::OldestRowOlderThan {
            column: "created_at".to_string(),
            age: chrono::Duration::days(1),
        };
        assert!(!oldest.evaluate(&db, &partition, now).await.unwrap());
        assert!(PartitionCondition::Empty.evaluate(&db, &partition, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_custom_condition() {
        let db = InMemoryDatabase::new("main");
        let condition = PartitionCondition::custom(|p| p.value < 3);

        let now = Utc::now();
        assert!(
            condition
                .evaluate(&db, &SingleNumericListPartition::new("events", 2), now)
                .await
                .unwrap()
        );
        assert!(
            !condition
                .evaluate(&db, &SingleNumericListPartition::new("events", 3), now)
                .await
                .unwrap()
        );
    }
}
