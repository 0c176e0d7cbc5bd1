//! Test configuration builder for creating test setups quickly.

use std::time::Duration;

use crate::config::{
    ConditionConfig, Configuration, DatabaseConfig, RetainFor, StrategyConfig, TableConfig,
};
use crate::lock_retries::LockRetryTiming;

/// Builder for creating test configurations.
///
/// Starts from the defaults with a single `main` database and a lock-retry
/// schedule short enough for tests.
///
/// # Example
///
/// ```rust,ignore
/// use common::testing::TestConfigBuilder;
///
/// let config = TestConfigBuilder::new()
///     .with_database("ci", "postgres://localhost/ci")
///     .with_monthly_table("audit_events", "created_at", Some(RetainFor::Months(12)))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: Configuration,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = Configuration::default();
        config.partitioning.lock_retries.timing = fast_lock_retry_timing(3);
        Self { config }
    }

    /// Add another database next to `main`.
    pub fn with_database(mut self, name: &str, dsn: &str) -> Self {
        self.config.databases.push(DatabaseConfig {
            name: name.to_string(),
            dsn: dsn.to_string(),
            ..DatabaseConfig::default()
        });
        self
    }

    pub fn with_table(mut self, table: TableConfig) -> Self {
        self.config.partitioning.tables.push(table);
        self
    }

    pub fn with_sliding_list_table(
        self,
        name: &str,
        partitioning_key: &str,
        next_partition_if: ConditionConfig,
        detach_partition_if: ConditionConfig,
    ) -> Self {
        self.with_table(table(
            name,
            StrategyConfig::SlidingList {
                partitioning_key: partitioning_key.to_string(),
                next_partition_if,
                detach_partition_if,
                analyze_interval: None,
            },
        ))
    }

    pub fn with_int_range_table(
        self,
        name: &str,
        partitioning_key: &str,
        partition_size: i64,
    ) -> Self {
        self.with_table(table(
            name,
            StrategyConfig::IntRange {
                partitioning_key: partitioning_key.to_string(),
                partition_size,
                analyze_interval: None,
            },
        ))
    }

    pub fn with_monthly_table(
        self,
        name: &str,
        partitioning_key: &str,
        retain_for: Option<RetainFor>,
    ) -> Self {
        self.with_table(table(
            name,
            StrategyConfig::Monthly {
                partitioning_key: partitioning_key.to_string(),
                retain_for,
                retain_non_empty_partitions: false,
                analyze_interval: None,
            },
        ))
    }

    pub fn with_lock_retry_timing(mut self, timing: Vec<LockRetryTiming>) -> Self {
        self.config.partitioning.lock_retries.timing = timing;
        self
    }

    pub fn without_lock_retries(mut self) -> Self {
        self.config.partitioning.lock_retries.enabled = false;
        self
    }

    pub fn with_retain_detached_for(mut self, retain_for: Duration) -> Self {
        self.config.partitioning.retain_detached_for = retain_for;
        self
    }

    pub fn build(self) -> Configuration {
        self.config
    }
}

/// `count` attempts of 10ms lock timeout and 1ms sleep
pub fn fast_lock_retry_timing(count: usize) -> Vec<LockRetryTiming> {
    (0..count)
        .map(|_| LockRetryTiming {
            lock_timeout: Duration::from_millis(10),
            sleep: Duration::from_millis(1),
        })
        .collect()
}

fn table(name: &str, strategy: StrategyConfig) -> TableConfig {
    TableConfig {
        name: name.to_string(),
        database: "main".to_string(),
        lock_writes_on_other_databases: true,
        track_deletes_with_loose_foreign_keys: false,
        strategy,
    }
}
