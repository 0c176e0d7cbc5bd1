use std::sync::Arc;

use common::config::{Configuration, TableConfig};
use common::time::TimeProvider;

use crate::error::Result;
use crate::strategy::PartitioningStrategy;

/// A partitioned table under management together with its strategy.
#[derive(Debug, Clone)]
pub struct PartitionedTable {
    pub name: String,
    /// Database owning the table's writes
    pub database: String,
    pub lock_writes_on_other_databases: bool,
    pub track_deletes_with_loose_foreign_keys: bool,
    pub strategy: PartitioningStrategy,
}

impl PartitionedTable {
    pub fn new(name: &str, database: &str, strategy: PartitioningStrategy) -> Self {
        Self {
            name: name.to_string(),
            database: database.to_string(),
            lock_writes_on_other_databases: false,
            track_deletes_with_loose_foreign_keys: false,
            strategy,
        }
    }

    pub fn from_config(config: &TableConfig, time_provider: Arc<dyn TimeProvider>) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            database: config.database.clone(),
            lock_writes_on_other_databases: config.lock_writes_on_other_databases,
            track_deletes_with_loose_foreign_keys: config.track_deletes_with_loose_foreign_keys,
            strategy: PartitioningStrategy::from_config(&config.name, &config.strategy, time_provider)?,
        })
    }

    pub fn with_lock_writes_on_other_databases(mut self, lock_writes: bool) -> Self {
        self.lock_writes_on_other_databases = lock_writes;
        self
    }

    pub fn with_loose_foreign_key_tracking(mut self, track: bool) -> Self {
        self.track_deletes_with_loose_foreign_keys = track;
        self
    }
}

/// Every table the process maintains. Built once at startup and read-only
/// afterwards.
#[derive(Debug, Clone, Default)]
pub struct PartitionedTableRegistry {
    tables: Vec<Arc<PartitionedTable>>,
}

impl PartitionedTableRegistry {
    pub fn new(tables: Vec<PartitionedTable>) -> Self {
        Self {
            tables: tables.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn from_config(config: &Configuration, time_provider: Arc<dyn TimeProvider>) -> Result<Self> {
        let tables = config
            .partitioning
            .tables
            .iter()
            .map(|table| PartitionedTable::from_config(table, time_provider.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(tables))
    }

    pub fn tables(&self) -> &[Arc<PartitionedTable>] {
        &self.tables
    }

    pub fn get(&self, name: &str) -> Option<&Arc<PartitionedTable>> {
        self.tables.iter().find(|table| table.name == name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
