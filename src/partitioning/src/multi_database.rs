//! Drive every registered table across every configured database.

use std::future::Future;
use std::sync::Arc;

use common::database::Connection;
use common::lease::LeaseService;
use common::time::TimeProvider;
use tracing::{error, info};

use crate::dropper::{DetachedPartitionDropper, DropSummary};
use crate::error::{PartitioningError, Result};
use crate::manager::{ManagerSettings, PartitionManager, SyncOutcome};
use crate::monitoring::{PartitionCounts, PartitionMonitoring};
use crate::table::{PartitionedTable, PartitionedTableRegistry};

/// Result of one table on one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSync {
    pub table_name: String,
    pub connection_name: String,
    pub outcome: SyncOutcome,
}

pub struct MultiDatabasePartitioning {
    registry: PartitionedTableRegistry,
    /// The first connection is the main database
    connections: Vec<Arc<dyn Connection>>,
    leases: Arc<dyn LeaseService>,
    time_provider: Arc<dyn TimeProvider>,
    settings: ManagerSettings,
}

impl MultiDatabasePartitioning {
    pub fn new(
        registry: PartitionedTableRegistry,
        connections: Vec<Arc<dyn Connection>>,
        leases: Arc<dyn LeaseService>,
        time_provider: Arc<dyn TimeProvider>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            registry,
            connections,
            leases,
            time_provider,
            settings,
        }
    }

    pub fn registry(&self) -> &PartitionedTableRegistry {
        &self.registry
    }

    /// Sync every table, on its owning database first and then on every
    /// other database where it exists. `only_on` restricts the pass to one
    /// database.
    pub async fn sync_partitions(&self, analyze: bool, only_on: Option<&str>) -> Result<Vec<TableSync>> {
        self.each_table_connection(only_on, |manager| async move {
            manager.sync_partitions(analyze).await
        })
        .await
    }

    pub async fn create_partitions(&self, only_on: Option<&str>) -> Result<Vec<TableSync>> {
        self.each_table_connection(only_on, |manager| async move {
            manager.create_partitions().await
        })
        .await
    }

    pub async fn drop_detached_partitions(&self) -> Vec<(String, DropSummary)> {
        let mut summaries = Vec::with_capacity(self.connections.len());
        for connection in &self.connections {
            let dropper = DetachedPartitionDropper::new(
                connection.clone(),
                self.time_provider.clone(),
                self.settings.lock_retries.clone(),
            );
            match dropper.perform().await {
                Ok(summary) => summaries.push((connection.name().to_string(), summary)),
                Err(e) => error!(
                    connection_name = %connection.name(),
                    error = %e,
                    "Failed to drop detached partitions"
                ),
            }
        }
        summaries
    }

    /// Report partition gauges of every table, read from its owning database.
    pub async fn report_metrics(&self, monitoring: &PartitionMonitoring) -> Vec<(String, PartitionCounts)> {
        let mut reported = Vec::with_capacity(self.registry.len());
        for table in self.registry.tables() {
            let Some(connection) = self.connection(&table.database) else {
                continue;
            };
            match monitoring.report_metrics(connection.as_ref(), table).await {
                Ok(counts) => reported.push((table.name.clone(), counts)),
                Err(e) => error!(
                    table_name = %table.name,
                    connection_name = %connection.name(),
                    error = %e,
                    "Failed to report partition metrics"
                ),
            }
        }
        reported
    }

    fn connection(&self, name: &str) -> Option<&Arc<dyn Connection>> {
        self.connections.iter().find(|c| c.name() == name)
    }

    /// The owning database first, then the remaining ones in configuration order
    fn connections_for(&self, table: &PartitionedTable) -> Vec<Arc<dyn Connection>> {
        let mut ordered: Vec<_> = self
            .connections
            .iter()
            .filter(|c| c.name() == table.database)
            .cloned()
            .collect();
        ordered.extend(
            self.connections
                .iter()
                .filter(|c| c.name() != table.database)
                .cloned(),
        );
        ordered
    }

    async fn each_table_connection<F, Fut>(&self, only_on: Option<&str>, mut run: F) -> Result<Vec<TableSync>>
    where
        F: FnMut(PartitionManager) -> Fut,
        Fut: Future<Output = Result<SyncOutcome>>,
    {
        if let Some(name) = only_on {
            if self.connection(name).is_none() {
                return Err(PartitioningError::InvalidArgument(format!(
                    "unknown database {name}"
                )));
            }
        }

        let mut results = Vec::new();
        for table in self.registry.tables() {
            for connection in self.connections_for(table) {
                if only_on.is_some_and(|name| name != connection.name()) {
                    continue;
                }
                if connection.name() != table.database {
                    match connection.table_exists(&table.name).await {
                        Ok(true) => {}
                        Ok(false) => {
                            info!(
                                table_name = %table.name,
                                connection_name = %connection.name(),
                                "Skipping table missing on this database"
                            );
                            continue;
                        }
                        Err(e) => {
                            error!(
                                table_name = %table.name,
                                connection_name = %connection.name(),
                                error = %e,
                                "Failed to look up table"
                            );
                            continue;
                        }
                    }
                }

                let connection_name = connection.name().to_string();
                let manager = PartitionManager::new(
                    table.clone(),
                    connection,
                    self.leases.clone(),
                    self.time_provider.clone(),
                    self.settings.clone(),
                );
                let outcome = run(manager).await?;
                results.push(TableSync {
                    table_name: table.name.clone(),
                    connection_name,
                    outcome,
                });
            }
        }
        Ok(results)
    }
}
