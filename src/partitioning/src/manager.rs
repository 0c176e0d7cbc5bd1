//! Reconciles the partitions of one table on one database with what its
//! strategy wants.
//!
//! A sync runs under the table's management lease:
//!
//! 1. repair drift through the strategy's `validate_and_fix`
//! 2. plan missing and extra partitions from a single catalog read
//! 3. create missing partitions under an `ACCESS EXCLUSIVE` lock
//! 4. detach extra partitions and record when they may be dropped
//! 5. analyze the parent table when its statistics are stale
//!
//! Failures are logged and swallowed so that a broken table never stalls the
//! others, except for [`PartitioningError::InvalidArgument`].

use std::sync::Arc;
use std::time::Duration;

use common::config::PartitioningConfig;
use common::database::{Connection, quote_ident, quote_table_name};
use common::lease::{LeaseService, creation_lease_key, management_lease_key};
use common::lock_retries::{WithLockRetries, begin_with_lock_timeout};
use common::time::TimeProvider;
use tracing::{debug, error, info, warn};

use crate::error::{PartitioningError, Result};
use crate::partition::Partition;
use crate::table::PartitionedTable;

/// Trigger function attached to partitions of tables written on another database
pub const WRITE_LOCK_FUNCTION: &str = "prevent_partition_write";
/// Trigger function recording deletes for loose foreign key cleanup
pub const LOOSE_FK_FUNCTION: &str = "insert_into_loose_foreign_keys_deleted_records";

/// Tunables shared by every manager of a process.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub lock_retries: WithLockRetries,
    pub retain_detached_for: Duration,
    pub management_lease_timeout: Duration,
    pub creation_lease_timeout: Duration,
    pub analyze_statement_timeout: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &PartitioningConfig) -> Self {
        Self {
            lock_retries: WithLockRetries::from_config(&config.lock_retries),
            retain_detached_for: config.retain_detached_for,
            management_lease_timeout: config.management_lease_timeout,
            creation_lease_timeout: config.creation_lease_timeout,
            analyze_statement_timeout: config.analyze_statement_timeout,
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&PartitioningConfig::default())
    }
}

/// What a sync pass ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The table is not partitioned on this database
    NotPartitioned,
    /// Another process holds the lease
    LeaseUnavailable,
    Synced {
        created: Vec<String>,
        detached: Vec<String>,
        analyzed: bool,
    },
    /// The pass failed and the error was logged
    Failed(String),
}

pub struct PartitionManager {
    table: Arc<PartitionedTable>,
    connection: Arc<dyn Connection>,
    leases: Arc<dyn LeaseService>,
    time_provider: Arc<dyn TimeProvider>,
    settings: ManagerSettings,
}

impl PartitionManager {
    pub fn new(
        table: Arc<PartitionedTable>,
        connection: Arc<dyn Connection>,
        leases: Arc<dyn LeaseService>,
        time_provider: Arc<dyn TimeProvider>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            table,
            connection,
            leases,
            time_provider,
            settings,
        }
    }

    pub fn table(&self) -> &PartitionedTable {
        &self.table
    }

    pub fn connection_name(&self) -> &str {
        self.connection.name()
    }

    /// Full reconciliation: create, detach and optionally analyze.
    pub async fn sync_partitions(&self, analyze: bool) -> Result<SyncOutcome> {
        self.guarded("sync partitions", analyze, true).await
    }

    /// Only create missing partitions, under the short creation lease.
    pub async fn create_partitions(&self) -> Result<SyncOutcome> {
        self.guarded("create partitions", false, false).await
    }

    async fn guarded(&self, action: &str, analyze: bool, manage: bool) -> Result<SyncOutcome> {
        match self.try_guarded(analyze, manage).await {
            Ok(outcome) => Ok(outcome),
            Err(e @ PartitioningError::InvalidArgument(_)) => {
                error!(
                    table_name = %self.table.name,
                    connection_name = %self.connection.name(),
                    error = %e,
                    "Failed to {action} because of an invalid argument"
                );
                Err(e)
            }
            Err(e) => {
                error!(
                    table_name = %self.table.name,
                    connection_name = %self.connection.name(),
                    error = %e,
                    "Failed to {action}"
                );
                Ok(SyncOutcome::Failed(e.to_string()))
            }
        }
    }

    async fn try_guarded(&self, analyze: bool, manage: bool) -> Result<SyncOutcome> {
        let (key, timeout) = if manage {
            (
                management_lease_key(&self.table.name),
                self.settings.management_lease_timeout,
            )
        } else {
            (
                creation_lease_key(&self.table.name),
                self.settings.creation_lease_timeout,
            )
        };

        let Some(lease) = self.leases.try_obtain(&key, timeout).await? else {
            info!(
                table_name = %self.table.name,
                connection_name = %self.connection.name(),
                lease_key = %key,
                "Could not obtain exclusive lease, another process is maintaining partitions"
            );
            return Ok(SyncOutcome::LeaseUnavailable);
        };

        let result = self.leased(analyze, manage).await;

        if let Err(e) = self.leases.cancel(&lease).await {
            warn!(
                table_name = %self.table.name,
                lease_key = %key,
                error = %e,
                "Failed to cancel exclusive lease"
            );
        }

        result
    }

    async fn leased(&self, analyze: bool, manage: bool) -> Result<SyncOutcome> {
        if !self.connection.is_partitioned(&self.table.name).await? {
            info!(
                table_name = %self.table.name,
                connection_name = %self.connection.name(),
                "Skipping syncing partitions: table is not partitioned"
            );
            return Ok(SyncOutcome::NotPartitioned);
        }

        if manage {
            self.reconcile(analyze).await
        } else {
            self.create_missing().await
        }
    }

    async fn reconcile(&self, analyze: bool) -> Result<SyncOutcome> {
        let strategy = &self.table.strategy;
        strategy
            .validate_and_fix(self.connection.as_ref(), &self.settings.lock_retries)
            .await?;

        let plan = strategy.plan(self.connection.as_ref()).await?;
        debug!(
            table_name = %self.table.name,
            connection_name = %self.connection.name(),
            current = plan.current.len(),
            missing = plan.missing.len(),
            extra = plan.extra.len(),
            "Planned partition changes"
        );

        if !plan.missing.is_empty() {
            self.create(&plan.missing).await?;
        }
        if !plan.extra.is_empty() {
            self.detach(&plan.extra).await?;
        }

        let analyzed = analyze && self.analyze().await?;

        Ok(SyncOutcome::Synced {
            created: names(&plan.missing),
            detached: names(&plan.extra),
            analyzed,
        })
    }

    async fn create_missing(&self) -> Result<SyncOutcome> {
        let missing = self
            .table
            .strategy
            .missing_partitions(self.connection.as_ref())
            .await?;
        if !missing.is_empty() {
            self.create(&missing).await?;
        }
        Ok(SyncOutcome::Synced {
            created: names(&missing),
            detached: Vec::new(),
            analyzed: false,
        })
    }

    fn ddl_retries(&self) -> WithLockRetries {
        self.settings.lock_retries.clone().raise_on_exhaustion(true)
    }

    async fn create(&self, partitions: &[Partition]) -> Result<()> {
        let conn = self.connection.as_ref();
        let lock_writes = self.should_lock_writes();

        self.ddl_retries()
            .run(|lock_timeout| async move {
                let tx = begin_with_lock_timeout(conn, lock_timeout).await?;
                tx.execute(&format!(
                    "LOCK TABLE {} IN ACCESS EXCLUSIVE MODE",
                    quote_table_name(&self.table.name)
                ))
                .await?;

                for partition in partitions {
                    tx.execute(&partition.to_create_ddl()).await?;
                    if lock_writes {
                        tx.execute(&write_lock_trigger_ddl(partition)).await?;
                    }
                    if self.table.track_deletes_with_loose_foreign_keys {
                        tx.execute(&loose_fk_trigger_ddl(partition)).await?;
                    }
                }

                self.table.strategy.after_adding_partitions(&*tx).await?;
                tx.commit().await?;
                Ok::<_, PartitioningError>(())
            })
            .await?;

        for partition in partitions {
            info!(
                table_name = %self.table.name,
                connection_name = %self.connection.name(),
                partition_name = %partition.name(),
                "Created partition"
            );
        }
        Ok(())
    }

    async fn detach(&self, partitions: &[Partition]) -> Result<()> {
        let conn = self.connection.as_ref();
        let drop_after = self.time_provider.now()
            + chrono::Duration::from_std(self.settings.retain_detached_for).map_err(|e| {
                PartitioningError::InvalidArgument(format!("retention out of range: {e}"))
            })?;

        self.ddl_retries()
            .run(|lock_timeout| async move {
                let tx = begin_with_lock_timeout(conn, lock_timeout).await?;
                for partition in partitions {
                    // Detaching takes a lock on every referencing table
                    let referencing = tx.foreign_keys_referencing(&self.table.name).await?;
                    if let Some(foreign_key) = referencing.into_iter().next() {
                        return Err(PartitioningError::UnsafeToDetach {
                            table: foreign_key.constrained_table,
                            partition: partition.name().to_string(),
                            foreign_key: foreign_key.name,
                        });
                    }

                    tx.execute(&partition.to_detach_ddl()).await?;
                    tx.insert_detached_partition(&partition.detached_record_name(), drop_after)
                        .await?;
                }
                tx.commit().await?;
                Ok(())
            })
            .await?;

        for partition in partitions {
            info!(
                table_name = %self.table.name,
                connection_name = %self.connection.name(),
                partition_name = %partition.name(),
                drop_after = %drop_after,
                "Detached partition"
            );
        }
        Ok(())
    }

    /// `ANALYZE` the parent when the strategy asks for it and the statistics
    /// of its first partition are older than the interval.
    async fn analyze(&self) -> Result<bool> {
        let Some(interval) = self.table.strategy.analyze_interval() else {
            return Ok(false);
        };

        // The parent has no statistics of its own
        let current = self
            .table
            .strategy
            .current_partitions(self.connection.as_ref())
            .await?;
        let Some(first) = current.first() else {
            return Ok(false);
        };

        let last_analyzed_at = self
            .connection
            .last_analyzed_at(&first.identifier())
            .await?;
        let now = self.time_provider.now();
        let interval = chrono::Duration::from_std(interval).map_err(|e| {
            PartitioningError::InvalidArgument(format!("analyze interval out of range: {e}"))
        })?;
        if last_analyzed_at.is_some_and(|at| at >= now - interval) {
            debug!(
                table_name = %self.table.name,
                connection_name = %self.connection.name(),
                "Skipping analyze: statistics are recent"
            );
            return Ok(false);
        }

        let tx = self.connection.begin().await?;
        tx.execute(&format!(
            "SET LOCAL statement_timeout TO '{}ms'",
            self.settings.analyze_statement_timeout.as_millis()
        ))
        .await?;
        tx.execute(&format!(
            "ANALYZE (SKIP_LOCKED) {}",
            quote_table_name(&self.table.name)
        ))
        .await?;
        tx.commit().await?;

        info!(
            table_name = %self.table.name,
            connection_name = %self.connection.name(),
            "Analyzed partitioned table"
        );
        Ok(true)
    }

    /// Writes go through the owning database only.
    fn should_lock_writes(&self) -> bool {
        self.table.lock_writes_on_other_databases && self.connection.name() != self.table.database
    }
}

fn names(partitions: &[Partition]) -> Vec<String> {
    partitions.iter().map(|p| p.name().to_string()).collect()
}

fn write_lock_trigger_ddl(partition: &Partition) -> String {
    format!(
        "CREATE TRIGGER {} BEFORE INSERT OR UPDATE OR DELETE OR TRUNCATE ON {} FOR EACH STATEMENT EXECUTE FUNCTION {WRITE_LOCK_FUNCTION}()",
        quote_ident(&format!("{}_write_lock", partition.name())),
        quote_table_name(&partition.identifier())
    )
}

fn loose_fk_trigger_ddl(partition: &Partition) -> String {
    format!(
        "CREATE TRIGGER {} AFTER DELETE ON {} REFERENCING OLD TABLE AS old_table FOR EACH STATEMENT EXECUTE FUNCTION {LOOSE_FK_FUNCTION}()",
        quote_ident(&format!("{}_loose_fk_trigger", partition.name())),
        quote_table_name(&partition.identifier())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use common::config::ConditionConfig;
    use common::lease::{Lease, LeaseError};
    use common::testing::{InMemoryDatabase, InMemoryLeaseService, MockProvider, fast_lock_retry_timing};

    use crate::strategy::{PartitionCondition, PartitioningStrategy, SlidingListStrategy};

    mockall::mock! {
        #[derive(Debug)]
        pub Leases {}

        #[async_trait]
        impl LeaseService for Leases {
            async fn try_obtain(&self, key: &str, timeout: Duration) -> std::result::Result<Option<Lease>, LeaseError>;
            async fn cancel(&self, lease: &Lease) -> std::result::Result<(), LeaseError>;
        }
    }

    fn clock() -> Arc<MockProvider> {
        Arc::new(MockProvider::new(
            Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap(),
        ))
    }

    fn settings() -> ManagerSettings {
        ManagerSettings {
            lock_retries: WithLockRetries::new(fast_lock_retry_timing(3)),
            ..ManagerSettings::default()
        }
    }

    fn sliding_table(time: Arc<MockProvider>, next: PartitionCondition) -> Arc<PartitionedTable> {
        let strategy = SlidingListStrategy::new(
            "events",
            "partition",
            next,
            PartitionCondition::Never,
            time,
        );
        Arc::new(PartitionedTable::new(
            "events",
            "main",
            PartitioningStrategy::SlidingList(strategy),
        ))
    }

    fn database(time: Arc<MockProvider>) -> Arc<InMemoryDatabase> {
        let db = InMemoryDatabase::with_time_provider("main", time);
        db.create_partitioned_table("events");
        Arc::new(db)
    }

    #[tokio::test]
    async fn test_lease_is_cancelled_after_a_failed_pass() {
        let time = clock();
        let db = database(time.clone());
        db.fail_statements_containing("CREATE TABLE");

        let mut leases = MockLeases::new();
        leases
            .expect_try_obtain()
            .withf(|key, timeout| {
                key == "database_partition_management_events" && *timeout == Duration::from_secs(3600)
            })
            .times(1)
            .returning(|key, _| {
                Ok(Some(Lease {
                    key: key.to_string(),
                    uuid: uuid::Uuid::nil(),
                }))
            });
        leases.expect_cancel().times(1).returning(|_| Ok(()));

        let manager = PartitionManager::new(
            sliding_table(time.clone(), PartitionCondition::Never),
            db.clone(),
            Arc::new(leases),
            time,
            settings(),
        );

        let outcome = manager.sync_partitions(false).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Failed(_)));
        assert!(db.partition_names("events").is_empty());
    }

    #[tokio::test]
    async fn test_create_partitions_uses_creation_lease() {
        let time = clock();
        let db = database(time.clone());

        let mut leases = MockLeases::new();
        leases
            .expect_try_obtain()
            .withf(|key, timeout| {
                key == "database_partition_creation_events" && *timeout == Duration::from_secs(60)
            })
            .times(1)
            .returning(|key, _| {
                Ok(Some(Lease {
                    key: key.to_string(),
                    uuid: uuid::Uuid::nil(),
                }))
            });
        leases.expect_cancel().times(1).returning(|_| Ok(()));

        let manager = PartitionManager::new(
            sliding_table(time.clone(), PartitionCondition::Never),
            db.clone(),
            Arc::new(leases),
            time,
            settings(),
        );

        let outcome = manager.create_partitions().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                created: vec!["events_1".to_string()],
                detached: vec![],
                analyzed: false,
            }
        );
        assert_eq!(db.defaults("events", "partition").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_create_runs_inside_one_locked_transaction() {
        let time = clock();
        let db = database(time.clone());
        let leases = Arc::new(InMemoryLeaseService::new(time.clone()));
        let manager = PartitionManager::new(
            sliding_table(time.clone(), PartitionCondition::Never),
            db.clone(),
            leases,
            time,
            settings(),
        );

        manager.sync_partitions(false).await.unwrap();

        let statements = db.statements();
        let lock = statements
            .iter()
            .position(|s| s.starts_with("LOCK TABLE \"events\""))
            .unwrap();
        let create = statements
            .iter()
            .position(|s| s.starts_with("CREATE TABLE IF NOT EXISTS"))
            .unwrap();
        let default = statements
            .iter()
            .position(|s| s.contains("SET DEFAULT 1"))
            .unwrap();
        assert!(statements[lock - 1].starts_with("SET LOCAL lock_timeout"));
        assert!(lock < create && create < default);
    }

    #[tokio::test]
    async fn test_triggers_on_other_databases() {
        let time = clock();
        let db = Arc::new(InMemoryDatabase::with_time_provider("ci", time.clone()));
        db.create_partitioned_table("events");

        let table = PartitionedTable::new(
            "events",
            "main",
            sliding_table(time.clone(), PartitionCondition::Never)
                .strategy
                .clone(),
        )
        .with_lock_writes_on_other_databases(true)
        .with_loose_foreign_key_tracking(true);

        let manager = PartitionManager::new(
            Arc::new(table),
            db.clone(),
            Arc::new(InMemoryLeaseService::new(time.clone())),
            time,
            settings(),
        );
        manager.sync_partitions(false).await.unwrap();

        assert_eq!(
            db.triggers("dynamic_partitions.events_1"),
            vec![
                "events_1_write_lock".to_string(),
                "events_1_loose_fk_trigger".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_no_write_lock_on_owning_database() {
        let time = clock();
        let db = database(time.clone());
        let table = PartitionedTable::new(
            "events",
            "main",
            sliding_table(time.clone(), PartitionCondition::Never)
                .strategy
                .clone(),
        )
        .with_lock_writes_on_other_databases(true);

        let manager = PartitionManager::new(
            Arc::new(table),
            db.clone(),
            Arc::new(InMemoryLeaseService::new(time.clone())),
            time,
            settings(),
        );
        manager.sync_partitions(false).await.unwrap();

        assert!(db.triggers("dynamic_partitions.events_1").is_empty());
    }

    #[tokio::test]
    async fn test_analyze_respects_interval() {
        let time = clock();
        let db = database(time.clone());
        db.attach_partition("events", "events_1", "FOR VALUES IN ('1')");
        db.set_column_default("events", "partition", "1");

        let strategy = PartitioningStrategy::from_config(
            "events",
            &common::config::StrategyConfig::SlidingList {
                partitioning_key: "partition".to_string(),
                next_partition_if: ConditionConfig::Never,
                detach_partition_if: ConditionConfig::Never,
                analyze_interval: Some(Duration::from_secs(3 * 86400)),
            },
            time.clone(),
        )
        .unwrap();
        let manager = PartitionManager::new(
            Arc::new(PartitionedTable::new("events", "main", strategy)),
            db.clone(),
            Arc::new(InMemoryLeaseService::new(time.clone())),
            time.clone(),
            settings(),
        );

        let first = manager.sync_partitions(true).await.unwrap();
        assert!(matches!(first, SyncOutcome::Synced { analyzed: true, .. }));
        assert_eq!(
            db.statements_containing("statement_timeout"),
            vec!["SET LOCAL statement_timeout TO '3600000ms'".to_string()]
        );

        time.inc(chrono::Duration::days(1));
        let second = manager.sync_partitions(true).await.unwrap();
        assert!(matches!(second, SyncOutcome::Synced { analyzed: false, .. }));

        time.inc(chrono::Duration::days(3));
        let third = manager.sync_partitions(true).await.unwrap();
        assert!(matches!(third, SyncOutcome::Synced { analyzed: true, .. }));
        assert_eq!(db.statements_containing("ANALYZE").len(), 2);
    }

    #[tokio::test]
    async fn test_not_partitioned_table_is_skipped() {
        let time = clock();
        let db = Arc::new(InMemoryDatabase::new("main"));
        db.create_table("events");

        // The catalog is only consulted while holding the lease
        let mut leases = MockLeases::new();
        leases.expect_try_obtain().times(1).returning(|key, _| {
            Ok(Some(Lease {
                key: key.to_string(),
                uuid: uuid::Uuid::nil(),
            }))
        });
        leases.expect_cancel().times(1).returning(|_| Ok(()));

        let manager = PartitionManager::new(
            sliding_table(time.clone(), PartitionCondition::Always),
            db.clone(),
            Arc::new(leases),
            time,
            settings(),
        );

        assert_eq!(
            manager.sync_partitions(true).await.unwrap(),
            SyncOutcome::NotPartitioned
        );
        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_lease_skips_catalog_check() {
        let time = clock();
        let db = Arc::new(InMemoryDatabase::new("main"));
        db.create_table("events");

        let mut leases = MockLeases::new();
        leases.expect_try_obtain().times(1).returning(|_, _| Ok(None));
        leases.expect_cancel().never();

        let manager = PartitionManager::new(
            sliding_table(time.clone(), PartitionCondition::Always),
            db,
            Arc::new(leases),
            time,
            settings(),
        );

        assert_eq!(
            manager.sync_partitions(true).await.unwrap(),
            SyncOutcome::LeaseUnavailable
        );
    }
}
