//! Drops partitions whose detach retention has passed.

use std::sync::Arc;

use common::database::{
    Connection, DetachedPartition, PostgresForeignKey, Queryable, qualify_partition_name,
    quote_ident, quote_table_name,
};
use common::lock_retries::{WithLockRetries, begin_with_lock_timeout};
use common::time::TimeProvider;
use tracing::{error, info};

use crate::error::{PartitioningError, Result};

/// Tally of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropSummary {
    pub dropped: Vec<String>,
    /// Records removed because their partition was attached again
    pub discarded: Vec<String>,
    /// Records another process removed while this sweep ran
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropOutcome {
    Dropped,
    Discarded,
    AlreadyHandled,
}

pub struct DetachedPartitionDropper {
    connection: Arc<dyn Connection>,
    time_provider: Arc<dyn TimeProvider>,
    lock_retries: WithLockRetries,
}

impl DetachedPartitionDropper {
    pub fn new(
        connection: Arc<dyn Connection>,
        time_provider: Arc<dyn TimeProvider>,
        lock_retries: WithLockRetries,
    ) -> Self {
        Self {
            connection,
            time_provider,
            lock_retries,
        }
    }

    /// Drop every detached partition that is due. A failing partition is
    /// logged and does not stop the sweep.
    pub async fn perform(&self) -> Result<DropSummary> {
        let due = self
            .connection
            .detached_partitions_ready_to_drop(self.time_provider.now())
            .await?;

        let mut summary = DropSummary::default();
        for detached in due {
            match self.drop_detached_partition(&detached).await {
                Ok(DropOutcome::Dropped) => summary.dropped.push(detached.table_name),
                Ok(DropOutcome::Discarded) => summary.discarded.push(detached.table_name),
                Ok(DropOutcome::AlreadyHandled) => summary.skipped.push(detached.table_name),
                Err(e) => {
                    error!(
                        connection_name = %self.connection.name(),
                        partition_name = %detached.table_name,
                        error = %e,
                        "Failed to drop previously detached partition"
                    );
                    summary.failed.push(detached.table_name);
                }
            }
        }
        Ok(summary)
    }

    async fn drop_detached_partition(&self, detached: &DetachedPartition) -> Result<DropOutcome> {
        let identifier = qualify_partition_name(&detached.table_name);

        if self.connection.partition_parent(&identifier).await?.is_some() {
            return self.discard_attached(detached, &identifier).await;
        }

        let foreign_keys = self
            .connection
            .foreign_keys_constrained_by(&identifier)
            .await?;
        for foreign_key in &foreign_keys {
            self.drop_foreign_key(detached, &identifier, foreign_key)
                .await?;
        }

        self.drop_partition(detached, &identifier).await
    }

    async fn discard_attached(
        &self,
        detached: &DetachedPartition,
        identifier: &str,
    ) -> Result<DropOutcome> {
        let tx = self.connection.begin().await?;
        if tx.lock_detached_partition(detached.id).await?.is_none() {
            tx.rollback().await?;
            return Ok(DropOutcome::AlreadyHandled);
        }
        let parent = tx.partition_parent(identifier).await?;
        error!(
            connection_name = %self.connection.name(),
            partition_name = %detached.table_name,
            parent = ?parent,
            "Attempt to drop attached database partition"
        );
        tx.delete_detached_partition(detached.id).await?;
        tx.commit().await?;
        Ok(DropOutcome::Discarded)
    }

    /// One transaction per foreign key keeps each lock short.
    async fn drop_foreign_key(
        &self,
        detached: &DetachedPartition,
        identifier: &str,
        foreign_key: &PostgresForeignKey,
    ) -> Result<()> {
        let conn = self.connection.as_ref();
        self.lock_retries
            .run(|lock_timeout| async move {
                let tx = begin_with_lock_timeout(conn, lock_timeout).await?;
                // Another process may have dropped the partition or the key
                if tx.lock_detached_partition(detached.id).await?.is_none()
                    || !still_has_foreign_key(&*tx, identifier, &foreign_key.name).await?
                {
                    tx.rollback().await?;
                    return Ok(());
                }

                tx.execute(&format!(
                    "ALTER TABLE {} DROP CONSTRAINT {}",
                    quote_table_name(identifier),
                    quote_ident(&foreign_key.name)
                ))
                .await?;
                tx.commit().await?;
                Ok::<_, PartitioningError>(())
            })
            .await
    }

    async fn drop_partition(
        &self,
        detached: &DetachedPartition,
        identifier: &str,
    ) -> Result<DropOutcome> {
        let tx = self.connection.begin().await?;
        if tx.lock_detached_partition(detached.id).await?.is_none() {
            tx.rollback().await?;
            return Ok(DropOutcome::AlreadyHandled);
        }
        // Re-check under the record lock
        if tx.partition_parent(identifier).await?.is_some() {
            tx.rollback().await?;
            return self.discard_attached(detached, identifier).await;
        }

        tx.execute(&format!(
            "DROP TABLE IF EXISTS {}",
            quote_table_name(identifier)
        ))
        .await?;
        tx.delete_detached_partition(detached.id).await?;
        tx.commit().await?;

        info!(
            connection_name = %self.connection.name(),
            partition_name = %detached.table_name,
            "Dropped previously detached partition"
        );
        Ok(DropOutcome::Dropped)
    }
}

async fn still_has_foreign_key<Q: Queryable + ?Sized>(
    conn: &Q,
    identifier: &str,
    name: &str,
) -> Result<bool> {
    Ok(conn
        .foreign_keys_constrained_by(identifier)
        .await?
        .iter()
        .any(|fk| fk.name == name))
}
