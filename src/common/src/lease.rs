//! Exclusive, time-bounded leases shared by every process.
//!
//! A lease is keyed by name and held by a random uuid. Acquisition is
//! try-once: when another holder owns an unexpired lease the caller gets `None`
//! and is expected to skip its work. An expired lease may be taken over.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::database::DatabaseError;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease backend error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<sqlx::Error> for LeaseError {
    fn from(err: sqlx::Error) -> Self {
        LeaseError::Database(err.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub uuid: Uuid,
}

#[async_trait]
pub trait LeaseService: std::fmt::Debug + Send + Sync {
    /// Take the lease `key` for `timeout` unless someone else holds it.
    async fn try_obtain(&self, key: &str, timeout: Duration) -> Result<Option<Lease>, LeaseError>;

    /// Release `lease` if it is still ours.
    async fn cancel(&self, lease: &Lease) -> Result<(), LeaseError>;
}

/// Lease key guarding a full sync (create, detach, analyze) of one table.
pub fn management_lease_key(table: &str) -> String {
    format!("database_partition_management_{table}")
}

/// Lease key guarding partition creation of one table.
pub fn creation_lease_key(table: &str) -> String {
    format!("database_partition_creation_{table}")
}

/// Leases stored in the `exclusive_leases` table of the main database.
#[derive(Debug, Clone)]
pub struct PgLeaseService {
    pool: PgPool,
}

impl PgLeaseService {
    pub async fn new(pool: PgPool) -> Result<Self, LeaseError> {
        let service = Self { pool };
        service.init().await?;
        Ok(service)
    }

    async fn init(&self) -> Result<(), LeaseError> {
        let stmt = r#"
        CREATE TABLE IF NOT EXISTS exclusive_leases (
            key TEXT PRIMARY KEY,
            uuid UUID NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )"#;
        sqlx::query(stmt).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl LeaseService for PgLeaseService {
    async fn try_obtain(&self, key: &str, timeout: Duration) -> Result<Option<Lease>, LeaseError> {
        let uuid = Uuid::new_v4();
        let stmt = r#"
        INSERT INTO exclusive_leases (key, uuid, expires_at)
        VALUES ($1, $2, NOW() + make_interval(secs => $3))
        ON CONFLICT (key) DO UPDATE
            SET uuid = EXCLUDED.uuid, expires_at = EXCLUDED.expires_at
            WHERE exclusive_leases.expires_at < NOW()
        RETURNING uuid
        "#;
        let obtained = sqlx::query_scalar::<_, Uuid>(stmt)
            .bind(key)
            .bind(uuid)
            .bind(timeout.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;

        match obtained {
            Some(uuid) => {
                tracing::debug!(lease_key = %key, %uuid, "Obtained exclusive lease");
                Ok(Some(Lease {
                    key: key.to_string(),
                    uuid,
                }))
            }
            None => {
                tracing::debug!(lease_key = %key, "Exclusive lease is held elsewhere");
                Ok(None)
            }
        }
    }

    async fn cancel(&self, lease: &Lease) -> Result<(), LeaseError> {
        sqlx::query("DELETE FROM exclusive_leases WHERE key = $1 AND uuid = $2")
            .bind(&lease.key)
            .bind(lease.uuid)
            .execute(&self.pool)
            .await?;
        tracing::debug!(lease_key = %lease.key, uuid = %lease.uuid, "Cancelled exclusive lease");
        Ok(())
    }
}
