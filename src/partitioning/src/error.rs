use common::database::DatabaseError;
use common::lease::LeaseError;
use common::lock_retries::RetryableError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PartitioningError {
    #[error("unable to parse partition definition {definition:?} of {partition}")]
    Parse {
        partition: String,
        definition: String,
    },

    #[error("partition definition {definition:?} of {partition} is not supported yet")]
    UnsupportedDefinition {
        partition: String,
        definition: String,
    },

    /// A programming or configuration error. Never swallowed by the manager.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(
        "cannot detach {partition}: detaching would block while checking foreign key {foreign_key} on {table}"
    )]
    UnsafeToDetach {
        table: String,
        partition: String,
        foreign_key: String,
    },

    #[error("unable to partition {table}: {reason}")]
    UnableToPartition { table: String, reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Lease(#[from] LeaseError),
}

impl RetryableError for PartitioningError {
    fn is_lock_timeout(&self) -> bool {
        matches!(self, PartitioningError::Database(e) if e.is_lock_timeout())
    }
}

pub type Result<T, E = PartitioningError> = std::result::Result<T, E>;
