//! PostgreSQL table partition maintenance.
//!
//! Strategies decide which partitions a table should have, the
//! [`PartitionManager`] reconciles a live database with that decision, the
//! [`DetachedPartitionDropper`] removes detached partitions once their
//! retention passed and [`ConvertTable`] turns a plain table into a
//! partitioned one.

pub mod converter;
pub mod dropper;
pub mod error;
pub mod manager;
pub mod monitoring;
pub mod multi_database;
pub mod partition;
pub mod strategy;
pub mod table;

pub use converter::{ConvertTable, PARTITIONING_CONSTRAINT_NAME};
pub use dropper::{DetachedPartitionDropper, DropSummary};
pub use error::{PartitioningError, Result};
pub use manager::{ManagerSettings, PartitionManager, SyncOutcome};
pub use monitoring::{PartitionCounts, PartitionMonitoring};
pub use multi_database::{MultiDatabasePartitioning, TableSync};
pub use partition::Partition;
pub use strategy::{PartitionCondition, PartitionPlan, PartitioningStrategy};
pub use table::{PartitionedTable, PartitionedTableRegistry};
