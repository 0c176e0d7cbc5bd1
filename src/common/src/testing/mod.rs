//! Test utilities for partkeeper.
//!
//! This module provides an in-memory database and lease service that stand in
//! for PostgreSQL, plus a configuration builder.
//!
//! # Feature Flag
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! common = { path = "../common", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use common::testing::{InMemoryDatabase, TestConfigBuilder};
//!
//! let db = InMemoryDatabase::new("main");
//! db.create_partitioned_table("audit_events");
//! let config = TestConfigBuilder::new()
//!     .with_monthly_table("audit_events", "created_at", None)
//!     .build();
//! ```

mod config_builder;
mod database;
mod lease;

pub use config_builder::{TestConfigBuilder, fast_lock_retry_timing};
pub use database::{InMemoryDatabase, InMemoryTransaction};
pub use lease::InMemoryLeaseService;
pub use crate::time::MockProvider;
