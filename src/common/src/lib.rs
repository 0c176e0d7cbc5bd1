pub mod cli;
pub mod config;
pub mod database;
pub mod lease;
pub mod lock_retries;
pub mod time;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use database::{Connection, DatabaseError, Queryable, Transaction};
pub use time::{SystemProvider, TimeProvider};
