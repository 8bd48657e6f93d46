//! `cadence-store`: SQLite persistence for jobs and their logs.
//!
//! [`SqliteStore`] implements both repository traits from
//! `cadence-scheduler` over a single mutex-guarded connection, so a job's
//! `is_running` write is visible to the very next due-job query.

pub mod db;
pub mod error;
pub mod store;

pub use error::{Result, StoreError};
pub use store::SqliteStore;
