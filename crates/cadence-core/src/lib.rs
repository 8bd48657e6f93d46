//! `cadence-core`: configuration and the shared error type for the Cadence
//! workspace.

pub mod config;
pub mod error;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
