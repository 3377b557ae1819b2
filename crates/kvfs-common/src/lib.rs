//! kvfs Common - Shared types and utilities
//!
//! This crate provides the identifier types, file mode helpers, error
//! definitions and configuration used across all kvfs components.

pub mod config;
pub mod error;
pub mod types;

pub use config::FsConfig;
pub use error::{Error, Result};
pub use types::*;
