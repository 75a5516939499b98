//! Datascope Common Types and Utilities
//!
//! Shared role types, configuration, and error handling for the row-level
//! data-access layer.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod types;

pub use config::DataScopeConfig;
pub use error::{Error, Result};
pub use types::{ApiError, RoleType};
