//! # Tempo Core
//!
//! Shared error type and TOML configuration used by every Tempo crate.

pub mod config;
pub mod error;

pub use config::TempoConfig;
pub use error::{Result, TempoError};
