//! Quarry Common - Shared types and utilities
//!
//! This crate provides the identifiers, configuration structures and the
//! error taxonomy shared by every Quarry component.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, LockFailure, Result};
pub use types::*;
