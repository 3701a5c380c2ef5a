//! s3stream Common - Shared types and utilities
//!
//! This crate provides the identifiers, record types, error taxonomy,
//! configuration and checksum helpers used across all s3stream components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Checksum, ChecksumCalculator};
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
