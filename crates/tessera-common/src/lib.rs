//! Tessera Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, checksum algorithms, configuration
//! structures, and core identity types used across all Tessera target
//! components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod mem;
pub mod types;

pub use checksum::{Checksum, ChecksumType, CksumCalc};
pub use config::Config;
pub use error::{Error, Result};
pub use mem::BufferPool;
pub use types::*;
