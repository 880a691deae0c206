//! OSDEMU Common - Shared types and utilities
//!
//! This crate provides the identifiers, protocol constants, attribute list
//! wire codec, configuration and error definitions used by the catalog and
//! the command engine.

pub mod config;
pub mod error;
pub mod page;
pub mod types;
pub mod wire;

pub use config::TargetConfig;
pub use error::{Error, Result};
pub use types::*;
