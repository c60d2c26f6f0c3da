//! HVFS Common - Shared types and utilities
//!
//! This crate provides identifiers, wire status codes, the error type,
//! hashing helpers and configuration used across all HVFS components.

pub mod config;
pub mod error;
pub mod hash;
pub mod status;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use status::Status;
pub use types::*;
