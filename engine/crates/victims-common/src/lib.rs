//! Victims Common - Shared utilities: logging and configuration
//!
//! This crate provides common functionality used across all victims crates.

pub mod config;
pub mod logging;

pub use config::{Config, ConfigBuilder, Mode, UpdateMode};
pub use logging::{init_logging, LogFormat};
