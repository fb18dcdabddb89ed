//! Victims DB - local fingerprint database and remote synchronization
//!
//! This crate provides:
//! - SQLite-based local victims database
//! - Exact and tolerance-based fingerprint matching
//! - Incremental sync client for the remote victims service

pub mod database;
pub mod feed;
pub mod sync;

pub use database::VictimsDb;
pub use sync::{SyncStats, VictimsSync};
