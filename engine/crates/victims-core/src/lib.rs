//! Victims Core - Advisory record model, lookup traits, and error handling
//!
//! This crate provides the core abstractions used throughout the victims database:
//! - `AdvisoryRecord`: One known-vulnerable artifact signature and its digests
//! - `FingerprintLookup`: The read-only query interface over stored records
//! - `Error`: The shared error type

pub mod error;
pub mod lookup;
pub mod record;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use lookup::{FingerprintLookup, MANIFEST, POM_PROPERTIES};
pub use record::{
    format_timestamp, parse_timestamp, AdvisoryRecord, DuplicatePolicy, HashRecord, Status,
    TIMESTAMP_FORMAT,
};
