//! Advisory record model - one known-vulnerable artifact signature

use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Timestamp layout used on the wire, in feed URLs and in the store.
/// Always interpreted as UTC.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Format a timestamp as `yyyy-MM-ddTHH:mm:ss`
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a `yyyy-MM-ddTHH:mm:ss` timestamp as UTC
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| Error::Parse(format!("Invalid timestamp '{}': {}", s, e)))
}

/// Serde adapter for the fixed timestamp layout
pub mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_timestamp(&s).map_err(serde::de::Error::custom)
    }
}

/// Lifecycle state of an advisory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// Submitted upstream, not yet reviewed
    #[default]
    #[serde(alias = "submitted")]
    Submitted,
    /// Reviewed and published
    #[serde(alias = "released")]
    Released,
    /// Withdrawn
    #[serde(alias = "retired")]
    Retired,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Submitted => "SUBMITTED",
            Status::Released => "RELEASED",
            Status::Retired => "RETIRED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SUBMITTED" => Ok(Status::Submitted),
            "RELEASED" => Ok(Status::Released),
            "RETIRED" => Ok(Status::Retired),
            other => Err(Error::Parse(format!("Unknown advisory status: {}", other))),
        }
    }
}

/// Digests of one artifact under a single algorithm
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRecord {
    /// Digest over the whole artifact
    pub combined: String,

    /// Intra-artifact file path -> digest of that file
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl HashRecord {
    pub fn new(combined: impl Into<String>) -> Self {
        Self {
            combined: combined.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, digest: impl Into<String>) -> Self {
        self.files.insert(path.into(), digest.into());
        self
    }
}

/// A known-vulnerable artifact signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryRecord {
    /// Store-assigned identifier, `None` until the record is inserted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    /// CVE identifiers covered by this advisory
    #[serde(default)]
    pub cves: Vec<String>,

    #[serde(default)]
    pub vendor: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub version: String,

    /// When the advisory was recorded upstream; the sync watermark
    #[serde(with = "timestamp", alias = "date")]
    pub created: DateTime<Utc>,

    #[serde(default)]
    pub submitter: String,

    #[serde(default)]
    pub format: String,

    #[serde(default)]
    pub status: Status,

    /// Algorithm name -> digests under that algorithm
    #[serde(default)]
    pub hashes: BTreeMap<String, HashRecord>,

    /// Metadata source -> (property -> value)
    #[serde(default)]
    pub meta: BTreeMap<String, BTreeMap<String, String>>,
}

impl AdvisoryRecord {
    /// Create an unsaved record for the given coordinates
    pub fn new(
        vendor: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            cves: Vec::new(),
            vendor: vendor.into(),
            name: name.into(),
            version: version.into(),
            created,
            submitter: String::new(),
            format: String::new(),
            status: Status::default(),
            hashes: BTreeMap::new(),
            meta: BTreeMap::new(),
        }
    }

    pub fn with_cve(mut self, cve: impl Into<String>) -> Self {
        self.cves.push(cve.into());
        self
    }

    pub fn with_submitter(mut self, submitter: impl Into<String>) -> Self {
        self.submitter = submitter.into();
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_hashes(mut self, algorithm: impl Into<String>, hashes: HashRecord) -> Self {
        self.hashes.insert(algorithm.into(), hashes);
        self
    }

    pub fn with_meta(
        mut self,
        source: impl Into<String>,
        property: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.meta
            .entry(source.into())
            .or_default()
            .insert(property.into(), value.into());
        self
    }

    /// Check the structural invariants a record must satisfy before storage
    pub fn validate(&self) -> Result<()> {
        for (algorithm, record) in &self.hashes {
            if algorithm.is_empty() {
                return Err(Error::InvalidRecord(String::from(
                    "hash algorithm name is empty",
                )));
            }
            if record.files.is_empty() {
                return Err(Error::InvalidRecord(format!(
                    "algorithm {} for {}:{}:{} has no file digests",
                    algorithm, self.vendor, self.name, self.version
                )));
            }
        }
        Ok(())
    }

    /// Every per-file digest across all algorithms
    pub fn file_digests(&self) -> impl Iterator<Item = &str> {
        self.hashes
            .values()
            .flat_map(|h| h.files.values().map(String::as_str))
    }

    /// `vendor:name:version`
    pub fn coordinates(&self) -> String {
        format!("{}:{}:{}", self.vendor, self.name, self.version)
    }
}

/// How synchronization treats an update entry whose coordinates already exist locally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Insert every entry as a new record, even if its coordinates are already stored
    #[default]
    Append,
    /// Remove stored records with the same vendor/name/version before inserting
    Replace,
}

impl std::str::FromStr for DuplicatePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "append" => Ok(DuplicatePolicy::Append),
            "replace" => Ok(DuplicatePolicy::Replace),
            other => Err(Error::InvalidConfig {
                key: String::from("sync.duplicates"),
                message: format!("unknown policy '{}', expected append or replace", other),
            }),
        }
    }
}
