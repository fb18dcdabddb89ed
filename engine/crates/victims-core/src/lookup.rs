//! Lookup trait - the read-only interface enforcement layers query

use crate::error::Result;
use crate::record::AdvisoryRecord;

/// Metadata source holding Maven `pom.properties` values
pub const POM_PROPERTIES: &str = "pom.properties";

/// Metadata source holding jar manifest main attributes
pub const MANIFEST: &str = "MANIFEST.MF";

/// Interface for fingerprint lookups (implemented in victims-db)
///
/// Absence is reported as `Ok(None)` or an empty vector, never as an error.
pub trait FingerprintLookup: Send + Sync {
    /// Find the advisory owning a single file digest, under any algorithm
    fn find_by_file_hash(&self, digest: &str) -> Result<Option<AdvisoryRecord>>;

    /// Find the advisory whose whole-artifact digest matches
    fn find_by_artifact_hash(&self, combined: &str) -> Result<Option<AdvisoryRecord>>;

    /// Find the advisory for an exact vendor/name/version triple
    fn find_by_coordinates(
        &self,
        vendor: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<AdvisoryRecord>>;

    /// Find advisories whose file digests overlap the candidate set by the
    /// count implied by `tolerance`
    fn find_by_partial_hash_set(
        &self,
        candidates: &[String],
        tolerance: f64,
    ) -> Result<Vec<AdvisoryRecord>>;

    /// Find the advisory whose metadata from `source` carries every listed
    /// property with the given value
    fn find_by_metadata(
        &self,
        source: &str,
        properties: &[(&str, &str)],
    ) -> Result<Option<AdvisoryRecord>>;

    /// Lookup by Maven `pom.properties` coordinates
    fn find_by_pom_properties(
        &self,
        group: &str,
        artifact: &str,
        version: &str,
    ) -> Result<Option<AdvisoryRecord>> {
        self.find_by_metadata(
            POM_PROPERTIES,
            &[("groupId", group), ("artifactId", artifact), ("version", version)],
        )
    }

    /// Lookup by manifest `Implementation-*` attributes
    fn find_by_implementation(
        &self,
        vendor: &str,
        title: &str,
        version: &str,
    ) -> Result<Option<AdvisoryRecord>> {
        self.find_by_metadata(
            MANIFEST,
            &[
                ("Implementation-Vendor", vendor),
                ("Implementation-Title", title),
                ("Implementation-Version", version),
            ],
        )
    }
}
