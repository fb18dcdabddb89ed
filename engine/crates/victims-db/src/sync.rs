//! Victims sync - pull additions and removals from the remote victims service
//!
//! The service exposes two feeds keyed by the newest `created` timestamp the
//! local store holds: `<base>/update/<since>/` and `<base>/remove/<since>/`.
//! Additions are applied in full before removals are fetched.

use crate::database::VictimsDb;
use crate::feed;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};
use victims_core::{format_timestamp, AdvisoryRecord, DuplicatePolicy, Error, Result};

const UPDATE_FEED: &str = "update";
const REMOVE_FEED: &str = "remove";

/// Remote victims service synchronizer
pub struct VictimsSync {
    client: Client,
    base_url: String,
    duplicates: DuplicatePolicy,
}

impl VictimsSync {
    /// Create a synchronizer against the service at `base_url` (ending in `service/v1`)
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    /// Create a synchronizer with an explicit request timeout
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("victims-db/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            duplicates: DuplicatePolicy::default(),
        })
    }

    /// Choose how update entries for already-stored coordinates are applied
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicates = policy;
        self
    }

    /// Bring `db` up to date with the remote service.
    ///
    /// Update entries that fail validation are skipped and counted. Any other
    /// failure aborts the run with the feed and watermark attached; entries
    /// applied before the failure stay in the store.
    pub async fn synchronize(&self, db: &VictimsDb) -> Result<SyncStats> {
        let since = db.latest_watermark()?.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let watermark = format_timestamp(&since);

        info!("Database last updated: {}", watermark);
        info!("Performing synchronization against {}", self.base_url);

        let mut stats = SyncStats {
            since,
            ..SyncStats::default()
        };

        let body = self
            .fetch(UPDATE_FEED, &watermark)
            .await
            .map_err(|e| Error::sync_failed(UPDATE_FEED, &watermark, e))?;
        let updates =
            feed::decode_updates(&body).map_err(|e| Error::sync_failed(UPDATE_FEED, &watermark, e))?;

        for record in &updates {
            if let Err(e) = record.validate() {
                warn!("Skipping update entry {}: {}", record.coordinates(), e);
                stats.skipped += 1;
                continue;
            }
            self.apply_update(db, record, &mut stats)
                .map_err(|e| Error::sync_failed(UPDATE_FEED, &watermark, e))?;
        }
        info!("Items added: {}", stats.added);
        if stats.skipped > 0 {
            warn!("Invalid update entries skipped: {}", stats.skipped);
        }

        let body = self
            .fetch(REMOVE_FEED, &watermark)
            .await
            .map_err(|e| Error::sync_failed(REMOVE_FEED, &watermark, e))?;
        let removals =
            feed::decode_removals(&body).map_err(|e| Error::sync_failed(REMOVE_FEED, &watermark, e))?;

        for id in removals {
            let removed = db
                .remove(id)
                .map_err(|e| Error::sync_failed(REMOVE_FEED, &watermark, e))?;
            if removed {
                stats.removed += 1;
            } else {
                debug!("Advisory {} already absent", id);
            }
        }
        info!("Items removed: {}", stats.removed);

        stats.latest = db.latest_watermark()?;
        if let Some(latest) = stats.latest {
            info!("Database last updated: {}", format_timestamp(&latest));
        }

        Ok(stats)
    }

    fn apply_update(&self, db: &VictimsDb, record: &AdvisoryRecord, stats: &mut SyncStats) -> Result<()> {
        if self.duplicates == DuplicatePolicy::Replace {
            let replaced = db.remove_by_coordinates(&record.vendor, &record.name, &record.version)?;
            if replaced > 0 {
                warn!(
                    "Replacing {} stored advisories for {}",
                    replaced,
                    record.coordinates()
                );
                stats.replaced += replaced as u32;
            }
        }
        db.insert(record)?;
        stats.added += 1;
        Ok(())
    }

    /// URL of a feed for the given watermark
    pub fn feed_url(&self, feed: &str, watermark: &str) -> String {
        format!("{}/{}/{}/", self.base_url, feed, watermark)
    }

    async fn fetch(&self, feed: &str, watermark: &str) -> Result<Vec<u8>> {
        let url = self.feed_url(feed, watermark);
        debug!("Fetching {} feed: {}", feed, url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to fetch {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "{} returned status {}",
                url,
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("Failed to read {}: {}", url, e)))?;

        Ok(body.to_vec())
    }
}

/// Sync statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStats {
    /// Watermark the feeds were requested with
    pub since: DateTime<Utc>,
    /// Update entries inserted
    pub added: u32,
    /// Invalid update entries left out
    pub skipped: u32,
    /// Stored records deleted by the replace policy
    pub replaced: u32,
    /// Removal entries that deleted a stored record
    pub removed: u32,
    /// Watermark after the run
    pub latest: Option<DateTime<Utc>>,
}
