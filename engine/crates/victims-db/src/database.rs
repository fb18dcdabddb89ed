//! SQLite store for victims fingerprints

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use victims_core::{
    format_timestamp, parse_timestamp, AdvisoryRecord, Error, FingerprintLookup, HashRecord,
    Result, Status,
};

/// Upper bound on digests bound into a single `IN (...)` clause.
/// Kept well below SQLite's host parameter limit.
const MAX_BOUND_DIGESTS: usize = 500;

const VICTIMS_TABLE: &str = "victims";
const FINGERPRINTS_TABLE: &str = "fingerprints";
const METADATA_TABLE: &str = "metadata";

const CREATE_VICTIMS_TABLE: &str = r#"
    CREATE TABLE victims (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cves TEXT NOT NULL,
        vendor TEXT NOT NULL,
        name TEXT NOT NULL,
        version TEXT NOT NULL,
        created TEXT NOT NULL,
        submitter TEXT NOT NULL,
        format TEXT NOT NULL,
        status TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_victims_coordinates ON victims(vendor, name, version);
    CREATE INDEX IF NOT EXISTS idx_victims_created ON victims(created);
"#;

const CREATE_FINGERPRINTS_TABLE: &str = r#"
    CREATE TABLE fingerprints (
        victims_id INTEGER NOT NULL,
        algorithm TEXT NOT NULL,
        combined TEXT NOT NULL,
        filename TEXT NOT NULL,
        hash TEXT NOT NULL,
        UNIQUE (victims_id, algorithm, filename),
        FOREIGN KEY (victims_id) REFERENCES victims(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_fingerprints_victim ON fingerprints(victims_id);
    CREATE INDEX IF NOT EXISTS idx_fingerprints_hash ON fingerprints(hash);
    CREATE INDEX IF NOT EXISTS idx_fingerprints_combined ON fingerprints(combined);
"#;

const CREATE_METADATA_TABLE: &str = r#"
    CREATE TABLE metadata (
        source TEXT NOT NULL,
        victims_id INTEGER NOT NULL,
        property TEXT NOT NULL,
        value TEXT NOT NULL,
        UNIQUE (victims_id, source, property),
        FOREIGN KEY (victims_id) REFERENCES victims(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_metadata_victim ON metadata(victims_id);
    CREATE INDEX IF NOT EXISTS idx_metadata_property ON metadata(source, property, value);
"#;

/// Creation order; dropping walks it in reverse so dependents go first
const SCHEMA: [(&str, &str); 3] = [
    (VICTIMS_TABLE, CREATE_VICTIMS_TABLE),
    (FINGERPRINTS_TABLE, CREATE_FINGERPRINTS_TABLE),
    (METADATA_TABLE, CREATE_METADATA_TABLE),
];

const SELECT_VICTIM: &str = r#"
    SELECT id, cves, vendor, name, version, created, submitter, format, status
    FROM victims WHERE id = ?1
"#;

/// Where the store keeps its data
#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// Victims fingerprint database backed by SQLite
///
/// The connection is opened on first use and reused for every later
/// operation. Each operation holds the handle for its whole duration, so
/// callers sharing one store are serialized.
pub struct VictimsDb {
    location: Location,
    conn: Mutex<Option<Connection>>,
}

impl VictimsDb {
    /// Open or create the database at the given path and make sure the schema exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Self::new(path);
        db.ensure_schema()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = Self {
            location: Location::Memory,
            conn: Mutex::new(None),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Create a handle for the given path without touching the file yet
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            location: Location::File(path.as_ref().to_path_buf()),
            conn: Mutex::new(None),
        }
    }

    fn connect(&self) -> Result<Connection> {
        let conn = match &self.location {
            Location::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        Error::Storage(format!(
                            "Failed to create database directory {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
                debug!("Opening victims database at {}", path.display());
                Connection::open(path)
            }
            Location::Memory => Connection::open_in_memory(),
        }
        .map_err(|e| Error::Storage(format!("Failed to open victims database: {}", e)))?;

        conn.pragma_update(None, "foreign_keys", true)
            .map_err(|e| Error::Storage(format!("Failed to enable foreign keys: {}", e)))?;

        Ok(conn)
    }

    /// Run `f` against the shared connection, opening it if needed
    fn with_conn<T>(
        &self,
        action: &str,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| Error::Storage(String::from("Database handle poisoned")))?;

        if guard.is_none() {
            *guard = Some(self.connect()?);
        }

        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::Internal(String::from("Database handle missing")))?;

        f(conn).map_err(|e| Error::Storage(format!("Failed to {}: {}", action, e)))
    }

    /// Release the connection; the next operation reopens it.
    /// In-memory stores keep their connection since closing it discards the data.
    pub fn disconnect(&self) -> Result<()> {
        if matches!(self.location, Location::Memory) {
            return Ok(());
        }

        let mut guard = self
            .conn
            .lock()
            .map_err(|_| Error::Storage(String::from("Database handle poisoned")))?;

        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, e)| Error::Storage(format!("Failed to close database: {}", e)))?;
        }
        Ok(())
    }

    /// Check whether a table exists
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        self.with_conn("inspect schema", |conn| table_exists(conn, name))
    }

    /// Create any missing tables; safe to call on an initialized store
    pub fn ensure_schema(&self) -> Result<()> {
        self.with_conn("initialize schema", |conn| {
            for (table, ddl) in SCHEMA {
                if !table_exists(conn, table)? {
                    debug!("Creating table {}", table);
                    conn.execute_batch(ddl)?;
                }
            }
            Ok(())
        })
    }

    /// Drop every table that exists
    pub fn drop_schema(&self) -> Result<()> {
        self.with_conn("drop schema", |conn| {
            for (table, _) in SCHEMA.iter().rev() {
                if table_exists(conn, table)? {
                    debug!("Dropping table {}", table);
                    conn.execute_batch(&format!("DROP TABLE {}", table))?;
                }
            }
            Ok(())
        })
    }

    /// Insert a record and all of its digests and metadata in one transaction.
    /// Returns the newly assigned id; any `id` already on the record is ignored.
    pub fn insert(&self, record: &AdvisoryRecord) -> Result<i64> {
        record.validate()?;
        let cves = serde_json::to_string(&record.cves)?;
        let created = format_timestamp(&record.created);

        let id = self.with_conn("insert advisory", |conn| {
            let tx = conn.transaction()?;

            tx.execute(
                r#"
                INSERT INTO victims (cves, vendor, name, version, created, submitter, format, status)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    cves,
                    record.vendor,
                    record.name,
                    record.version,
                    created,
                    record.submitter,
                    record.format,
                    record.status.as_str(),
                ],
            )?;
            let id = tx.last_insert_rowid();

            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO fingerprints (victims_id, algorithm, combined, filename, hash) VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (algorithm, hashes) in &record.hashes {
                    for (filename, hash) in &hashes.files {
                        stmt.execute(params![id, algorithm, hashes.combined, filename, hash])?;
                    }
                }

                let mut stmt = tx.prepare_cached(
                    "INSERT INTO metadata (source, victims_id, property, value) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (source, properties) in &record.meta {
                    for (property, value) in properties {
                        stmt.execute(params![source, id, property, value])?;
                    }
                }
            }

            tx.commit()?;
            Ok(id)
        })?;

        debug!("Inserted advisory {} as id {}", record.coordinates(), id);
        Ok(id)
    }

    /// Load a full record, or `None` if the id is not stored
    pub fn get(&self, id: i64) -> Result<Option<AdvisoryRecord>> {
        self.with_conn("load advisory", |conn| load_record(conn, id))
    }

    /// Every stored record, in id order
    pub fn list(&self) -> Result<Vec<AdvisoryRecord>> {
        self.with_conn("list advisories", |conn| {
            let ids = query_ids(conn, "SELECT id FROM victims ORDER BY id", [])?;
            load_records(conn, ids)
        })
    }

    /// Delete a record together with its digests and metadata.
    /// Returns whether anything was deleted; an unknown id is not an error.
    pub fn remove(&self, id: i64) -> Result<bool> {
        let deleted = self.with_conn("remove advisory", |conn| {
            conn.execute("DELETE FROM victims WHERE id = ?1", [id])
        })?;

        if deleted > 0 {
            debug!("Removed advisory {}", id);
        }
        Ok(deleted > 0)
    }

    /// Delete every record for a coordinate triple, returning how many went
    pub fn remove_by_coordinates(&self, vendor: &str, name: &str, version: &str) -> Result<usize> {
        self.with_conn("remove advisories by coordinates", |conn| {
            conn.execute(
                "DELETE FROM victims WHERE vendor = ?1 AND name = ?2 AND version = ?3",
                params![vendor, name, version],
            )
        })
    }

    /// Newest `created` timestamp in the store, `None` when empty
    pub fn latest_watermark(&self) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<String> = self.with_conn("read watermark", |conn| {
            conn.query_row("SELECT MAX(created) FROM victims", [], |row| row.get(0))
        })?;

        latest.as_deref().map(parse_timestamp).transpose()
    }

    /// Number of stored records
    pub fn count(&self) -> Result<u64> {
        let count: i64 = self.with_conn("count advisories", |conn| {
            conn.query_row("SELECT COUNT(*) FROM victims", [], |row| row.get(0))
        })?;
        Ok(count as u64)
    }

    /// Record owning a file digest under any algorithm; lowest id wins on ties
    pub fn find_by_file_hash(&self, digest: &str) -> Result<Option<AdvisoryRecord>> {
        self.find_first(
            "find advisory by file hash",
            "SELECT victims_id FROM fingerprints WHERE hash = ?1 ORDER BY victims_id LIMIT 1",
            params![digest],
        )
    }

    /// Record whose whole-artifact digest matches; lowest id wins on ties
    pub fn find_by_artifact_hash(&self, combined: &str) -> Result<Option<AdvisoryRecord>> {
        self.find_first(
            "find advisory by artifact hash",
            "SELECT victims_id FROM fingerprints WHERE combined = ?1 ORDER BY victims_id LIMIT 1",
            params![combined],
        )
    }

    /// Record for an exact coordinate triple; lowest id wins on ties
    pub fn find_by_coordinates(
        &self,
        vendor: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<AdvisoryRecord>> {
        self.find_first(
            "find advisory by coordinates",
            "SELECT id FROM victims WHERE vendor = ?1 AND name = ?2 AND version = ?3 ORDER BY id LIMIT 1",
            params![vendor, name, version],
        )
    }

    /// Every record for an exact coordinate triple
    pub fn find_all_by_coordinates(
        &self,
        vendor: &str,
        name: &str,
        version: &str,
    ) -> Result<Vec<AdvisoryRecord>> {
        self.with_conn("find advisories by coordinates", |conn| {
            let ids = query_ids(
                conn,
                "SELECT id FROM victims WHERE vendor = ?1 AND name = ?2 AND version = ?3 ORDER BY id",
                params![vendor, name, version],
            )?;
            load_records(conn, ids)
        })
    }

    /// Record whose `source` metadata carries every listed property with the
    /// given value; lowest id wins on ties
    pub fn find_by_metadata(
        &self,
        source: &str,
        properties: &[(&str, &str)],
    ) -> Result<Option<AdvisoryRecord>> {
        let wanted: BTreeSet<(&str, &str)> = properties.iter().copied().collect();
        if wanted.is_empty() {
            return Err(Error::InvalidArgument(String::from(
                "metadata lookup needs at least one property",
            )));
        }

        let clauses = vec!["(property = ? AND value = ?)"; wanted.len()].join(" OR ");
        let sql = format!(
            "SELECT victims_id FROM metadata WHERE source = ? AND ({}) \
             GROUP BY victims_id HAVING COUNT(*) = {} ORDER BY victims_id LIMIT 1",
            clauses,
            wanted.len()
        );

        let mut bound = vec![source];
        for (property, value) in wanted {
            bound.extend([property, value]);
        }
        self.find_first("find advisory by metadata", &sql, params_from_iter(bound))
    }

    /// Approximate match of a candidate artifact's file digests.
    ///
    /// With `n` distinct candidates the required hit count is
    /// `round(tolerance * n)`. A record is returned only when the number of
    /// its fingerprint rows (all algorithms) whose digest is a candidate is
    /// exactly that count; records hitting more or fewer are left out.
    pub fn find_by_partial_hash_set(
        &self,
        candidates: &[String],
        tolerance: f64,
    ) -> Result<Vec<AdvisoryRecord>> {
        if !(0.0..=1.0).contains(&tolerance) {
            return Err(Error::InvalidArgument(format!(
                "tolerance {} is outside [0, 1]",
                tolerance
            )));
        }

        let digests: Vec<&str> = candidates
            .iter()
            .map(String::as_str)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if digests.is_empty() {
            return Ok(vec![]);
        }

        let required = (tolerance * digests.len() as f64).round() as i64;
        debug!(
            "Matching {} candidate digests, {} hits required",
            digests.len(),
            required
        );

        self.with_conn("match partial hash set", |conn| {
            let mut hits: BTreeMap<i64, i64> = BTreeMap::new();

            for chunk in digests.chunks(MAX_BOUND_DIGESTS) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let sql = format!(
                    "SELECT victims_id, COUNT(*) FROM fingerprints WHERE hash IN ({}) GROUP BY victims_id",
                    placeholders
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (id, count) = row?;
                    *hits.entry(id).or_insert(0) += count;
                }
            }

            let ids: Vec<i64> = hits
                .into_iter()
                .filter(|(_, count)| *count == required)
                .map(|(id, _)| id)
                .collect();
            load_records(conn, ids)
        })
    }

    fn find_first(
        &self,
        action: &str,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<AdvisoryRecord>> {
        self.with_conn(action, |conn| {
            let id: Option<i64> = conn.query_row(sql, params, |row| row.get(0)).optional()?;
            match id {
                Some(id) => load_record(conn, id),
                None => Ok(None),
            }
        })
    }
}

impl FingerprintLookup for VictimsDb {
    fn find_by_file_hash(&self, digest: &str) -> Result<Option<AdvisoryRecord>> {
        VictimsDb::find_by_file_hash(self, digest)
    }

    fn find_by_artifact_hash(&self, combined: &str) -> Result<Option<AdvisoryRecord>> {
        VictimsDb::find_by_artifact_hash(self, combined)
    }

    fn find_by_coordinates(
        &self,
        vendor: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<AdvisoryRecord>> {
        VictimsDb::find_by_coordinates(self, vendor, name, version)
    }

    fn find_by_partial_hash_set(
        &self,
        candidates: &[String],
        tolerance: f64,
    ) -> Result<Vec<AdvisoryRecord>> {
        VictimsDb::find_by_partial_hash_set(self, candidates, tolerance)
    }

    fn find_by_metadata(
        &self,
        source: &str,
        properties: &[(&str, &str)],
    ) -> Result<Option<AdvisoryRecord>> {
        VictimsDb::find_by_metadata(self, source, properties)
    }
}

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [name],
        |row| row.get(0),
    )
}

fn query_ids(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let ids = stmt.query_map(params, |row| row.get(0))?;
    ids.collect()
}

fn load_records(conn: &Connection, ids: Vec<i64>) -> rusqlite::Result<Vec<AdvisoryRecord>> {
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(record) = load_record(conn, id)? {
            records.push(record);
        }
    }
    Ok(records)
}

fn load_record(conn: &Connection, id: i64) -> rusqlite::Result<Option<AdvisoryRecord>> {
    let Some(mut record) = conn.query_row(SELECT_VICTIM, [id], record_from_row).optional()? else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT algorithm, combined, filename, hash FROM fingerprints WHERE victims_id = ?1",
    )?;
    let rows = stmt.query_map([id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;
    for row in rows {
        let (algorithm, combined, filename, hash) = row?;
        record
            .hashes
            .entry(algorithm)
            .or_insert_with(|| HashRecord::new(combined))
            .files
            .insert(filename, hash);
    }

    let mut stmt = conn
        .prepare_cached("SELECT source, property, value FROM metadata WHERE victims_id = ?1")?;
    let rows = stmt.query_map([id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    for row in rows {
        let (source, property, value) = row?;
        record.meta.entry(source).or_default().insert(property, value);
    }

    Ok(Some(record))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AdvisoryRecord> {
    let cves: String = row.get(1)?;
    let created: String = row.get(5)?;
    let status: String = row.get(8)?;

    Ok(AdvisoryRecord {
        id: Some(row.get(0)?),
        cves: serde_json::from_str(&cves).map_err(|e| conversion_error(1, e))?,
        vendor: row.get(2)?,
        name: row.get(3)?,
        version: row.get(4)?,
        created: parse_timestamp(&created).map_err(|e| conversion_error(5, e))?,
        submitter: row.get(6)?,
        format: row.get(7)?,
        status: status.parse::<Status>().map_err(|e| conversion_error(8, e))?,
        hashes: BTreeMap::new(),
        meta: BTreeMap::new(),
    })
}

fn conversion_error<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use victims_core::{MANIFEST, POM_PROPERTIES};

    fn ts(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    fn record_with_digests(name: &str, created: DateTime<Utc>, digests: &[&str]) -> AdvisoryRecord {
        let mut hashes = HashRecord::new(format!("{}-combined", name));
        for (i, digest) in digests.iter().enumerate() {
            hashes = hashes.with_file(format!("{}/File{}.class", name, i), *digest);
        }
        AdvisoryRecord::new("org.example", name, "1.0", created).with_hashes("SHA512", hashes)
    }

    fn row_count(db: &VictimsDb, table: &str) -> i64 {
        db.with_conn("count rows", |conn| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
        })
        .unwrap()
    }

    fn strip_id(mut record: AdvisoryRecord) -> AdvisoryRecord {
        record.id = None;
        record
    }

    #[test]
    fn test_create_db() {
        let db = VictimsDb::in_memory().unwrap();
        assert_eq!(db.count().unwrap(), 0);
        assert_eq!(db.latest_watermark().unwrap(), None);
        assert!(db.list().unwrap().is_empty());
    }

    #[test]
    fn test_ensure_schema_idempotent() {
        let db = VictimsDb::in_memory().unwrap();
        db.ensure_schema().unwrap();
        db.ensure_schema().unwrap();

        for table in ["victims", "fingerprints", "metadata"] {
            assert!(db.table_exists(table).unwrap(), "{} missing", table);
        }
        assert!(!db.table_exists("advisories").unwrap());
    }

    #[test]
    fn test_drop_schema() {
        let db = VictimsDb::in_memory().unwrap();
        db.insert(&record_with_digests("a", ts(2012, 1, 1), &["d1"])).unwrap();

        db.drop_schema().unwrap();
        db.drop_schema().unwrap();
        for table in ["victims", "fingerprints", "metadata"] {
            assert!(!db.table_exists(table).unwrap());
        }

        db.ensure_schema().unwrap();
        assert_eq!(db.count().unwrap(), 0);
    }

    #[test]
    fn test_insert_get_round_trip() {
        let db = VictimsDb::in_memory().unwrap();
        let record = AdvisoryRecord::new("org.apache", "commons-collections", "3.2.1", ts(2015, 11, 6))
            .with_cve("CVE-2015-7501")
            .with_cve("CVE-2015-4852")
            .with_submitter("secalert")
            .with_format("Jar")
            .with_status(Status::Released)
            .with_hashes(
                "SHA512",
                HashRecord::new("sha512-combined")
                    .with_file("org/apache/commons/collections/Transformer.class", "s1")
                    .with_file("org/apache/commons/collections/Closure.class", "s2"),
            )
            .with_hashes(
                "SHA1",
                HashRecord::new("sha1-combined")
                    .with_file("org/apache/commons/collections/Transformer.class", "h1"),
            )
            .with_meta("pom.properties", "groupId", "commons-collections")
            .with_meta("pom.properties", "version", "3.2.1")
            .with_meta("manifest", "Implementation-Vendor", "Apache Software Foundation");

        let id = db.insert(&record).unwrap();
        let stored = db.get(id).unwrap().unwrap();

        assert_eq!(stored.id, Some(id));
        assert_eq!(strip_id(stored), record);
    }

    #[test]
    fn test_round_trip_empty_cves() {
        let db = VictimsDb::in_memory().unwrap();
        let record = record_with_digests("empty", ts(2013, 2, 3), &["x"]);
        let id = db.insert(&record).unwrap();
        let stored = db.get(id).unwrap().unwrap();
        assert!(stored.cves.is_empty());
        assert_eq!(strip_id(stored), record);
    }

    #[test]
    fn test_insert_ignores_existing_id() {
        let db = VictimsDb::in_memory().unwrap();
        let mut record = record_with_digests("a", ts(2012, 1, 1), &["d1"]);
        record.id = Some(999);

        let id = db.insert(&record).unwrap();
        assert_ne!(id, 999);
        assert!(db.get(999).unwrap().is_none());
    }

    #[test]
    fn test_get_missing() {
        let db = VictimsDb::in_memory().unwrap();
        assert!(db.get(42).unwrap().is_none());
    }

    #[test]
    fn test_ids_never_reused() {
        let db = VictimsDb::in_memory().unwrap();
        let first = db.insert(&record_with_digests("a", ts(2012, 1, 1), &["d1"])).unwrap();
        let second = db.insert(&record_with_digests("b", ts(2012, 1, 2), &["d2"])).unwrap();
        assert!(second > first);

        db.remove(second).unwrap();
        let third = db.insert(&record_with_digests("c", ts(2012, 1, 3), &["d3"])).unwrap();
        assert!(third > second);
    }

    #[test]
    fn test_remove_idempotent_and_cascades() {
        let db = VictimsDb::in_memory().unwrap();
        let record = record_with_digests("a", ts(2012, 1, 1), &["d1", "d2"]).with_meta("manifest", "k", "v");
        let id = db.insert(&record).unwrap();
        assert_eq!(row_count(&db, "fingerprints"), 2);
        assert_eq!(row_count(&db, "metadata"), 1);

        assert!(db.remove(id).unwrap());
        assert!(!db.remove(id).unwrap());
        assert!(!db.remove(12345).unwrap());

        assert!(db.get(id).unwrap().is_none());
        assert_eq!(row_count(&db, "fingerprints"), 0);
        assert_eq!(row_count(&db, "metadata"), 0);
    }

    #[test]
    fn test_watermark_tracks_max_created() {
        let db = VictimsDb::in_memory().unwrap();
        db.insert(&record_with_digests("a", ts(2012, 1, 1), &["d1"])).unwrap();
        db.insert(&record_with_digests("b", ts(2013, 6, 1), &["d2"])).unwrap();
        db.insert(&record_with_digests("c", ts(2012, 9, 1), &["d3"])).unwrap();

        assert_eq!(db.latest_watermark().unwrap(), Some(ts(2013, 6, 1)));
    }

    #[test]
    fn test_list_returns_all() {
        let db = VictimsDb::in_memory().unwrap();
        for name in ["a", "b", "c"] {
            db.insert(&record_with_digests(name, ts(2012, 1, 1), &[name])).unwrap();
        }

        let names: Vec<_> = db.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_find_by_file_hash() {
        let db = VictimsDb::in_memory().unwrap();
        let record = record_with_digests("a", ts(2012, 1, 1), &["d1", "d2"])
            .with_hashes("MD5", HashRecord::new("md5-combined").with_file("a/File0.class", "m1"));
        let id = db.insert(&record).unwrap();

        assert_eq!(db.find_by_file_hash("d2").unwrap().unwrap().id, Some(id));
        assert_eq!(db.find_by_file_hash("m1").unwrap().unwrap().id, Some(id));
        assert!(db.find_by_file_hash("nope").unwrap().is_none());
        assert!(db.find_by_file_hash("a-combined").unwrap().is_none());
    }

    #[test]
    fn test_find_by_file_hash_shared_digest_returns_lowest_id() {
        let db = VictimsDb::in_memory().unwrap();
        let first = db.insert(&record_with_digests("a", ts(2012, 1, 1), &["shared", "x"])).unwrap();
        db.insert(&record_with_digests("b", ts(2012, 1, 2), &["shared", "y"])).unwrap();

        assert_eq!(db.find_by_file_hash("shared").unwrap().unwrap().id, Some(first));
    }

    #[test]
    fn test_find_by_artifact_hash() {
        let db = VictimsDb::in_memory().unwrap();
        let id = db.insert(&record_with_digests("a", ts(2012, 1, 1), &["d1"])).unwrap();

        assert_eq!(db.find_by_artifact_hash("a-combined").unwrap().unwrap().id, Some(id));
        assert!(db.find_by_artifact_hash("d1").unwrap().is_none());
    }

    #[test]
    fn test_find_by_artifact_hash_shared_combined_returns_lowest_id() {
        let db = VictimsDb::in_memory().unwrap();
        let shared = |name: &str, digest: &str| {
            AdvisoryRecord::new("org.example", name, "1.0", ts(2012, 1, 1))
                .with_hashes("SHA512", HashRecord::new("shared-combined").with_file("A.class", digest))
        };
        let first = db.insert(&shared("a", "d1")).unwrap();
        let second = db.insert(&shared("b", "d2")).unwrap();

        assert_eq!(db.find_by_artifact_hash("shared-combined").unwrap().unwrap().id, Some(first));

        db.remove(first).unwrap();
        assert_eq!(db.find_by_artifact_hash("shared-combined").unwrap().unwrap().id, Some(second));
    }

    #[test]
    fn test_find_by_coordinates() {
        let db = VictimsDb::in_memory().unwrap();
        let first = db.insert(&record_with_digests("a", ts(2012, 1, 1), &["d1"])).unwrap();
        let second = db.insert(&record_with_digests("a", ts(2012, 2, 1), &["d2"])).unwrap();

        let found = db.find_by_coordinates("org.example", "a", "1.0").unwrap().unwrap();
        assert_eq!(found.id, Some(first));
        assert!(db.find_by_coordinates("org.example", "a", "2.0").unwrap().is_none());

        let all: Vec<_> = db
            .find_all_by_coordinates("org.example", "a", "1.0")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(all, vec![Some(first), Some(second)]);

        assert_eq!(db.remove_by_coordinates("org.example", "a", "1.0").unwrap(), 2);
        assert_eq!(db.count().unwrap(), 0);
    }

    fn ten_digest_store() -> (VictimsDb, i64, Vec<String>) {
        let db = VictimsDb::in_memory().unwrap();
        let digests: Vec<String> = (0..10).map(|i| format!("a{}", i)).collect();
        let refs: Vec<&str> = digests.iter().map(String::as_str).collect();
        let id = db.insert(&record_with_digests("a", ts(2012, 1, 1), &refs)).unwrap();

        // 7 of the record's digests plus 3 unrelated ones
        let mut candidates: Vec<String> = digests[..7].to_vec();
        candidates.extend(["x7", "x8", "x9"].map(String::from));
        (db, id, candidates)
    }

    #[test]
    fn test_partial_match_exact_threshold() {
        let (db, id, candidates) = ten_digest_store();

        let matches = db.find_by_partial_hash_set(&candidates, 0.7).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, Some(id));
    }

    #[test]
    fn test_partial_match_below_threshold_excluded() {
        let (db, _, candidates) = ten_digest_store();
        // T = 8, record hits 7
        assert!(db.find_by_partial_hash_set(&candidates, 0.8).unwrap().is_empty());
    }

    #[test]
    fn test_partial_match_above_threshold_excluded() {
        let (db, _, candidates) = ten_digest_store();
        // T = 5, record hits 7; equality is required
        assert!(db.find_by_partial_hash_set(&candidates, 0.5).unwrap().is_empty());
    }

    #[test]
    fn test_partial_match_rounds_threshold() {
        let (db, id, candidates) = ten_digest_store();
        // 0.66 * 10 = 6.6 rounds to 7
        let matches = db.find_by_partial_hash_set(&candidates, 0.66).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, Some(id));
    }

    #[test]
    fn test_partial_match_each_record_once() {
        let db = VictimsDb::in_memory().unwrap();
        let a = db.insert(&record_with_digests("a", ts(2012, 1, 1), &["s1", "s2"])).unwrap();
        let b = db.insert(&record_with_digests("b", ts(2012, 1, 1), &["s1", "s2", "s3"])).unwrap();
        db.insert(&record_with_digests("c", ts(2012, 1, 1), &["s1"])).unwrap();

        let candidates = ["s1", "s2", "s3", "s4"].map(String::from);
        // T = 2: only a hits exactly two
        let ids: Vec<_> = db
            .find_by_partial_hash_set(&candidates, 0.5)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![Some(a)]);

        // T = 3: only b
        let ids: Vec<_> = db
            .find_by_partial_hash_set(&candidates, 0.75)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![Some(b)]);
    }

    #[test]
    fn test_partial_match_duplicate_candidates_collapse() {
        let db = VictimsDb::in_memory().unwrap();
        let id = db.insert(&record_with_digests("a", ts(2012, 1, 1), &["d0", "d1"])).unwrap();

        let candidates = ["d0", "d0", "d1"].map(String::from);
        let matches = db.find_by_partial_hash_set(&candidates, 1.0).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, Some(id));
    }

    #[test]
    fn test_partial_match_spans_chunks() {
        let db = VictimsDb::in_memory().unwrap();
        let id = db
            .insert(&record_with_digests("a", ts(2012, 1, 1), &["d0000", "d0700", "d1400"]))
            .unwrap();

        let candidates: Vec<String> = (0..1500).map(|i| format!("d{:04}", i)).collect();
        // round(0.002 * 1500) = 3, one hit in each chunk
        let matches = db.find_by_partial_hash_set(&candidates, 0.002).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, Some(id));
    }

    #[test]
    fn test_partial_match_edge_inputs() {
        let (db, _, candidates) = ten_digest_store();

        assert!(db.find_by_partial_hash_set(&[], 0.5).unwrap().is_empty());
        assert!(db.find_by_partial_hash_set(&candidates, 0.0).unwrap().is_empty());
        assert!(matches!(
            db.find_by_partial_hash_set(&candidates, 1.2),
            Err(Error::InvalidArgument(_))
        ));
        assert!(db.find_by_partial_hash_set(&candidates, f64::NAN).is_err());
    }

    fn with_pom(record: AdvisoryRecord, group: &str, artifact: &str, version: &str) -> AdvisoryRecord {
        record
            .with_meta(POM_PROPERTIES, "groupId", group)
            .with_meta(POM_PROPERTIES, "artifactId", artifact)
            .with_meta(POM_PROPERTIES, "version", version)
    }

    #[test]
    fn test_find_by_pom_properties() {
        let db = VictimsDb::in_memory().unwrap();
        let record = with_pom(
            record_with_digests("a", ts(2012, 1, 1), &["d1"]),
            "org.example",
            "a",
            "1.0",
        );
        let id = db.insert(&record).unwrap();
        db.insert(&with_pom(
            record_with_digests("b", ts(2012, 1, 1), &["d2"]),
            "org.example",
            "b",
            "1.0",
        ))
        .unwrap();

        let found = db.find_by_pom_properties("org.example", "a", "1.0").unwrap().unwrap();
        assert_eq!(found.id, Some(id));
        assert!(db.find_by_pom_properties("org.example", "a", "2.0").unwrap().is_none());
        assert!(db.find_by_pom_properties("org.other", "a", "1.0").unwrap().is_none());
    }

    #[test]
    fn test_find_by_metadata_requires_every_property() {
        let db = VictimsDb::in_memory().unwrap();
        // two of the three properties only
        db.insert(
            &record_with_digests("a", ts(2012, 1, 1), &["d1"])
                .with_meta(POM_PROPERTIES, "groupId", "org.example")
                .with_meta(POM_PROPERTIES, "artifactId", "a"),
        )
        .unwrap();

        assert!(db.find_by_pom_properties("org.example", "a", "1.0").unwrap().is_none());
        assert!(db
            .find_by_metadata(POM_PROPERTIES, &[("groupId", "org.example"), ("artifactId", "a")])
            .unwrap()
            .is_some());
        // same property asked with two values can never match
        assert!(db
            .find_by_metadata(POM_PROPERTIES, &[("artifactId", "a"), ("artifactId", "b")])
            .unwrap()
            .is_none());
        // repeated pairs collapse
        assert!(db
            .find_by_metadata(POM_PROPERTIES, &[("artifactId", "a"), ("artifactId", "a")])
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_find_by_metadata_scoped_to_source() {
        let db = VictimsDb::in_memory().unwrap();
        db.insert(
            &record_with_digests("a", ts(2012, 1, 1), &["d1"])
                .with_meta(MANIFEST, "Implementation-Vendor", "Example Corp")
                .with_meta(MANIFEST, "Implementation-Title", "a")
                .with_meta(MANIFEST, "Implementation-Version", "1.0"),
        )
        .unwrap();

        assert!(db.find_by_implementation("Example Corp", "a", "1.0").unwrap().is_some());
        assert!(db
            .find_by_metadata(POM_PROPERTIES, &[("Implementation-Title", "a")])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_find_by_metadata_lowest_id_and_empty_query() {
        let db = VictimsDb::in_memory().unwrap();
        let first = db
            .insert(&with_pom(record_with_digests("a", ts(2012, 1, 1), &["d1"]), "g", "a", "1"))
            .unwrap();
        let second = db
            .insert(&with_pom(record_with_digests("a", ts(2012, 1, 2), &["d2"]), "g", "a", "1"))
            .unwrap();

        assert_eq!(db.find_by_pom_properties("g", "a", "1").unwrap().unwrap().id, Some(first));
        assert!(matches!(
            db.find_by_metadata(POM_PROPERTIES, &[]),
            Err(Error::InvalidArgument(_))
        ));

        db.remove(first).unwrap();
        assert_eq!(db.find_by_pom_properties("g", "a", "1").unwrap().unwrap().id, Some(second));
    }

    #[test]
    fn test_unusable_directory_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let db = VictimsDb::new(blocker.join("victims.db"));
        match db.ensure_schema() {
            Err(Error::Storage(msg)) => assert!(msg.contains("blocker"), "{}", msg),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_record_rejected() {
        let db = VictimsDb::in_memory().unwrap();
        let record = AdvisoryRecord::new("v", "n", "1", ts(2012, 1, 1))
            .with_hashes("SHA1", HashRecord::new("combined-only"));

        assert!(matches!(db.insert(&record), Err(Error::InvalidRecord(_))));
        assert_eq!(db.count().unwrap(), 0);
    }

    #[test]
    fn test_failed_insert_rolls_back() {
        let db = VictimsDb::in_memory().unwrap();
        db.with_conn("drop metadata", |conn| conn.execute_batch("DROP TABLE metadata"))
            .unwrap();

        let record = record_with_digests("a", ts(2012, 1, 1), &["d1", "d2"]).with_meta("manifest", "k", "v");
        let err = db.insert(&record).unwrap_err();
        assert_eq!(err.code(), "STORAGE_ERROR");

        assert_eq!(row_count(&db, "victims"), 0);
        assert_eq!(row_count(&db, "fingerprints"), 0);
    }

    #[test]
    fn test_file_backed_store_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("victims.db");

        let db = VictimsDb::new(&path);
        assert!(!path.exists());
        db.ensure_schema().unwrap();
        assert!(path.exists());

        let id = db.insert(&record_with_digests("a", ts(2012, 1, 1), &["d1"])).unwrap();
        db.disconnect().unwrap();
        assert_eq!(db.get(id).unwrap().unwrap().name, "a");

        let reopened = VictimsDb::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
        assert_eq!(reopened.latest_watermark().unwrap(), Some(ts(2012, 1, 1)));
    }

    #[test]
    fn test_lookup_trait_object() {
        let db = VictimsDb::in_memory().unwrap();
        let id = db.insert(&record_with_digests("a", ts(2012, 1, 1), &["d1", "d2"])).unwrap();

        let lookup: &dyn FingerprintLookup = &db;
        assert_eq!(lookup.find_by_file_hash("d1").unwrap().unwrap().id, Some(id));
        assert_eq!(lookup.find_by_artifact_hash("a-combined").unwrap().unwrap().id, Some(id));
        assert!(lookup.find_by_coordinates("org.example", "a", "1.0").unwrap().is_some());
        let candidates = ["d1", "d2"].map(String::from);
        assert_eq!(lookup.find_by_partial_hash_set(&candidates, 1.0).unwrap().len(), 1);
        assert!(lookup.find_by_pom_properties("org.example", "a", "1.0").unwrap().is_none());
    }
}
