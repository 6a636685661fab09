use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

pub const TABLE: &str = "smoking_areas";

/// Columns every store must carry, with the definition used when a legacy
/// table lacks them.
const EXPECTED_COLUMNS: &[&str] = &[
    "category TEXT",
    "submitted_category TEXT",
    "address TEXT",
    "detail TEXT",
    "postal_code TEXT",
    "longitude REAL",
    "latitude REAL",
    "status TEXT DEFAULT 'active'",
    "report_count INTEGER DEFAULT 0",
    "created_at TEXT",
    "updated_at TEXT",
    "resolution_method TEXT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Replace,
    Append,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Replace => "replace",
            WriteMode::Append => "append",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub category: String,
    pub submitted_category: Option<String>,
    pub address: String,
    pub detail: Option<String>,
    pub postal_code: Option<String>,
    pub longitude: f64,
    pub latitude: f64,
    pub status: String,
    pub report_count: i64,
    pub resolution_method: String,
}

impl PersistedRecord {
    pub fn is_storable(&self) -> bool {
        !self.address.trim().is_empty() && self.latitude.is_finite() && self.longitude.is_finite()
    }

    pub fn dedupe_key(&self) -> (String, String) {
        dedupe_key(&self.address, self.detail.as_deref())
    }
}

pub fn dedupe_key(address: &str, detail: Option<&str>) -> (String, String) {
    (
        address.trim().to_lowercase(),
        detail.unwrap_or_default().trim().to_lowercase(),
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: i64,
    #[serde(flatten)]
    pub record: PersistedRecord,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaState {
    pub columns: BTreeSet<String>,
}

impl SchemaState {
    pub fn load(connection: &Connection) -> AppResult<Self> {
        let pragma = format!("PRAGMA table_info({TABLE})");
        let mut stmt = connection.prepare(&pragma)?;
        let mut rows = stmt.query([])?;
        let mut columns = BTreeSet::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            columns.insert(name);
        }
        Ok(Self { columns })
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains(column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub mode: WriteMode,
    pub received: usize,
    pub skipped_invalid: usize,
    pub skipped_duplicate: usize,
    pub cleared: usize,
    pub inserted: usize,
}

pub fn open_store<P: AsRef<Path>>(path: P) -> AppResult<Connection> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(path, flags)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    info!(target: "store", path = %path.display(), "store opened");
    Ok(connection)
}

/// Brings the table to the expected shape. Additive only; safe to repeat.
pub fn ensure_schema(connection: &Connection) -> AppResult<SchemaState> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS smoking_areas (
            id INTEGER PRIMARY KEY,
            category TEXT,
            submitted_category TEXT,
            address TEXT,
            detail TEXT,
            postal_code TEXT,
            longitude REAL,
            latitude REAL,
            status TEXT DEFAULT 'active',
            report_count INTEGER DEFAULT 0,
            created_at TEXT DEFAULT (DATETIME('now')),
            updated_at TEXT DEFAULT (DATETIME('now')),
            resolution_method TEXT
        );
        "#,
    )?;

    let before = SchemaState::load(connection)?;
    let mut added = Vec::new();
    for definition in EXPECTED_COLUMNS {
        if let Some(column) = ensure_column(connection, &before, definition)? {
            added.push(column);
        }
    }

    // ALTER TABLE cannot take DATETIME('now') as a default, so fresh timestamp
    // columns are filled in place.
    for column in ["created_at", "updated_at"] {
        if added.iter().any(|name| name == column) {
            connection.execute(
                &format!("UPDATE {TABLE} SET {column} = COALESCE({column}, DATETIME('now'))"),
                [],
            )?;
        }
    }
    if added.iter().any(|name| name == "status") {
        connection.execute(
            &format!("UPDATE {TABLE} SET status = COALESCE(status, 'active')"),
            [],
        )?;
    }
    if added.iter().any(|name| name == "report_count") {
        connection.execute(
            &format!("UPDATE {TABLE} SET report_count = COALESCE(report_count, 0)"),
            [],
        )?;
    }

    connection.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_smoking_areas_location ON smoking_areas(latitude, longitude);
        CREATE INDEX IF NOT EXISTS idx_smoking_areas_category ON smoking_areas(category);
        CREATE INDEX IF NOT EXISTS idx_smoking_areas_status ON smoking_areas(status);

        CREATE TRIGGER IF NOT EXISTS trg_smoking_areas_updated_at
        AFTER UPDATE ON smoking_areas
        FOR EACH ROW WHEN NEW.updated_at IS OLD.updated_at
        BEGIN
            UPDATE smoking_areas SET updated_at = DATETIME('now') WHERE rowid = NEW.rowid;
        END;
        "#,
    )?;

    if !added.is_empty() {
        info!(target: "store", columns = ?added, "schema migrated");
    }
    SchemaState::load(connection)
}

fn ensure_column(
    connection: &Connection,
    schema: &SchemaState,
    definition: &str,
) -> AppResult<Option<String>> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if schema.contains(column_name) {
        return Ok(None);
    }
    connection.execute(&format!("ALTER TABLE {TABLE} ADD COLUMN {definition}"), [])?;
    Ok(Some(column_name.to_string()))
}

/// Migration and write share one transaction. An append that adds nothing
/// rolls back, leaving the store untouched.
pub fn upsert_records(
    connection: &mut Connection,
    records: &[PersistedRecord],
    mode: WriteMode,
) -> AppResult<UpsertSummary> {
    let tx = connection.transaction()?;
    ensure_schema(&tx)?;

    let mut summary = UpsertSummary {
        mode,
        received: records.len(),
        skipped_invalid: 0,
        skipped_duplicate: 0,
        cleared: 0,
        inserted: 0,
    };

    let storable: Vec<&PersistedRecord> = records
        .iter()
        .filter(|record| record.is_storable())
        .collect();
    summary.skipped_invalid = records.len() - storable.len();

    let batch: Vec<&PersistedRecord> = match mode {
        WriteMode::Replace => {
            summary.cleared = tx.execute(&format!("DELETE FROM {TABLE}"), [])?;
            storable
        }
        WriteMode::Append => {
            let mut seen = existing_keys(&tx)?;
            let fresh: Vec<&PersistedRecord> = storable
                .into_iter()
                .filter(|record| seen.insert(record.dedupe_key()))
                .collect();
            summary.skipped_duplicate = records.len() - summary.skipped_invalid - fresh.len();
            if fresh.is_empty() {
                info!(
                    target: "store",
                    skipped_duplicate = summary.skipped_duplicate,
                    "append found no new records; store left untouched"
                );
                return Ok(summary);
            }
            fresh
        }
    };

    {
        let mut stmt = tx.prepare(
            "INSERT INTO smoking_areas (
                category, submitted_category, address, detail, postal_code,
                longitude, latitude, status, report_count, resolution_method,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, DATETIME('now'), DATETIME('now'))",
        )?;
        for record in &batch {
            stmt.execute(params![
                record.category,
                record.submitted_category,
                record.address.trim(),
                record.detail,
                record.postal_code,
                record.longitude,
                record.latitude,
                record.status,
                record.report_count,
                record.resolution_method,
            ])?;
        }
    }
    summary.inserted = batch.len();
    tx.commit()?;

    info!(
        target: "store",
        mode = mode.as_str(),
        inserted = summary.inserted,
        cleared = summary.cleared,
        skipped_invalid = summary.skipped_invalid,
        skipped_duplicate = summary.skipped_duplicate,
        "records written"
    );
    Ok(summary)
}

fn existing_keys(connection: &Connection) -> AppResult<HashSet<(String, String)>> {
    let mut stmt = connection.prepare(&format!("SELECT address, detail FROM {TABLE}"))?;
    let rows = stmt.query_map([], |row| {
        let address: Option<String> = row.get(0)?;
        let detail: Option<String> = row.get(1)?;
        Ok(dedupe_key(
            address.as_deref().unwrap_or_default(),
            detail.as_deref(),
        ))
    })?;
    let mut keys = HashSet::new();
    for key in rows {
        keys.insert(key?);
    }
    debug!(target: "store", existing = keys.len(), "loaded existing keys");
    Ok(keys)
}

/// A store whose table was never committed reads as empty.
pub fn fetch_records(connection: &Connection) -> AppResult<Vec<StoredRecord>> {
    if SchemaState::load(connection)?.columns.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = connection.prepare(
        "SELECT id, category, submitted_category, address, detail, postal_code,
                longitude, latitude, status, report_count, resolution_method,
                created_at, updated_at
         FROM smoking_areas
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(StoredRecord {
            id: row.get(0)?,
            record: PersistedRecord {
                category: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                submitted_category: row.get(2)?,
                address: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                detail: row.get(4)?,
                postal_code: row.get(5)?,
                longitude: row.get::<_, Option<f64>>(6)?.unwrap_or(f64::NAN),
                latitude: row.get::<_, Option<f64>>(7)?.unwrap_or(f64::NAN),
                status: row
                    .get::<_, Option<String>>(8)?
                    .unwrap_or_else(|| "active".to_string()),
                report_count: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
                resolution_method: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
            },
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    })?;
    let mut records = Vec::new();
    for record in rows {
        records.push(record?);
    }
    Ok(records)
}

pub fn count_records(connection: &Connection) -> AppResult<usize> {
    if SchemaState::load(connection)?.columns.is_empty() {
        return Ok(0);
    }
    let count: i64 =
        connection.query_row(&format!("SELECT COUNT(*) FROM {TABLE}"), [], |row| row.get(0))?;
    Ok(count.max(0) as usize)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn record(address: &str, detail: Option<&str>, lat: f64, lon: f64) -> PersistedRecord {
        PersistedRecord {
            category: "공공데이타".into(),
            submitted_category: None,
            address: address.into(),
            detail: detail.map(str::to_string),
            postal_code: None,
            longitude: lon,
            latitude: lat,
            status: "active".into(),
            report_count: 0,
            resolution_method: "direct".into(),
        }
    }

    #[test]
    fn migration_is_idempotent() {
        let dir = tempdir().unwrap();
        let connection = open_store(dir.path().join("areas.db")).unwrap();

        let first = ensure_schema(&connection).unwrap();
        let second = ensure_schema(&connection).unwrap();
        assert_eq!(first, second);
        for column in ["status", "report_count", "updated_at", "resolution_method"] {
            assert!(first.contains(column), "missing {column}");
        }
    }

    #[test]
    fn migrates_legacy_table_additively() {
        let dir = tempdir().unwrap();
        let connection = open_store(dir.path().join("legacy.db")).unwrap();
        connection
            .execute_batch(
                "CREATE TABLE smoking_areas (
                    id INTEGER PRIMARY KEY,
                    category TEXT,
                    address TEXT,
                    longitude REAL,
                    latitude REAL
                );
                INSERT INTO smoking_areas (category, address, longitude, latitude)
                VALUES ('공공데이타', '서울특별시 중구 을지로 30', 126.98, 37.566);",
            )
            .unwrap();

        let state = ensure_schema(&connection).unwrap();
        assert!(state.contains("detail"));
        assert!(state.contains("created_at"));

        let stored = fetch_records(&connection).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].record.status, "active");
        assert_eq!(stored[0].record.report_count, 0);
        assert!(stored[0].created_at.is_some());
        assert!(stored[0].updated_at.is_some());
    }

    #[test]
    fn replace_writes_only_storable_records() {
        let dir = tempdir().unwrap();
        let mut connection = open_store(dir.path().join("areas.db")).unwrap();
        upsert_records(
            &mut connection,
            &[record("old row", None, 1.0, 1.0)],
            WriteMode::Replace,
        )
        .unwrap();

        let batch = vec![
            record("서울특별시 중구 을지로 30", Some("본관 옆"), 37.566, 126.98),
            record("부산광역시 중구 중앙대로 1", None, 35.1, 129.03),
            record("   ", None, 35.1, 129.03),
            record("대구광역시 중구 공평로 88", None, f64::NAN, 128.6),
        ];
        let summary = upsert_records(&mut connection, &batch, WriteMode::Replace).unwrap();
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.cleared, 1);
        assert_eq!(summary.skipped_invalid, 2);

        let stored = fetch_records(&connection).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].id, 1);
        assert!(stored
            .iter()
            .all(|row| row.record.latitude.is_finite() && row.record.longitude.is_finite()));
    }

    #[test]
    fn append_is_idempotent_and_dedupes_within_batch() {
        let dir = tempdir().unwrap();
        let mut connection = open_store(dir.path().join("areas.db")).unwrap();
        let batch = vec![
            record("City Hall", Some("Annex"), 37.5, 127.0),
            record(" city hall ", Some("annex "), 37.6, 127.1),
            record("City Hall", None, 37.5, 127.0),
        ];

        let first = upsert_records(&mut connection, &batch, WriteMode::Append).unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.skipped_duplicate, 1);

        let second = upsert_records(&mut connection, &batch, WriteMode::Append).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped_duplicate, 3);
        assert_eq!(count_records(&connection).unwrap(), 2);

        let third = upsert_records(
            &mut connection,
            &[record("Station Square", None, 37.55, 126.97)],
            WriteMode::Append,
        )
        .unwrap();
        assert_eq!(third.inserted, 1);
        let ids: Vec<i64> = fetch_records(&connection)
            .unwrap()
            .iter()
            .map(|row| row.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn empty_append_on_fresh_store_reads_as_empty() {
        let dir = tempdir().unwrap();
        let mut connection = open_store(dir.path().join("areas.db")).unwrap();

        let summary = upsert_records(&mut connection, &[], WriteMode::Append).unwrap();
        assert_eq!(summary.inserted, 0);
        assert!(SchemaState::load(&connection).unwrap().columns.is_empty());
        assert_eq!(count_records(&connection).unwrap(), 0);
        assert!(fetch_records(&connection).unwrap().is_empty());
    }

    #[test]
    fn failed_insert_rolls_back_migration() {
        let dir = tempdir().unwrap();
        let mut connection = open_store(dir.path().join("legacy.db")).unwrap();
        connection
            .execute_batch(
                "CREATE TABLE smoking_areas (
                    id INTEGER PRIMARY KEY,
                    category TEXT,
                    address TEXT,
                    longitude REAL,
                    latitude REAL
                );
                CREATE TRIGGER reject_inserts BEFORE INSERT ON smoking_areas
                BEGIN
                    SELECT RAISE(ABORT, 'inserts disabled');
                END;",
            )
            .unwrap();

        let err = upsert_records(
            &mut connection,
            &[record("City Hall", None, 37.5, 127.0)],
            WriteMode::Append,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)));

        let state = SchemaState::load(&connection).unwrap();
        assert!(state.contains("address"));
        for column in ["detail", "status", "resolution_method", "updated_at"] {
            assert!(!state.contains(column), "{column} survived rollback");
        }
        assert_eq!(count_records(&connection).unwrap(), 0);
    }

    #[test]
    fn updates_refresh_updated_at() {
        let dir = tempdir().unwrap();
        let mut connection = open_store(dir.path().join("areas.db")).unwrap();
        upsert_records(
            &mut connection,
            &[record("City Hall", None, 37.5, 127.0)],
            WriteMode::Replace,
        )
        .unwrap();
        connection
            .execute(
                "UPDATE smoking_areas SET updated_at = '2000-01-01 00:00:00' WHERE id = 1",
                [],
            )
            .unwrap();
        connection
            .execute("UPDATE smoking_areas SET report_count = 3 WHERE id = 1", [])
            .unwrap();

        let stored = fetch_records(&connection).unwrap();
        assert_eq!(stored[0].record.report_count, 3);
        assert_ne!(stored[0].updated_at.as_deref(), Some("2000-01-01 00:00:00"));
    }
}
