mod schema;

use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Clip;

const DEFAULT_HISTORY_LIMIT: i64 = 500;
const DEFAULT_MAX_CLIP_BYTES: i64 = 10_485_760;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
}

/// A persisted clip before its record is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRow {
    pub id: i64,
    pub fingerprint: String,
    pub pinned: bool,
    pub record: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub history_limit: i64,
    pub tracking_paused: bool,
    pub max_clip_bytes: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            tracking_paused: false,
            max_clip_bytes: DEFAULT_MAX_CLIP_BYTES,
        }
    }
}

pub struct Database {
    conn: Mutex<Connection>,
}

const RECORD_COLUMNS: &str = "id, fingerprint, pinned, record";

impl Database {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    pub fn new(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize(conn: &Connection) -> Result<(), DbError> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        conn.execute_batch(schema::CREATE_CLIPS_TABLE)?;
        conn.execute_batch(schema::CREATE_SETTINGS_TABLE)?;
        conn.execute_batch(schema::CREATE_INDEX_CREATED_AT)?;
        conn.execute_batch(schema::CREATE_INDEX_PINNED)?;

        conn.execute(
            "
            INSERT OR IGNORE INTO settings (id, history_limit, tracking_paused, max_clip_bytes)
            VALUES (1, ?1, 0, ?2)
            ",
            params![DEFAULT_HISTORY_LIMIT, DEFAULT_MAX_CLIP_BYTES],
        )?;

        Ok(())
    }

    /// Inserts the clip, or replaces the row holding the same fingerprint.
    /// A replaced row keeps its stored pin.
    pub fn save_clip(&self, clip: &Clip) -> Result<(), DbError> {
        let record = serde_json::to_string(clip)?;
        let conn = self.conn()?;
        conn.execute(
            "
            INSERT INTO clips (fingerprint, content, pinned, created_at, record)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(fingerprint) DO UPDATE SET
                content = excluded.content,
                pinned = clips.pinned,
                created_at = excluded.created_at,
                record = excluded.record
            ",
            params![
                clip.fingerprint(),
                clip.content(),
                if clip.pinned { 1 } else { 0 },
                sortable_timestamp(clip.timestamp()),
                record,
            ],
        )?;
        Ok(())
    }

    /// All rows, pinned first, newest first.
    pub fn list_records(&self) -> Result<Vec<RecordRow>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "
            SELECT {RECORD_COLUMNS}
            FROM clips
            ORDER BY pinned DESC, created_at DESC, id DESC
            "
        ))?;
        let rows = stmt.query_map([], record_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Rows whose content contains `query`, ignoring case. Case folding is
    /// done here since SQLite's `LOWER` only folds ASCII.
    pub fn search_records(&self, query: &str) -> Result<Vec<RecordRow>, DbError> {
        let needle = query.to_lowercase();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "
            SELECT {RECORD_COLUMNS}, content
            FROM clips
            ORDER BY pinned DESC, created_at DESC, id DESC
            "
        ))?;
        let rows = stmt.query_map([], |row| Ok((record_from_row(row)?, row.get::<_, String>(4)?)))?;

        let mut matches = Vec::new();
        for row in rows {
            let (record, content) = row?;
            if content.to_lowercase().contains(&needle) {
                matches.push(record);
            }
        }
        Ok(matches)
    }

    pub fn get_record(&self, fingerprint: &str) -> Result<Option<RecordRow>, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM clips WHERE fingerprint = ?1"),
            params![fingerprint],
            record_from_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// Returns `false` when no clip has that fingerprint.
    pub fn set_pinned(&self, fingerprint: &str, pinned: bool) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE clips SET pinned = ?1 WHERE fingerprint = ?2",
            params![if pinned { 1 } else { 0 }, fingerprint],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_clip(&self, fingerprint: &str) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM clips WHERE fingerprint = ?1", params![fingerprint])?;
        Ok(deleted > 0)
    }

    pub fn delete_unpinned(&self) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM clips WHERE pinned = 0", [])?)
    }

    pub fn get_settings(&self) -> Result<Settings, DbError> {
        let conn = self.conn()?;
        let row: (i64, i64, i64) = conn.query_row(
            "SELECT history_limit, tracking_paused, max_clip_bytes FROM settings WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(Settings {
            history_limit: row.0,
            tracking_paused: row.1 == 1,
            max_clip_bytes: row.2,
        })
    }

    pub fn update_settings(&self, settings: &Settings) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "
            UPDATE settings
            SET history_limit = ?1, tracking_paused = ?2, max_clip_bytes = ?3
            WHERE id = 1
            ",
            params![
                settings.history_limit.max(1),
                if settings.tracking_paused { 1 } else { 0 },
                settings.max_clip_bytes.max(1),
            ],
        )?;
        Ok(())
    }

    /// Deletes the oldest unpinned clips until at most `history_limit`
    /// unpinned rows remain. Pinned clips neither count nor get pruned.
    pub fn prune_excess(&self, history_limit: i64) -> Result<Vec<String>, DbError> {
        let history_limit = history_limit.max(1);
        let mut conn = self.conn()?;

        let unpinned: i64 =
            conn.query_row("SELECT COUNT(*) FROM clips WHERE pinned = 0", [], |row| row.get(0))?;
        let overflow = unpinned - history_limit;
        if overflow <= 0 {
            return Ok(Vec::new());
        }

        let victims = {
            let mut stmt = conn.prepare(
                "
                SELECT id, fingerprint
                FROM clips
                WHERE pinned = 0
                ORDER BY created_at ASC, id ASC
                LIMIT ?1
                ",
            )?;
            let rows = stmt.query_map(params![overflow], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        if victims.is_empty() {
            return Ok(Vec::new());
        }

        let tx = conn.transaction()?;
        for (id, _) in &victims {
            tx.execute("DELETE FROM clips WHERE id = ?1", params![id])?;
        }
        tx.commit()?;

        Ok(victims.into_iter().map(|(_, fingerprint)| fingerprint).collect())
    }

    #[cfg(test)]
    pub fn insert_raw(&self, fingerprint: &str, content: &str, record: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "
            INSERT INTO clips (fingerprint, content, pinned, created_at, record)
            VALUES (?1, ?2, 0, ?3, ?4)
            ",
            params![fingerprint, content, sortable_timestamp(Utc::now()), record],
        )?;
        Ok(())
    }
}

/// Fixed-width UTC text so `ORDER BY created_at` is chronological.
fn sortable_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn record_from_row(row: &Row<'_>) -> Result<RecordRow, rusqlite::Error> {
    Ok(RecordRow {
        id: row.get(0)?,
        fingerprint: row.get(1)?,
        pinned: row.get::<_, i64>(2)? == 1,
        record: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn clip_at(content: &str, minutes: i64) -> Clip {
        let base = Utc
            .with_ymd_and_hms(2025, 1, 1, 9, 0, 0)
            .single()
            .expect("timestamp");
        Clip::captured_at(content, base + Duration::minutes(minutes))
    }

    fn fingerprints(rows: &[RecordRow]) -> Vec<String> {
        rows.iter().map(|row| row.fingerprint.clone()).collect()
    }

    #[test]
    fn initializes_default_settings() {
        let db = Database::new_in_memory().expect("db");
        let settings = db.get_settings().expect("settings");
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.history_limit, 500);
        assert_eq!(settings.max_clip_bytes, 10_485_760);
    }

    #[test]
    fn updates_settings() {
        let db = Database::new_in_memory().expect("db");
        let next = Settings {
            history_limit: 3,
            tracking_paused: true,
            max_clip_bytes: 64,
        };
        db.update_settings(&next).expect("update");
        assert_eq!(db.get_settings().expect("settings"), next);
    }

    #[test]
    fn save_replaces_same_fingerprint() {
        let db = Database::new_in_memory().expect("db");
        let first = clip_at("hello", 0);
        db.save_clip(&first).expect("save");
        let mut again = clip_at("hello", 5);
        again.metadata.add_tag("text");
        db.save_clip(&again).expect("save again");

        let rows = db.list_records().expect("list");
        assert_eq!(rows.len(), 1);
        let stored: Clip = serde_json::from_str(&rows[0].record).expect("decode");
        assert_eq!(stored, again);
    }

    #[test]
    fn lists_pinned_then_newest() {
        let db = Database::new_in_memory().expect("db");
        let old = clip_at("old", 0);
        let mid = clip_at("mid", 1);
        let new = clip_at("new", 2);
        for clip in [&old, &mid, &new] {
            db.save_clip(clip).expect("save");
        }
        assert!(db.set_pinned(old.fingerprint(), true).expect("pin"));
        assert!(!db.set_pinned("missing", true).expect("pin missing"));

        let rows = db.list_records().expect("list");
        assert_eq!(
            fingerprints(&rows),
            vec![
                old.fingerprint().to_string(),
                new.fingerprint().to_string(),
                mid.fingerprint().to_string()
            ]
        );
        assert!(rows[0].pinned);
        assert!(rows[1..].iter().all(|row| !row.pinned));
    }

    #[test]
    fn search_is_case_insensitive_and_literal() {
        let db = Database::new_in_memory().expect("db");
        db.save_clip(&clip_at("Rust Notes", 0)).expect("save");
        db.save_clip(&clip_at("100% done", 1)).expect("save");
        db.save_clip(&clip_at("1000 done", 2)).expect("save");

        assert_eq!(db.search_records("rust").expect("search").len(), 1);
        let percent = db.search_records("0%").expect("search");
        assert_eq!(percent.len(), 1);
        assert_eq!(percent[0].fingerprint, clip_at("100% done", 0).fingerprint());
    }

    #[test]
    fn search_folds_non_ascii_case() {
        let db = Database::new_in_memory().expect("db");
        db.save_clip(&clip_at("Äpfel kaufen", 0)).expect("save");
        db.save_clip(&clip_at("ÉCOLE Notes", 1)).expect("save");

        assert_eq!(db.search_records("äpfel").expect("search").len(), 1);
        assert_eq!(db.search_records("école").expect("search").len(), 1);
        assert_eq!(db.search_records("KAUFEN").expect("search").len(), 1);
    }

    #[test]
    fn replacing_a_row_keeps_its_stored_pin() {
        let db = Database::new_in_memory().expect("db");
        let first = clip_at("note", 0);
        db.save_clip(&first).expect("save");
        db.set_pinned(first.fingerprint(), true).expect("pin");

        let recaptured = clip_at("note", 5);
        assert!(!recaptured.pinned);
        db.save_clip(&recaptured).expect("save again");

        let row = db.get_record(first.fingerprint()).expect("get").expect("row");
        assert!(row.pinned);
    }

    #[test]
    fn prune_keeps_pinned_clips() {
        let db = Database::new_in_memory().expect("db");
        let clips: Vec<Clip> = (0..5).map(|i| clip_at(&format!("clip {i}"), i)).collect();
        for clip in &clips {
            db.save_clip(clip).expect("save");
        }
        db.set_pinned(clips[0].fingerprint(), true).expect("pin");

        let pruned = db.prune_excess(2).expect("prune");
        assert_eq!(
            pruned,
            vec![
                clips[1].fingerprint().to_string(),
                clips[2].fingerprint().to_string()
            ]
        );
        assert!(db.get_record(clips[0].fingerprint()).expect("get").is_some());
        assert_eq!(db.list_records().expect("list").len(), 3);
        assert!(db.prune_excess(2).expect("prune again").is_empty());
    }

    #[test]
    fn deletes_by_fingerprint_and_unpinned() {
        let db = Database::new_in_memory().expect("db");
        let keep = clip_at("keep", 0);
        let gone = clip_at("gone", 1);
        let other = clip_at("other", 2);
        for clip in [&keep, &gone, &other] {
            db.save_clip(clip).expect("save");
        }
        db.set_pinned(keep.fingerprint(), true).expect("pin");

        assert!(db.delete_clip(gone.fingerprint()).expect("delete"));
        assert!(!db.delete_clip(gone.fingerprint()).expect("delete twice"));
        assert_eq!(db.delete_unpinned().expect("clear"), 1);
        assert_eq!(fingerprints(&db.list_records().expect("list")), vec![keep.fingerprint().to_string()]);
    }

    #[test]
    fn opens_file_database_and_creates_parent() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("clipstash.sqlite3");
        let db = Database::new(&path).expect("open");
        db.save_clip(&clip_at("persisted", 0)).expect("save");
        drop(db);

        let reopened = Database::new(&path).expect("reopen");
        assert_eq!(reopened.list_records().expect("list").len(), 1);
    }
}
