pub mod models;
pub mod queries;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Station {id} not found")]
    StationNotFound { id: i64 },
}

pub type Result<T> = std::result::Result<T, DbError>;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL mode so digest jobs and interactive paging can read concurrently
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version > SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "database schema v{version} is newer than this build (v{SCHEMA_VERSION})"
            )));
        }
        if version < 1 {
            self.migrate_v1()?;
        }

        self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// V1: stations, recordings, tracks, track tags
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS stations (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id    INTEGER NOT NULL,
                name        TEXT NOT NULL,
                lat         REAL NOT NULL,
                lng         REAL NOT NULL,
                active_at   INTEGER NOT NULL,
                retired_at  INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_stations_group ON stations(group_id, active_at);

            CREATE TABLE IF NOT EXISTS recordings (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id    INTEGER NOT NULL,
                group_id     INTEGER NOT NULL,
                -- Written once at ingestion, never reassigned here
                station_id   INTEGER REFERENCES stations(id),
                recorded_at  INTEGER NOT NULL,
                duration     REAL NOT NULL,
                lat          REAL,
                lng          REAL,
                created_at   TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_recordings_station_time ON recordings(station_id, recorded_at);
            CREATE INDEX IF NOT EXISTS idx_recordings_group_time ON recordings(group_id, recorded_at);
            CREATE INDEX IF NOT EXISTS idx_recordings_time ON recordings(recorded_at);

            CREATE TABLE IF NOT EXISTS tracks (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                recording_id  INTEGER NOT NULL REFERENCES recordings(id) ON DELETE CASCADE,
                start_s       REAL NOT NULL,
                end_s         REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tracks_recording ON tracks(recording_id);

            CREATE TABLE IF NOT EXISTS track_tags (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                track_id    INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
                label       TEXT NOT NULL,
                automatic   INTEGER NOT NULL DEFAULT 0,
                model       TEXT,
                user_id     TEXT,
                path        TEXT,
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_tags_track ON track_tags(track_id);
            ",
        )?;
        Ok(())
    }
}

const SCHEMA_VERSION: i32 = 1;

/// Recording and station times are stored as Unix seconds.
pub(crate) fn to_secs(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

/// Read a Unix-seconds column back into a UTC timestamp.
pub(crate) fn column_time(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

pub(crate) fn column_time_opt(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let secs: Option<i64> = row.get(idx)?;
    secs.map(|s| DateTime::from_timestamp(s, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, s)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_sets_user_version() {
        let db = Database::open_in_memory().unwrap();
        let version: i32 = db
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let tables: i64 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('stations', 'recordings', 'tracks', 'track_tags')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn test_rejects_newer_schema() {
        let db = Database::open_in_memory().unwrap();
        db.conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        assert!(matches!(db.migrate(), Err(DbError::Migration(_))));
    }
}
