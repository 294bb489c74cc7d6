//! Ledger trait and SQLite implementation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema;
use super::types::{AssetRecord, LedgerSummary, RunTrigger, SyncRunStats};
use crate::media::AssetState;
use crate::types::MediaKind;

const KEY_APPLIED_VERSION: &str = "applied_version";
const KEY_FAILURE_STREAK: &str = "failure_streak";

const ASSET_COLUMNS: &str = "filename, checksum, kind, state, size_bytes, verified_at, last_seen_at, download_attempts, last_error";

/// Persistent record of what the engine knows about the cache.
///
/// Object-safe, shared as `Arc<dyn StateDb>`.
#[async_trait]
pub trait StateDb: Send + Sync {
    /// Replace the asset table with the classification of the current
    /// manifest. Rows for assets no longer referenced are dropped; download
    /// history of the remaining ones is kept.
    async fn record_assets(&self, records: &[AssetRecord]) -> Result<(), StateError>;

    /// Mark freshly downloaded assets valid, with their sizes.
    async fn mark_valid_batch(&self, items: &[(String, u64)]) -> Result<(), StateError>;

    /// Mark assets failed with an error message.
    async fn mark_failed_batch(&self, items: &[(String, String)]) -> Result<(), StateError>;

    async fn get_assets(&self) -> Result<Vec<AssetRecord>, StateError>;

    async fn get_failed(&self) -> Result<Vec<AssetRecord>, StateError>;

    /// Forget every asset. Returns the number of rows removed.
    async fn clear_assets(&self) -> Result<u64, StateError>;

    async fn start_sync_run(&self, trigger: RunTrigger) -> Result<i64, StateError>;

    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats) -> Result<(), StateError>;

    /// Manifest version the published bundle reflects, if any.
    async fn applied_version(&self) -> Result<Option<i64>, StateError>;

    async fn set_applied_version(&self, version: Option<i64>) -> Result<(), StateError>;

    /// Consecutive sessions that ended with failed downloads.
    async fn failure_streak(&self) -> Result<u32, StateError>;

    async fn set_failure_streak(&self, streak: u32) -> Result<(), StateError>;

    async fn get_summary(&self) -> Result<LedgerSummary, StateError>;
}

/// SQLite implementation of the ledger.
pub struct SqliteStateDb {
    /// rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateDb")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStateDb {
    /// Open or create the ledger at `path`.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;
            schema::migrate(&conn)?;
            Ok::<_, StateError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }
}

/// Run `body` inside a transaction, rolling back on error.
fn in_transaction<T>(
    conn: &Connection,
    body: impl FnOnce() -> Result<T, StateError>,
) -> Result<T, StateError> {
    conn.execute("BEGIN TRANSACTION", [])
        .map_err(StateError::query)?;
    match body() {
        Ok(value) => {
            conn.execute("COMMIT", []).map_err(StateError::query)?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(e)
        }
    }
}

fn get_value(conn: &Connection, key: &str) -> Result<Option<String>, StateError> {
    conn.query_row(
        "SELECT value FROM engine_state WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
    .map_err(StateError::query)
}

fn set_value(conn: &Connection, key: &str, value: Option<&str>) -> Result<(), StateError> {
    match value {
        Some(value) => conn.execute(
            "INSERT INTO engine_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        ),
        None => conn.execute("DELETE FROM engine_state WHERE key = ?1", [key]),
    }
    .map_err(StateError::query)?;
    Ok(())
}

fn count(conn: &Connection, sql: &str) -> Result<u64, StateError> {
    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
        .map(|n| n as u64)
        .map_err(StateError::query)
}

fn query_assets(conn: &Connection, filter: &str) -> Result<Vec<AssetRecord>, StateError> {
    let sql = format!("SELECT {ASSET_COLUMNS} FROM media_assets {filter} ORDER BY filename");
    let mut stmt = conn.prepare(&sql).map_err(StateError::query)?;
    let records = stmt
        .query_map([], |row| Ok(row_to_asset_record(row)))
        .map_err(StateError::query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(StateError::query)?;
    Ok(records)
}

fn timestamp(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

#[async_trait]
impl StateDb for SqliteStateDb {
    async fn record_assets(&self, records: &[AssetRecord]) -> Result<(), StateError> {
        let conn = self.lock()?;
        let now = Utc::now().timestamp();

        in_transaction(&conn, || {
            let mut upsert = conn
                .prepare_cached(
                    r#"
                    INSERT INTO media_assets (filename, checksum, kind, state, last_seen_at, verified_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, CASE WHEN ?4 = 'valid' THEN ?5 END)
                    ON CONFLICT(filename) DO UPDATE SET
                        checksum = excluded.checksum,
                        kind = excluded.kind,
                        state = excluded.state,
                        last_seen_at = excluded.last_seen_at,
                        verified_at = COALESCE(excluded.verified_at, media_assets.verified_at)
                    "#,
                )
                .map_err(StateError::query)?;
            for record in records {
                upsert
                    .execute(rusqlite::params![
                        record.filename,
                        record.checksum,
                        kind_str(record.kind),
                        record.state.as_str(),
                        now,
                    ])
                    .map_err(StateError::query)?;
            }

            let current: HashSet<&str> = records.iter().map(|r| r.filename.as_str()).collect();
            let mut names = conn
                .prepare_cached("SELECT filename FROM media_assets")
                .map_err(StateError::query)?;
            let stale: Vec<String> = names
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(StateError::query)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StateError::query)?
                .into_iter()
                .filter(|name| !current.contains(name.as_str()))
                .collect();
            let mut delete = conn
                .prepare_cached("DELETE FROM media_assets WHERE filename = ?1")
                .map_err(StateError::query)?;
            for name in &stale {
                delete.execute([name]).map_err(StateError::query)?;
            }
            if !stale.is_empty() {
                tracing::debug!(removed = stale.len(), "Dropped assets no longer in manifest");
            }
            Ok(())
        })
    }

    async fn mark_valid_batch(&self, items: &[(String, u64)]) -> Result<(), StateError> {
        if items.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        let now = Utc::now().timestamp();

        in_transaction(&conn, || {
            let mut stmt = conn
                .prepare_cached(
                    "UPDATE media_assets SET state = 'valid', size_bytes = ?1, verified_at = ?2, download_attempts = download_attempts + 1, last_error = NULL WHERE filename = ?3",
                )
                .map_err(StateError::query)?;
            for (filename, size) in items {
                stmt.execute(rusqlite::params![*size as i64, now, filename])
                    .map_err(StateError::query)?;
            }
            Ok(())
        })
    }

    async fn mark_failed_batch(&self, items: &[(String, String)]) -> Result<(), StateError> {
        if items.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;

        in_transaction(&conn, || {
            let mut stmt = conn
                .prepare_cached(
                    "UPDATE media_assets SET state = 'failed', download_attempts = download_attempts + 1, last_error = ?1 WHERE filename = ?2",
                )
                .map_err(StateError::query)?;
            for (filename, error) in items {
                stmt.execute(rusqlite::params![error, filename])
                    .map_err(StateError::query)?;
            }
            Ok(())
        })
    }

    async fn get_assets(&self) -> Result<Vec<AssetRecord>, StateError> {
        let conn = self.lock()?;
        query_assets(&conn, "")
    }

    async fn get_failed(&self) -> Result<Vec<AssetRecord>, StateError> {
        let conn = self.lock()?;
        query_assets(&conn, "WHERE state = 'failed'")
    }

    async fn clear_assets(&self) -> Result<u64, StateError> {
        let conn = self.lock()?;
        let rows = conn
            .execute("DELETE FROM media_assets", [])
            .map_err(StateError::query)?;
        Ok(rows as u64)
    }

    async fn start_sync_run(&self, trigger: RunTrigger) -> Result<i64, StateError> {
        let started_at = Utc::now().timestamp();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_runs (started_at, trigger) VALUES (?1, ?2)",
            rusqlite::params![started_at, trigger.as_str()],
        )
        .map_err(StateError::query)?;
        Ok(conn.last_insert_rowid())
    }

    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats) -> Result<(), StateError> {
        let completed_at = Utc::now().timestamp();
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1, modified_on = ?2, assets_seen = ?3, assets_downloaded = ?4, assets_failed = ?5, bundle_generation = ?6, outcome = ?7 WHERE id = ?8",
            rusqlite::params![
                completed_at,
                stats.modified_on,
                stats.assets_seen as i64,
                stats.assets_downloaded as i64,
                stats.assets_failed as i64,
                stats.bundle_generation,
                stats.outcome,
                run_id
            ],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn applied_version(&self) -> Result<Option<i64>, StateError> {
        let conn = self.lock()?;
        Ok(get_value(&conn, KEY_APPLIED_VERSION)?.and_then(|v| v.parse().ok()))
    }

    async fn set_applied_version(&self, version: Option<i64>) -> Result<(), StateError> {
        let conn = self.lock()?;
        let value = version.map(|v| v.to_string());
        set_value(&conn, KEY_APPLIED_VERSION, value.as_deref())
    }

    async fn failure_streak(&self) -> Result<u32, StateError> {
        let conn = self.lock()?;
        Ok(get_value(&conn, KEY_FAILURE_STREAK)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn set_failure_streak(&self, streak: u32) -> Result<(), StateError> {
        let conn = self.lock()?;
        let value = streak.to_string();
        set_value(&conn, KEY_FAILURE_STREAK, Some(value.as_str()))
    }

    async fn get_summary(&self) -> Result<LedgerSummary, StateError> {
        let conn = self.lock()?;

        let total_assets = count(&conn, "SELECT COUNT(*) FROM media_assets")?;
        let valid = count(
            &conn,
            "SELECT COUNT(*) FROM media_assets WHERE state = 'valid'",
        )?;
        let failed = count(
            &conn,
            "SELECT COUNT(*) FROM media_assets WHERE state = 'failed'",
        )?;

        let last_run: Option<(Option<i64>, Option<i64>, Option<String>)> = conn
            .query_row(
                "SELECT started_at, completed_at, outcome FROM sync_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(StateError::query)?;
        let (started, completed, last_outcome) = last_run.unwrap_or((None, None, None));

        Ok(LedgerSummary {
            total_assets,
            valid,
            failed,
            applied_version: get_value(&conn, KEY_APPLIED_VERSION)?.and_then(|v| v.parse().ok()),
            failure_streak: get_value(&conn, KEY_FAILURE_STREAK)?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            last_sync_started: timestamp(started),
            last_sync_completed: timestamp(completed),
            last_outcome,
        })
    }
}

fn kind_str(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "image",
        MediaKind::Video => "video",
    }
}

fn row_to_asset_record(row: &rusqlite::Row<'_>) -> AssetRecord {
    let filename: String = row.get(0).unwrap_or_default();
    let checksum: String = row.get(1).unwrap_or_default();
    let kind: String = row.get(2).unwrap_or_default();
    let state: String = row.get(3).unwrap_or_default();
    let size_bytes = row.get::<_, Option<i64>>(4).ok().flatten();
    let verified_at = row.get::<_, Option<i64>>(5).ok().flatten();
    let last_seen_at: i64 = row.get(6).unwrap_or(0);
    let download_attempts: i64 = row.get(7).unwrap_or(0);
    let last_error = row.get::<_, Option<String>>(8).ok().flatten();

    AssetRecord {
        filename,
        checksum,
        kind: if kind == "video" {
            MediaKind::Video
        } else {
            MediaKind::Image
        },
        state: AssetState::from_str(&state).unwrap_or(AssetState::Unknown),
        size_bytes: size_bytes.map(|n| n as u64),
        verified_at: timestamp(verified_at),
        last_seen_at: timestamp(Some(last_seen_at)).unwrap_or(DateTime::UNIX_EPOCH),
        download_attempts: download_attempts as u32,
        last_error,
    }
}
