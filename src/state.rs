/// Durable local state, kept in a single SQLite file.
///
/// Schema:
/// ```sql
/// CREATE TABLE kv (
///     key        TEXT PRIMARY KEY,
///     value      TEXT NOT NULL,      -- JSON
///     updated_at TEXT NOT NULL
/// );
/// CREATE TABLE history (             -- append-only, every clip ever created
///     seq        INTEGER PRIMARY KEY AUTOINCREMENT,
///     id         TEXT NOT NULL,
///     created_at TEXT NOT NULL,
///     data_type  TEXT NOT NULL,      -- "json" | "zstd"
///     data       BLOB NOT NULL
/// );
/// CREATE TABLE pending (             -- clips waiting for a connected directory
///     seq        INTEGER PRIMARY KEY AUTOINCREMENT,
///     clip_id    TEXT NOT NULL,
///     data       TEXT NOT NULL       -- JSON
/// );
/// ```
///
/// History rows are Zstd-compressed JSON (level 3); plain JSON rows are
/// accepted on read.
use std::path::Path;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::StateError;
use crate::model::Clip;

/// Keys of the `kv` table.
pub mod keys {
    pub const API_KEY: &str = "api_key";
    pub const GRANT: &str = "grant";
    pub const SELECTED_FOLDER_PATH: &str = "selected_folder_path";
    pub const PINNED_PATHS: &str = "pinned_paths";
    pub const LAST_SAVE: &str = "last_save";
    pub const LAST_DRAIN: &str = "last_drain";
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS history (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    id         TEXT NOT NULL,
    created_at TEXT NOT NULL,
    data_type  TEXT NOT NULL,
    data       BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS pending (
    seq     INTEGER PRIMARY KEY AUTOINCREMENT,
    clip_id TEXT NOT NULL,
    data    TEXT NOT NULL
);
";

const ZSTD_LEVEL: i32 = 3;
/// How long a writer waits for another process holding the file lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingClip {
    pub seq: i64,
    pub clip: Clip,
}

pub struct StateDb {
    conn: Connection,
}

impl StateDb {
    /// Open (or create) the state file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StateError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StateError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // -----------------------------------------------------------------------
    // kv
    // -----------------------------------------------------------------------

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StateError> {
        let json = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, json, now()],
        )?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), StateError> {
        self.conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // history
    // -----------------------------------------------------------------------

    pub fn append_history(&self, clip: &Clip) -> Result<(), StateError> {
        let json = serde_json::to_vec(clip)?;
        let data = zstd::encode_all(json.as_slice(), ZSTD_LEVEL)?;
        self.conn.execute(
            "INSERT INTO history (id, created_at, data_type, data) VALUES (?1, ?2, 'zstd', ?3)",
            params![clip.id, clip.created_at, data],
        )?;
        Ok(())
    }

    /// Newest first. A row that cannot be decoded is an error for that row only.
    pub fn history(&self, limit: usize) -> Result<Vec<Result<Clip, StateError>>, StateError> {
        let mut stmt = self.conn.prepare(
            "SELECT data_type, data FROM history ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(data_type, data)| -> Result<Clip, StateError> {
                let json = decompress(&data_type, &data)?;
                Ok(serde_json::from_slice::<Clip>(&json)?)
            })
            .collect())
    }

    pub fn history_len(&self) -> Result<usize, StateError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    // -----------------------------------------------------------------------
    // pending queue
    // -----------------------------------------------------------------------

    pub fn enqueue(&self, clip: &Clip) -> Result<i64, StateError> {
        let json = serde_json::to_string(clip)?;
        self.conn.execute(
            "INSERT INTO pending (clip_id, data) VALUES (?1, ?2)",
            params![clip.id, json],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Queued clips in enqueue order. Rows that no longer parse are logged
    /// and skipped.
    pub fn pending(&self) -> Result<Vec<PendingClip>, StateError> {
        read_pending(&self.conn)
    }

    /// Take every readable queued clip out of the table in one write
    /// transaction and hand it to the caller.
    ///
    /// Two processes draining the same file never receive the same row.
    /// Unreadable rows stay where they are.
    pub fn claim_pending(&self) -> Result<Vec<PendingClip>, StateError> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let claimed = read_pending(&tx)?;
        {
            let mut stmt = tx.prepare("DELETE FROM pending WHERE seq = ?1")?;
            for item in &claimed {
                stmt.execute([item.seq])?;
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    /// Put a claimed clip back under its original position.
    pub fn requeue(&self, item: &PendingClip) -> Result<(), StateError> {
        let json = serde_json::to_string(&item.clip)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO pending (seq, clip_id, data) VALUES (?1, ?2, ?3)",
            params![item.seq, item.clip.id, json],
        )?;
        Ok(())
    }

    pub fn pending_len(&self) -> Result<usize, StateError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn remove_pending(&self, seqs: &[i64]) -> Result<(), StateError> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM pending WHERE seq = ?1")?;
            for seq in seqs {
                stmt.execute([seq])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn read_pending(conn: &Connection) -> Result<Vec<PendingClip>, StateError> {
    let mut stmt = conn.prepare("SELECT seq, clip_id, data FROM pending ORDER BY seq")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .filter_map(|(seq, clip_id, data)| match serde_json::from_str(&data) {
            Ok(clip) => Some(PendingClip { seq, clip }),
            Err(e) => {
                warn!(seq, clip_id = %clip_id, error = %e, "unreadable queued clip");
                None
            }
        })
        .collect())
}

/// Decompress a history payload according to its `data_type`.
pub fn decompress(data_type: &str, raw_data: &[u8]) -> Result<Vec<u8>, StateError> {
    match data_type {
        "zstd" => Ok(zstd::decode_all(raw_data)?),
        "json" => Ok(raw_data.to_vec()),
        other => Err(StateError::UnknownDataType(other.to_string())),
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
