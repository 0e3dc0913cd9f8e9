//! Persistence for the summary cache.
//!
//! The cache is a flat `article URL -> summary` map. Stores load the whole
//! map once and overwrite it wholesale on save; there is no partial update.

use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Key-value persistence for cached summaries.
pub trait CacheStore: Send + Sync {
    /// Read the full map. A store that was never written yields an empty map.
    fn load(&self) -> Result<HashMap<String, String>>;

    /// Replace the persisted map with `entries`.
    fn save(&self, entries: &HashMap<String, String>) -> Result<()>;

    fn clear(&self) -> Result<()> {
        self.save(&HashMap::new())
    }
}

/// Cache kept as a single JSON object on disk.
pub struct JsonCacheStore {
    path: PathBuf,
}

impl JsonCacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheStore for JsonCacheStore {
    fn load(&self) -> Result<HashMap<String, String>> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&json)?)
    }

    fn save(&self, entries: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write next to the target and rename so a crash never leaves half a file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = ?self.path, entries = entries.len(), "Summary cache saved");
        Ok(())
    }
}

/// Cache kept in an SQLite table, one row per entry.
pub struct SqliteCacheStore {
    conn: Mutex<Connection>,
}

impl SqliteCacheStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS summaries (
                url TEXT PRIMARY KEY,
                summary TEXT NOT NULL,
                cached_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_summaries_cached_at ON summaries(cached_at);
            "#,
        )?;
        Ok(())
    }

    /// When `url` was last written, as a unix timestamp.
    pub fn cached_at(&self, url: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        match conn.query_row(
            "SELECT cached_at FROM summaries WHERE url = ?1",
            [url],
            |row| row.get(0),
        ) {
            Ok(ts) => Ok(Some(ts)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl CacheStore for SqliteCacheStore {
    fn load(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let mut stmt = conn.prepare("SELECT url, summary FROM summaries")?;
        let rows = stmt.query_map([], |row| {
            let url: String = row.get(0)?;
            let summary: String = row.get(1)?;
            Ok((url, summary))
        })?;

        let mut entries = HashMap::new();
        for row in rows {
            let (url, summary) = row?;
            entries.insert(url, summary);
        }
        Ok(entries)
    }

    fn save(&self, entries: &HashMap<String, String>) -> Result<()> {
        let mut conn = self.conn.lock().expect("database mutex poisoned");
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().timestamp();
        {
            // Rows whose text is unchanged keep their original timestamp.
            let existing: HashMap<String, (String, i64)> = {
                let mut stmt = tx.prepare("SELECT url, summary, cached_at FROM summaries")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, (row.get(1)?, row.get(2)?)))
                })?;
                rows.collect::<std::result::Result<_, _>>()?
            };
            tx.execute("DELETE FROM summaries", [])?;
            let mut insert = tx.prepare(
                "INSERT INTO summaries (url, summary, cached_at) VALUES (?1, ?2, ?3)",
            )?;
            for (url, summary) in entries {
                let cached_at = match existing.get(url) {
                    Some((old, ts)) if old == summary => *ts,
                    _ => now,
                };
                insert.execute((url, summary, cached_at))?;
            }
        }
        tx.commit()?;
        tracing::debug!(entries = entries.len(), "Summary cache saved");
        Ok(())
    }
}
