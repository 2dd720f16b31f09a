//! Durable Cache Tier
//!
//! Persists cache entries across process restarts. The SQLite implementation
//! opens a fresh connection per operation inside `spawn_blocking`, so the
//! store can be cloned freely and shared between workers.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;

use super::cache::{CacheEntry, CachedResponse};
use super::fingerprint::Fingerprint;

#[async_trait]
pub trait DurableCache: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>>;
    /// Keeps an existing unexpired entry; returns whichever entry is stored.
    async fn put(&self, entry: &CacheEntry) -> Result<()>;
    async fn remove(&self, fingerprint: &Fingerprint) -> Result<()>;
    /// Deletes expired rows and reports how many were removed.
    async fn purge_expired(&self) -> Result<usize>;
}

#[derive(Debug, Clone)]
pub struct SqliteCacheStore {
    db_path: PathBuf,
}

fn connect(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))?;
    Ok(conn)
}

fn millis_to_time(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow::anyhow!("timestamp {} out of range", ms))
}

impl SqliteCacheStore {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            if let Some(parent) = path_clone.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = connect(&path_clone)?;
            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS responses (
                    fingerprint TEXT PRIMARY KEY,
                    text TEXT NOT NULL,
                    model TEXT NOT NULL,
                    tokens_in INTEGER NOT NULL,
                    tokens_out INTEGER NOT NULL,
                    created_at_ms INTEGER NOT NULL,
                    expires_at_ms INTEGER NOT NULL
                );
                "#,
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_expires_at ON responses(expires_at_ms);",
                [],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(Self { db_path: path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

#[async_trait]
impl DurableCache for SqliteCacheStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let path = self.db_path.clone();
        let fp = *fingerprint;

        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            let row: Option<(String, String, i64, i64, i64, i64)> = conn
                .query_row(
                    "SELECT text, model, tokens_in, tokens_out, created_at_ms, expires_at_ms
                     FROM responses WHERE fingerprint = ?1",
                    params![fp.to_hex()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
                )
                .optional()?;

            match row {
                Some((text, model, tokens_in, tokens_out, created, expires)) => Ok(Some(CacheEntry {
                    fingerprint: fp,
                    response: CachedResponse {
                        text,
                        model,
                        tokens_in: u32::try_from(tokens_in)?,
                        tokens_out: u32::try_from(tokens_out)?,
                    },
                    created_at: millis_to_time(created)?,
                    expires_at: millis_to_time(expires)?,
                })),
                None => Ok(None),
            }
        })
        .await?
    }

    async fn put(&self, entry: &CacheEntry) -> Result<()> {
        let path = self.db_path.clone();
        let entry = entry.clone();

        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            let now = Utc::now().timestamp_millis();
            conn.execute(
                "INSERT INTO responses (fingerprint, text, model, tokens_in, tokens_out, created_at_ms, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    text = excluded.text,
                    model = excluded.model,
                    tokens_in = excluded.tokens_in,
                    tokens_out = excluded.tokens_out,
                    created_at_ms = excluded.created_at_ms,
                    expires_at_ms = excluded.expires_at_ms
                 WHERE responses.expires_at_ms <= ?8",
                params![
                    entry.fingerprint.to_hex(),
                    entry.response.text,
                    entry.response.model,
                    i64::from(entry.response.tokens_in),
                    i64::from(entry.response.tokens_out),
                    entry.created_at.timestamp_millis(),
                    entry.expires_at.timestamp_millis(),
                    now,
                ],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    async fn remove(&self, fingerprint: &Fingerprint) -> Result<()> {
        let path = self.db_path.clone();
        let key = fingerprint.to_hex();

        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            conn.execute("DELETE FROM responses WHERE fingerprint = ?1", params![key])?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    async fn purge_expired(&self) -> Result<usize> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            let removed = conn.execute(
                "DELETE FROM responses WHERE expires_at_ms <= ?1",
                params![Utc::now().timestamp_millis()],
            )?;
            Ok::<_, anyhow::Error>(removed)
        })
        .await?
    }
}
