//! Persistent cache of completed delineations.
//!
//! A single SQLite file keyed by rounded outlet coordinates plus the request
//! flags. Six decimal places is ~0.11 m, the deliberate granularity of a
//! cache hit. Writes go through one mutex-guarded connection; puts are
//! idempotent overwrites, so two workers racing on the same miss is
//! harmless.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::models::{DelineateResponse, feature_f64};

pub const ENV_CACHE_DB: &str = "DELINEATOR_CACHE_DB";
pub const DEFAULT_CACHE_DB: &str = "./cache/watersheds.db";

/// Build the cache key for a request.
pub fn cache_key(lat: f64, lng: f64, force_low_res: bool, include_rivers: bool) -> String {
    format!(
        "{lat:.6},{lng:.6}|force_low_res={}|include_rivers={}",
        force_low_res as u8, include_rivers as u8
    )
}

pub struct WatershedCache {
    conn: Mutex<Connection>,
}

impl WatershedCache {
    /// Open (or create) the cache database at an explicit path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating cache directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening cache database {}", path.display()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS watershed_cache (
                cache_key TEXT PRIMARY KEY,
                gauge_id TEXT NOT NULL,
                response_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                lat REAL NOT NULL,
                lng REAL NOT NULL,
                area_km2 REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_watershed_cache_gauge_id
                ON watershed_cache(gauge_id);",
        )
        .context("initializing cache schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open the cache at the path named by `DELINEATOR_CACHE_DB`, defaulting
    /// to `./cache/watersheds.db`.
    pub fn open_default() -> Result<Self> {
        let path =
            std::env::var(ENV_CACHE_DB).unwrap_or_else(|_| DEFAULT_CACHE_DB.to_string());
        Self::open(&PathBuf::from(path))
    }

    /// Fetch a cached response. The stored geometry is invariant but the
    /// gauge label is not, so the caller's gauge_id replaces the stored one
    /// and the response is marked as cached.
    pub fn get(&self, key: &str, gauge_id: &str) -> Result<Option<DelineateResponse>> {
        let conn = self.conn.lock().expect("cache lock poisoned");
        let row: Option<String> = conn
            .query_row(
                "SELECT response_json FROM watershed_cache WHERE cache_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("querying cache by key")?;
        drop(conn);

        let Some(json) = row else { return Ok(None) };
        let mut response: DelineateResponse =
            serde_json::from_str(&json).context("deserializing cached response")?;
        response.gauge_id = gauge_id.to_string();
        response.cached = true;
        Ok(Some(response))
    }

    /// Fetch the most recent cached response for a gauge (export endpoint).
    pub fn get_by_gauge_id(&self, gauge_id: &str) -> Result<Option<DelineateResponse>> {
        let conn = self.conn.lock().expect("cache lock poisoned");
        let row: Option<String> = conn
            .query_row(
                "SELECT response_json FROM watershed_cache
                 WHERE gauge_id = ?1 ORDER BY created_at DESC LIMIT 1",
                params![gauge_id],
                |row| row.get(0),
            )
            .optional()
            .context("querying cache by gauge_id")?;
        drop(conn);

        let Some(json) = row else { return Ok(None) };
        let mut response: DelineateResponse =
            serde_json::from_str(&json).context("deserializing cached response")?;
        response.cached = true;
        Ok(Some(response))
    }

    /// Idempotent insert-or-replace.
    pub fn put(
        &self,
        key: &str,
        gauge_id: &str,
        lat: f64,
        lng: f64,
        response: &DelineateResponse,
    ) -> Result<()> {
        let json = serde_json::to_string(response).context("serializing response for cache")?;
        let created_at = chrono::Utc::now().to_rfc3339();
        let area_km2 = feature_f64(&response.watershed, "area_km2").unwrap_or(0.0);

        let conn = self.conn.lock().expect("cache lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO watershed_cache
             (cache_key, gauge_id, response_json, created_at, lat, lng, area_km2)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![key, gauge_id, json, created_at, lat, lng, area_km2],
        )
        .context("writing cache entry")?;
        debug!("Cached delineation for {gauge_id} under {key}");
        Ok(())
    }

    /// Remove every entry for a gauge; returns the number of rows deleted.
    pub fn delete_by_gauge_id(&self, gauge_id: &str) -> Result<usize> {
        let conn = self.conn.lock().expect("cache lock poisoned");
        let deleted = conn
            .execute(
                "DELETE FROM watershed_cache WHERE gauge_id = ?1",
                params![gauge_id],
            )
            .context("deleting cache entries")?;
        Ok(deleted)
    }

    /// Number of cached entries.
    pub fn size(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("cache lock poisoned");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM watershed_cache", [], |row| row.get(0))
            .context("counting cache entries")?;
        Ok(count as u64)
    }
}
