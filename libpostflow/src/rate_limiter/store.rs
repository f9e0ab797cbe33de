//! Shared storage behind the rate limiter
//!
//! Every mutation of one key's window goes through a single call so that
//! concurrent consumers cannot double-count. Scores are unix milliseconds.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::db::Database;
use crate::error::{DbError, Result};

/// Outcome of an atomic evict + count + conditional add
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowHit {
    /// The hit was recorded; `oldest_ms` includes the new entry
    Recorded { count_before: u32, oldest_ms: i64 },
    /// The window already held `points` entries and nothing was added
    Full { count: u32, oldest_ms: Option<i64> },
}

/// Read-only view of a key's window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowState {
    pub count: u32,
    pub oldest_ms: Option<i64>,
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Drop entries with score `<= window_start_ms`, then add `now_ms` if fewer
    /// than `points` remain. Entries expire after `ttl_ms`.
    async fn record_hit(
        &self,
        key: &str,
        now_ms: i64,
        window_start_ms: i64,
        points: u32,
        ttl_ms: i64,
    ) -> Result<WindowHit>;

    /// Entries newer than `window_start_ms`, without evicting anything
    async fn window(&self, key: &str, window_start_ms: i64) -> Result<WindowState>;

    /// Expiry of an active block on `key`
    async fn blocked_until(&self, key: &str, now_ms: i64) -> Result<Option<i64>>;

    /// Block `key` until `until_ms` and drop its window
    async fn block(&self, key: &str, until_ms: i64) -> Result<()>;

    /// Remove both the window and any block for `key`
    async fn clear(&self, key: &str) -> Result<()>;

    /// Drop expired entries and blocks across all keys
    async fn purge_expired(&self, now_ms: i64) -> Result<u64>;
}

#[derive(Debug, Default)]
struct KeyWindow {
    hits: VecDeque<i64>,
    expires_at: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    windows: HashMap<String, KeyWindow>,
    blocks: HashMap<String, i64>,
}

/// Process-local store; one lock guards every key
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn record_hit(
        &self,
        key: &str,
        now_ms: i64,
        window_start_ms: i64,
        points: u32,
        ttl_ms: i64,
    ) -> Result<WindowHit> {
        let mut state = self.lock();
        let window = state.windows.entry(key.to_string()).or_default();

        if window.expires_at <= now_ms {
            window.hits.clear();
        }
        while window.hits.front().is_some_and(|ts| *ts <= window_start_ms) {
            window.hits.pop_front();
        }

        let count = window.hits.len() as u32;
        if count >= points {
            return Ok(WindowHit::Full {
                count,
                oldest_ms: window.hits.front().copied(),
            });
        }

        window.hits.push_back(now_ms);
        window.expires_at = now_ms + ttl_ms;
        Ok(WindowHit::Recorded {
            count_before: count,
            oldest_ms: window.hits.front().copied().unwrap_or(now_ms),
        })
    }

    async fn window(&self, key: &str, window_start_ms: i64) -> Result<WindowState> {
        let state = self.lock();
        let Some(window) = state.windows.get(key) else {
            return Ok(WindowState::default());
        };

        let mut live = window.hits.iter().filter(|ts| **ts > window_start_ms);
        let oldest_ms = live.next().copied();
        let count = oldest_ms.map(|_| 1 + live.count() as u32).unwrap_or(0);
        Ok(WindowState { count, oldest_ms })
    }

    async fn blocked_until(&self, key: &str, now_ms: i64) -> Result<Option<i64>> {
        Ok(self
            .lock()
            .blocks
            .get(key)
            .copied()
            .filter(|until| *until > now_ms))
    }

    async fn block(&self, key: &str, until_ms: i64) -> Result<()> {
        let mut state = self.lock();
        state.blocks.insert(key.to_string(), until_ms);
        state.windows.remove(key);
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let mut state = self.lock();
        state.blocks.remove(key);
        state.windows.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<u64> {
        let mut state = self.lock();
        let before = state.windows.len() + state.blocks.len();
        state.windows.retain(|_, w| w.expires_at > now_ms);
        state.blocks.retain(|_, until| *until > now_ms);
        Ok((before - state.windows.len() - state.blocks.len()) as u64)
    }
}

#[async_trait]
impl RateLimitStore for Database {
    async fn record_hit(
        &self,
        key: &str,
        now_ms: i64,
        window_start_ms: i64,
        points: u32,
        ttl_ms: i64,
    ) -> Result<WindowHit> {
        // The first statement is a write, so the transaction holds the
        // database write lock before it counts anything
        let mut tx = self.pool().begin().await.map_err(DbError::SqlxError)?;

        sqlx::query("DELETE FROM rate_limit_hits WHERE key = ? AND (ts <= ? OR expires_at <= ?)")
            .bind(key)
            .bind(window_start_ms)
            .bind(now_ms)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        let (count, oldest_ms) = sqlx::query_as::<_, (i64, Option<i64>)>(
            "SELECT COUNT(*), MIN(ts) FROM rate_limit_hits WHERE key = ?",
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let count = count as u32;
        if count >= points {
            tx.commit().await.map_err(DbError::SqlxError)?;
            return Ok(WindowHit::Full { count, oldest_ms });
        }

        sqlx::query("INSERT INTO rate_limit_hits (key, ts, expires_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(now_ms)
            .bind(now_ms + ttl_ms)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;

        Ok(WindowHit::Recorded {
            count_before: count,
            oldest_ms: oldest_ms.unwrap_or(now_ms),
        })
    }

    async fn window(&self, key: &str, window_start_ms: i64) -> Result<WindowState> {
        let (count, oldest_ms) = sqlx::query_as::<_, (i64, Option<i64>)>(
            "SELECT COUNT(*), MIN(ts) FROM rate_limit_hits WHERE key = ? AND ts > ?",
        )
        .bind(key)
        .bind(window_start_ms)
        .fetch_one(self.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(WindowState {
            count: count as u32,
            oldest_ms,
        })
    }

    async fn blocked_until(&self, key: &str, now_ms: i64) -> Result<Option<i64>> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT blocked_until FROM rate_limit_blocks WHERE key = ? AND blocked_until > ?",
        )
        .bind(key)
        .bind(now_ms)
        .fetch_optional(self.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| r.0))
    }

    async fn block(&self, key: &str, until_ms: i64) -> Result<()> {
        let mut tx = self.pool().begin().await.map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            INSERT INTO rate_limit_blocks (key, blocked_until) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET blocked_until = excluded.blocked_until
            "#,
        )
        .bind(key)
        .bind(until_ms)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        sqlx::query("DELETE FROM rate_limit_hits WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let mut tx = self.pool().begin().await.map_err(DbError::SqlxError)?;

        sqlx::query("DELETE FROM rate_limit_blocks WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::query("DELETE FROM rate_limit_hits WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<u64> {
        let hits = sqlx::query("DELETE FROM rate_limit_hits WHERE expires_at <= ?")
            .bind(now_ms)
            .execute(self.pool())
            .await
            .map_err(DbError::SqlxError)?;

        let blocks = sqlx::query("DELETE FROM rate_limit_blocks WHERE blocked_until <= ?")
            .bind(now_ms)
            .execute(self.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(hits.rows_affected() + blocks.rows_affected())
    }
}
