//! Fixed-window request limits per caller, persisted in `rate_limits`.
//!
//! Counters live in the database so every server process sees the same
//! window. A caller is keyed by user id when signed in, else by client IP.

use crate::db::Db;
use crate::error::{Result, RagchatError};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

/// One named limit, e.g. `chat` allowing 8 requests per window.
#[derive(Debug, Clone)]
pub struct Limit {
    pub name: &'static str,
    pub max_requests: u32,
}

/// Requests left in the current window after an allowed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub remaining: u32,
    pub reset_in_secs: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    db: Db,
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(db: Db, window_secs: u64) -> Self {
        Self { db, window_secs }
    }

    pub async fn check(&self, limit: &Limit, caller_key: &str) -> Result<RateLimitDecision> {
        self.check_at(limit, caller_key, chrono::Utc::now().timestamp()).await
    }

    /// Count one request at `now` (unix seconds). Rejected requests are not counted.
    pub async fn check_at(&self, limit: &Limit, caller_key: &str, now: i64) -> Result<RateLimitDecision> {
        let name = limit.name;
        let max = limit.max_requests;
        let window = self.window_secs as i64;
        let key = caller_key.to_string();

        self.db
            .with_connection(move |conn| {
                // Immediate: concurrent callers queue on busy_timeout instead of failing the lock upgrade
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let existing: Option<(i64, u32)> = tx
                    .query_row(
                        "SELECT first_request_at, request_count FROM rate_limits WHERE limiter = ?1 AND caller_key = ?2",
                        params![name, key],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                let decision = match existing {
                    Some((first, count)) if now < first + window => {
                        let reset_in_secs = (first + window - now) as u64;
                        if count >= max {
                            log::warn!("Rate limit '{}' exceeded for {}", name, key);
                            return Err(RagchatError::RateLimited { retry_after_secs: reset_in_secs });
                        }
                        tx.execute(
                            "UPDATE rate_limits SET request_count = request_count + 1 WHERE limiter = ?1 AND caller_key = ?2",
                            params![name, key],
                        )?;
                        RateLimitDecision { remaining: max - count - 1, reset_in_secs }
                    }
                    _ => {
                        tx.execute(
                            "INSERT INTO rate_limits (limiter, caller_key, first_request_at, request_count, expires_at)
                             VALUES (?1, ?2, ?3, 1, ?4)
                             ON CONFLICT(limiter, caller_key) DO UPDATE SET
                                first_request_at = excluded.first_request_at,
                                request_count = 1,
                                expires_at = excluded.expires_at",
                            params![name, key, now, now + window],
                        )?;
                        RateLimitDecision { remaining: max - 1, reset_in_secs: window as u64 }
                    }
                };

                tx.commit()?;
                Ok(decision)
            })
            .await
    }

    /// Forget a caller's counter for one limit.
    pub async fn reset(&self, limit_name: &str, caller_key: &str) -> Result<()> {
        let name = limit_name.to_string();
        let key = caller_key.to_string();
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "DELETE FROM rate_limits WHERE limiter = ?1 AND caller_key = ?2",
                    params![name, key],
                )?;
                Ok(())
            })
            .await
    }
}
