//! Persisted answers and reader feedback (likes and votes).

use crate::db::Db;
use crate::error::{Result, RagchatError};
use crate::llm::ChatMessage;
use crate::retrieval::SourceDocument;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

/// Upper bound on ids accepted by the batch lookups.
pub const MAX_BATCH_IDS: usize = 100;

/// An answer ready to be stored.
#[derive(Debug, Clone)]
pub struct NewAnswer {
    pub question: String,
    pub answer: String,
    pub sources: Vec<SourceDocument>,
    pub history: Vec<ChatMessage>,
    pub collection: Option<String>,
    pub model: String,
    pub client_ip: Option<String>,
    pub user_id: Option<String>,
    /// Drew on a private library; hidden from callers without access.
    pub restricted: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub sources: Vec<SourceDocument>,
    pub history: Vec<ChatMessage>,
    pub collection: Option<String>,
    pub model: String,
    pub like_count: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub restricted: bool,
}

const ANSWER_COLUMNS: &str =
    "answer_id, question, answer, sources_json, history_json, collection, model, like_count, created_at, restricted";

impl Answer {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let sources: String = row.get(3)?;
        let history: String = row.get(4)?;
        Ok(Self {
            id: row.get(0)?,
            question: row.get(1)?,
            answer: row.get(2)?,
            sources: serde_json::from_str(&sources).unwrap_or_default(),
            history: serde_json::from_str(&history).unwrap_or_default(),
            collection: row.get(5)?,
            model: row.get(6)?,
            like_count: row.get(7)?,
            timestamp: Utc.timestamp_opt(row.get(8)?, 0).single().unwrap_or_default(),
            restricted: row.get(9)?,
        })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn check_batch(ids: &[String]) -> Result<()> {
    if ids.len() > MAX_BATCH_IDS {
        return Err(RagchatError::InvalidInput(format!(
            "At most {} ids may be requested at once",
            MAX_BATCH_IDS
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct AnswerStore {
    db: Db,
}

impl AnswerStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Store an answer and return its id.
    pub async fn save(&self, answer: NewAnswer) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let answer_id = id.clone();
        let sources = serde_json::to_string(&answer.sources).unwrap_or_else(|_| "[]".to_string());
        let history = serde_json::to_string(&answer.history).unwrap_or_else(|_| "[]".to_string());

        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO answers (answer_id, question, answer, sources_json, history_json, collection,
                                          model, client_ip, user_id, like_count, created_at, restricted)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11)",
                    params![
                        answer_id,
                        answer.question,
                        answer.answer,
                        sources,
                        history,
                        answer.collection,
                        answer.model,
                        answer.client_ip,
                        answer.user_id,
                        Utc::now().timestamp(),
                        answer.restricted,
                    ],
                )?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// Fetch one answer. Restricted answers look missing unless `include_restricted`.
    pub async fn get(&self, id: &str, include_restricted: bool) -> Result<Answer> {
        let id = id.to_string();
        self.db
            .with_connection(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM answers WHERE answer_id = ?1 AND (restricted = 0 OR ?2)",
                        ANSWER_COLUMNS
                    ),
                    params![id, include_restricted],
                    Answer::from_row,
                )
                .optional()?
                .ok_or_else(|| RagchatError::NotFound(format!("Answer {} not found", id)))
            })
            .await
    }

    /// Fetch several answers; unknown (or hidden) ids are skipped. Order follows `ids`.
    pub async fn get_many(&self, ids: &[String], include_restricted: bool) -> Result<Vec<Answer>> {
        check_batch(ids)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids.to_vec();
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {} FROM answers WHERE answer_id IN ({})",
                    ANSWER_COLUMNS,
                    placeholders(ids.len())
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut found = stmt
                    .query_map(params_from_iter(ids.iter()), Answer::from_row)?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
                found.retain(|a| include_restricted || !a.restricted);
                found.sort_by_key(|a| ids.iter().position(|id| *id == a.id));
                Ok(found)
            })
            .await
    }

    pub async fn recent(&self, limit: usize, include_restricted: bool) -> Result<Vec<Answer>> {
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM answers WHERE restricted = 0 OR ?2
                     ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                    ANSWER_COLUMNS
                ))?;
                let answers = stmt
                    .query_map(params![limit as i64, include_restricted], Answer::from_row)?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
                Ok(answers)
            })
            .await
    }

    /// Remove an answer with its likes and votes.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.db
            .with_connection(move |conn| {
                let deleted = conn.execute("DELETE FROM answers WHERE answer_id = ?1", params![id])?;
                if deleted == 0 {
                    return Err(RagchatError::NotFound(format!("Answer {} not found", id)));
                }
                Ok(())
            })
            .await
    }

    /// Set or clear a like. Idempotent; returns the updated like count.
    pub async fn set_like(&self, answer_id: &str, user_key: &str, liked: bool) -> Result<i64> {
        let answer_id = answer_id.to_string();
        let user_key = user_key.to_string();
        self.db
            .with_connection(move |conn| {
                // Take the write lock up front; a deferred read lock cannot be upgraded under contention
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let exists: bool = tx
                    .query_row("SELECT 1 FROM answers WHERE answer_id = ?1", params![answer_id], |_| Ok(true))
                    .optional()?
                    .unwrap_or(false);
                if !exists {
                    return Err(RagchatError::NotFound(format!("Answer {} not found", answer_id)));
                }

                let changed = if liked {
                    tx.execute(
                        "INSERT OR IGNORE INTO answer_likes (answer_id, user_key, created_at) VALUES (?1, ?2, ?3)",
                        params![answer_id, user_key, Utc::now().timestamp()],
                    )?
                } else {
                    tx.execute(
                        "DELETE FROM answer_likes WHERE answer_id = ?1 AND user_key = ?2",
                        params![answer_id, user_key],
                    )?
                };
                if changed > 0 {
                    let delta: i64 = if liked { 1 } else { -1 };
                    tx.execute(
                        "UPDATE answers SET like_count = MAX(like_count + ?1, 0) WHERE answer_id = ?2",
                        params![delta, answer_id],
                    )?;
                }

                let count: i64 = tx.query_row(
                    "SELECT like_count FROM answers WHERE answer_id = ?1",
                    params![answer_id],
                    |row| row.get(0),
                )?;
                tx.commit()?;
                Ok(count)
            })
            .await
    }

    /// Which of `ids` the caller has liked.
    pub async fn liked_by(&self, user_key: &str, ids: &[String]) -> Result<Vec<String>> {
        check_batch(ids)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let user_key = user_key.to_string();
        let ids = ids.to_vec();
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT answer_id FROM answer_likes WHERE user_key = ? AND answer_id IN ({})",
                    placeholders(ids.len())
                );
                let mut stmt = conn.prepare(&sql)?;
                let params = std::iter::once(&user_key).chain(ids.iter());
                let liked: HashSet<String> = stmt
                    .query_map(params_from_iter(params), |row| row.get(0))?
                    .collect::<std::result::Result<_, rusqlite::Error>>()?;
                Ok(ids.into_iter().filter(|id| liked.contains(id)).collect())
            })
            .await
    }

    /// Record a helpfulness vote (-1, 0 to clear, +1) for admin review.
    pub async fn vote(&self, answer_id: &str, user_key: &str, vote: i8) -> Result<()> {
        if !(-1..=1).contains(&vote) {
            return Err(RagchatError::InvalidInput("Vote must be -1, 0 or 1".to_string()));
        }
        let answer_id = answer_id.to_string();
        let user_key = user_key.to_string();
        self.db
            .with_connection(move |conn| {
                let result = conn.execute(
                    "INSERT INTO answer_votes (answer_id, vote, user_key, updated_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(answer_id) DO UPDATE SET vote = excluded.vote, user_key = excluded.user_key,
                                                          updated_at = excluded.updated_at",
                    params![answer_id, vote, user_key, Utc::now().timestamp()],
                );
                match result {
                    Ok(_) => Ok(()),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Err(RagchatError::NotFound(format!("Answer {} not found", answer_id)))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    pub async fn get_vote(&self, answer_id: &str) -> Result<Option<i8>> {
        let answer_id = answer_id.to_string();
        self.db
            .with_connection(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT vote FROM answer_votes WHERE answer_id = ?1",
                        params![answer_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await
    }
}
