//! Audit trail for account, moderation and abuse events.

use crate::db::Db;
use crate::error::Result;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

/// Audit rows are kept for a year.
const RETENTION_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    LoginRequested,
    LoginVerified,
    InviteCreated,
    InviteAccepted,
    InviteRevoked,
    AnswerDeleted,
    RateLimitExceeded,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::LoginRequested => "login_requested",
            AuditAction::LoginVerified => "login_verified",
            AuditAction::InviteCreated => "invite_created",
            AuditAction::InviteAccepted => "invite_accepted",
            AuditAction::InviteRevoked => "invite_revoked",
            AuditAction::AnswerDeleted => "answer_deleted",
            AuditAction::RateLimitExceeded => "rate_limit_exceeded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub actor: Option<String>,
    pub target: Option<String>,
    pub success: bool,
    pub client_ip: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(action: AuditAction) -> Self {
        Self {
            action,
            actor: None,
            target: None,
            success: true,
            client_ip: None,
            details: None,
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }

    pub fn client_ip(mut self, ip: Option<String>) -> Self {
        self.client_ip = ip;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// A stored audit row as returned to superusers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub event_id: String,
    pub created_at: DateTime<Utc>,
    pub action: String,
    pub actor: Option<String>,
    pub target: Option<String>,
    pub outcome: String,
    pub client_ip: Option<String>,
    pub details: Option<serde_json::Value>,
}

/// Write an audit event. Returns the generated event id.
pub async fn log_event(db: &Db, event: AuditEvent) -> Result<String> {
    let event_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let expires_at = now + chrono::Duration::days(RETENTION_DAYS);
    let id = event_id.clone();

    db.with_connection(move |conn| {
        conn.execute(
            r#"
            INSERT INTO audit_log (
                event_id, created_at, action, actor, target,
                outcome, client_ip, details_json, expires_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                id,
                now.timestamp(),
                event.action.as_str(),
                event.actor,
                event.target,
                if event.success { "success" } else { "failure" },
                event.client_ip,
                event.details.map(|d| d.to_string()),
                expires_at.timestamp(),
            ],
        )?;
        Ok(())
    })
    .await?;

    Ok(event_id)
}

/// Record an event without letting an audit failure break the request.
pub async fn record(db: &Db, event: AuditEvent) {
    let action = event.action;
    if let Err(e) = log_event(db, event).await {
        log::error!("Failed to write audit event {}: {}", action.as_str(), e);
    }
}

/// Most recent entries first.
pub async fn recent(db: &Db, limit: usize) -> Result<Vec<AuditEntry>> {
    db.with_connection(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT event_id, created_at, action, actor, target, outcome, client_ip, details_json
             FROM audit_log ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit as i64], |row| {
                let details: Option<String> = row.get(7)?;
                Ok(AuditEntry {
                    event_id: row.get(0)?,
                    created_at: Utc.timestamp_opt(row.get(1)?, 0).single().unwrap_or_default(),
                    action: row.get(2)?,
                    actor: row.get(3)?,
                    target: row.get(4)?,
                    outcome: row.get(5)?,
                    client_ip: row.get(6)?,
                    details: details.and_then(|d| serde_json::from_str(&d).ok()),
                })
            })?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        Ok(entries)
    })
    .await
}
