use crate::auth::{InviteStatus, Role};
use crate::db::Db;
use crate::error::{Result, RagchatError};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const PURPOSE_LOGIN: &str = "login";
const PURPOSE_INVITE: &str = "invite";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    pub email: String,
    pub role: Role,
    pub invite_status: InviteStatus,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

impl User {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let role: String = row.get(2)?;
        let status: String = row.get(3)?;
        Ok(Self {
            user_id: row.get(0)?,
            email: row.get(1)?,
            role: Role::parse(&role).unwrap_or(Role::User),
            invite_status: InviteStatus::parse(&status).unwrap_or(InviteStatus::Revoked),
            created_at: timestamp(row.get(4)?),
            last_login_at: row.get::<_, Option<i64>>(5)?.map(timestamp),
        })
    }
}

const USER_COLUMNS: &str = "user_id, email, role, invite_status, created_at, last_login_at";

fn find_by_email(conn: &Connection, email: &str) -> Result<Option<User>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS),
            params![email],
            User::from_row,
        )
        .optional()?)
}

/// 32 random bytes from two v4 UUIDs, URL-safe encoded.
fn random_token() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Only the SHA-256 of a one-time token is stored.
fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

fn store_token(conn: &Connection, user_id: &str, purpose: &str, ttl: chrono::Duration) -> Result<String> {
    let token = random_token();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO login_tokens (token_hash, user_id, purpose, created_at, expires_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![hash_token(&token), user_id, purpose, now.timestamp(), (now + ttl).timestamp()],
    )?;
    Ok(token)
}

/// Delete the matching unexpired token. Fails with Unauthorized when there is none.
fn consume_token(conn: &Connection, user_id: &str, purpose: &str, token: &str) -> Result<()> {
    let deleted = conn.execute(
        "DELETE FROM login_tokens WHERE token_hash = ?1 AND user_id = ?2 AND purpose = ?3 AND expires_at > ?4",
        params![hash_token(token), user_id, purpose, Utc::now().timestamp()],
    )?;
    if deleted == 0 {
        return Err(RagchatError::Unauthorized("Invalid or expired link".to_string()));
    }
    Ok(())
}

/// User accounts and their one-time tokens.
#[derive(Clone)]
pub struct AccountStore {
    db: Db,
}

impl AccountStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<User>> {
        let user_id = user_id.to_string();
        self.db
            .with_connection(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {} FROM users WHERE user_id = ?1", USER_COLUMNS),
                        params![user_id],
                        User::from_row,
                    )
                    .optional()?)
            })
            .await
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = email.to_string();
        self.db.with_connection(move |conn| find_by_email(conn, &email)).await
    }

    /// Create (or promote) an active account without an invite. Used to seed the first superuser.
    pub async fn bootstrap(&self, email: &str, role: Role) -> Result<User> {
        let email = crate::auth::normalize_email(email)?;
        self.db
            .with_connection(move |conn| {
                let now = Utc::now().timestamp();
                conn.execute(
                    "INSERT INTO users (user_id, email, role, invite_status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'accepted', ?4, ?4)
                     ON CONFLICT(email) DO UPDATE SET role = excluded.role, invite_status = 'accepted', updated_at = excluded.updated_at",
                    params![Uuid::new_v4().to_string(), email, role.as_str(), now],
                )?;
                find_by_email(conn, &email)?
                    .ok_or_else(|| RagchatError::NotFound(format!("user {}", email)))
            })
            .await
    }

    /// Issue a login token for an accepted account; None otherwise.
    pub async fn create_login_token(&self, email: &str, ttl: chrono::Duration) -> Result<Option<String>> {
        let email = email.to_string();
        self.db
            .with_connection(move |conn| {
                match find_by_email(conn, &email)? {
                    Some(user) if user.invite_status == InviteStatus::Accepted => {
                        Ok(Some(store_token(conn, &user.user_id, PURPOSE_LOGIN, ttl)?))
                    }
                    _ => Ok(None),
                }
            })
            .await
    }

    pub async fn consume_login_token(&self, email: &str, token: &str) -> Result<User> {
        let email = email.to_string();
        let token = token.to_string();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let user = find_by_email(&tx, &email)?
                    .filter(|u| u.invite_status == InviteStatus::Accepted)
                    .ok_or_else(|| RagchatError::Unauthorized("Invalid or expired link".to_string()))?;
                consume_token(&tx, &user.user_id, PURPOSE_LOGIN, &token)?;
                let now = Utc::now().timestamp();
                tx.execute(
                    "UPDATE users SET last_login_at = ?1, updated_at = ?1 WHERE user_id = ?2",
                    params![now, user.user_id],
                )?;
                tx.commit()?;
                Ok(User {
                    last_login_at: Some(timestamp(now)),
                    ..user
                })
            })
            .await
    }

    /// Create or refresh a pending account and hand back a fresh invite token.
    /// Previously issued invite tokens for the address stop working.
    pub async fn create_invite(
        &self,
        email: &str,
        role: Role,
        invited_by: &str,
        ttl: chrono::Duration,
    ) -> Result<(User, String)> {
        let email = email.to_string();
        let invited_by = invited_by.to_string();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now = Utc::now().timestamp();

                let user_id = match find_by_email(&tx, &email)? {
                    Some(user) if user.invite_status == InviteStatus::Accepted => {
                        return Err(RagchatError::Conflict(format!("{} already has an active account", email)));
                    }
                    Some(user) => {
                        tx.execute(
                            "UPDATE users SET role = ?1, invite_status = 'pending', invited_by = ?2, updated_at = ?3 WHERE user_id = ?4",
                            params![role.as_str(), invited_by, now, user.user_id],
                        )?;
                        tx.execute(
                            "DELETE FROM login_tokens WHERE user_id = ?1 AND purpose = ?2",
                            params![user.user_id, PURPOSE_INVITE],
                        )?;
                        user.user_id
                    }
                    None => {
                        let user_id = Uuid::new_v4().to_string();
                        tx.execute(
                            "INSERT INTO users (user_id, email, role, invite_status, invited_by, created_at, updated_at)
                             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?5)",
                            params![user_id, email, role.as_str(), invited_by, now],
                        )?;
                        user_id
                    }
                };

                let token = store_token(&tx, &user_id, PURPOSE_INVITE, ttl)?;
                let user = find_by_email(&tx, &email)?
                    .ok_or_else(|| RagchatError::NotFound(format!("user {}", email)))?;
                tx.commit()?;
                Ok((user, token))
            })
            .await
    }

    pub async fn accept_invite(&self, email: &str, token: &str) -> Result<User> {
        let email = email.to_string();
        let token = token.to_string();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let user = find_by_email(&tx, &email)?
                    .filter(|u| u.invite_status == InviteStatus::Pending)
                    .ok_or_else(|| RagchatError::Unauthorized("Invalid or expired invite".to_string()))?;
                consume_token(&tx, &user.user_id, PURPOSE_INVITE, &token)
                    .map_err(|_| RagchatError::Unauthorized("Invalid or expired invite".to_string()))?;
                let now = Utc::now().timestamp();
                tx.execute(
                    "UPDATE users SET invite_status = 'accepted', last_login_at = ?1, updated_at = ?1 WHERE user_id = ?2",
                    params![now, user.user_id],
                )?;
                tx.commit()?;
                Ok(User {
                    invite_status: InviteStatus::Accepted,
                    last_login_at: Some(timestamp(now)),
                    ..user
                })
            })
            .await
    }

    /// Revoke a pending invite or deactivate an account. Outstanding tokens are dropped.
    pub async fn revoke(&self, email: &str) -> Result<User> {
        let email = email.to_string();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let user = find_by_email(&tx, &email)?
                    .ok_or_else(|| RagchatError::NotFound(format!("No account for {}", email)))?;
                tx.execute(
                    "UPDATE users SET invite_status = 'revoked', updated_at = ?1 WHERE user_id = ?2",
                    params![Utc::now().timestamp(), user.user_id],
                )?;
                tx.execute("DELETE FROM login_tokens WHERE user_id = ?1", params![user.user_id])?;
                tx.commit()?;
                Ok(User {
                    invite_status: InviteStatus::Revoked,
                    ..user
                })
            })
            .await
    }
}
