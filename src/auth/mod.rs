//! Accounts, roles and session tokens.

pub mod accounts;
pub mod jwt;

use crate::config::AuthConfig;
use crate::db::Db;
use crate::error::{RagchatError, Result};
use serde::{Deserialize, Serialize};

pub use accounts::{AccountStore, User};
pub use jwt::{JwtKeys, SessionClaims};

/// Account roles, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    Superuser,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::Superuser => "superuser",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            "superuser" => Some(Role::Superuser),
            _ => None,
        }
    }

    /// Whether this role grants everything `required` does.
    pub fn allows(&self, required: Role) -> bool {
        *self >= required
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteStatus {
    Pending,
    Accepted,
    Revoked,
}

impl InviteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InviteStatus::Pending => "pending",
            InviteStatus::Accepted => "accepted",
            InviteStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InviteStatus::Pending),
            "accepted" => Some(InviteStatus::Accepted),
            "revoked" => Some(InviteStatus::Revoked),
            _ => None,
        }
    }
}

/// Lowercase and sanity-check an email address.
pub fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    let valid = email.len() <= 254
        && !email.chars().any(char::is_whitespace)
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.'));
    if valid {
        Ok(email)
    } else {
        Err(RagchatError::InvalidInput("A valid email address is required".to_string()))
    }
}

/// Login and invite flows on top of the account store and the JWT keys.
///
/// Links are returned to the caller instead of being mailed.
pub struct AuthService {
    pub accounts: AccountStore,
    pub jwt: JwtKeys,
    config: AuthConfig,
}

/// Outcome of a successful login or invite acceptance.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub user: User,
    pub token: String,
}

impl AuthService {
    pub fn new(db: Db, jwt: JwtKeys, config: AuthConfig) -> Self {
        Self {
            accounts: AccountStore::new(db),
            jwt,
            config,
        }
    }

    fn link(&self, path: &str, email: &str, token: &str) -> Result<String> {
        let mut url = url::Url::parse(&self.config.public_base_url)
            .and_then(|base| base.join(path))
            .map_err(|e| RagchatError::Config(format!("Invalid public_base_url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("token", token)
            .append_pair("email", email);
        Ok(url.to_string())
    }

    /// Create a one-time login link for an active account. Returns None for
    /// unknown, pending or revoked addresses so callers can answer uniformly.
    pub async fn request_login_link(&self, email: &str) -> Result<Option<String>> {
        let email = normalize_email(email)?;
        let ttl = chrono::Duration::minutes(self.config.login_link_ttl_minutes);
        match self.accounts.create_login_token(&email, ttl).await? {
            Some(token) => Ok(Some(self.link("/login/verify", &email, &token)?)),
            None => Ok(None),
        }
    }

    pub async fn verify_login(&self, email: &str, token: &str) -> Result<Session> {
        let email = normalize_email(email)?;
        let user = self.accounts.consume_login_token(&email, token).await?;
        let token = self.jwt.issue(&user)?;
        Ok(Session { user, token })
    }

    /// Invite an address (creating or refreshing a pending account). Returns the invite link.
    pub async fn invite(&self, email: &str, role: Role, invited_by: &User) -> Result<(User, String)> {
        let email = normalize_email(email)?;
        if !invited_by.role.allows(role) {
            return Err(RagchatError::Forbidden("Cannot invite a user with a higher role than your own".to_string()));
        }
        let ttl = chrono::Duration::days(self.config.invite_ttl_days);
        let (user, token) = self.accounts.create_invite(&email, role, &invited_by.user_id, ttl).await?;
        let link = self.link("/invite/accept", &email, &token)?;
        Ok((user, link))
    }

    pub async fn accept_invite(&self, email: &str, token: &str) -> Result<Session> {
        let email = normalize_email(email)?;
        let user = self.accounts.accept_invite(&email, token).await?;
        let token = self.jwt.issue(&user)?;
        Ok(Session { user, token })
    }

    pub async fn revoke_invite(&self, email: &str) -> Result<User> {
        let email = normalize_email(email)?;
        self.accounts.revoke(&email).await
    }
}
