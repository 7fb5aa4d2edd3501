use crate::auth::{Role, User};
use crate::error::{Result, RagchatError};
use chrono::Utc;
use hmac::{Hmac, Mac};
use jwt::{Claims, RegisteredClaims, SignWithKey, VerifyWithKey};
use sha2::Sha256;

/// What a verified session token tells us about the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionClaims {
    pub user_id: String,
    pub email: String,
    pub role: Role,
    pub issued_at: i64,
    pub expires_at: i64,
}

/// HS256 signing key plus the issuer and lifetime stamped into every token.
pub struct JwtKeys {
    key: Hmac<Sha256>,
    issuer: String,
    ttl_secs: i64,
}

impl JwtKeys {
    pub fn new(secret: &[u8], issuer: &str, ttl_hours: i64) -> Result<Self> {
        if secret.is_empty() {
            return Err(RagchatError::Config("JWT secret must not be empty".to_string()));
        }
        let key = Hmac::<Sha256>::new_from_slice(secret)
            .map_err(|e| RagchatError::Config(format!("Invalid JWT secret: {}", e)))?;
        Ok(Self {
            key,
            issuer: issuer.to_string(),
            ttl_secs: ttl_hours * 3600,
        })
    }

    pub fn issue(&self, user: &User) -> Result<String> {
        self.issue_at(user, Utc::now().timestamp())
    }

    fn issue_at(&self, user: &User, now: i64) -> Result<String> {
        let mut claims = Claims::new(RegisteredClaims {
            issuer: Some(self.issuer.clone()),
            subject: Some(user.user_id.clone()),
            issued_at: Some(now as u64),
            expiration: Some((now + self.ttl_secs) as u64),
            ..Default::default()
        });
        claims.private.insert("email".to_string(), user.email.clone().into());
        claims.private.insert("role".to_string(), user.role.as_str().into());

        claims
            .sign_with_key(&self.key)
            .map_err(|e| RagchatError::Config(format!("Failed to sign token: {}", e)))
    }

    /// Check signature, issuer and time bounds. None for anything invalid.
    pub fn verify(&self, token: &str) -> Option<SessionClaims> {
        let claims: Claims = token.verify_with_key(&self.key).ok()?;
        let now = Utc::now().timestamp();

        if claims.registered.issuer.as_deref() != Some(self.issuer.as_str()) {
            return None;
        }
        let issued_at = claims.registered.issued_at? as i64;
        let expires_at = claims.registered.expiration? as i64;
        // Small allowance for clock skew between instances
        if issued_at > now + 60 || expires_at <= now {
            return None;
        }

        let role = claims.private.get("role")?.as_str().and_then(Role::parse)?;
        let email = claims.private.get("email")?.as_str()?.to_string();

        Some(SessionClaims {
            user_id: claims.registered.subject?,
            email,
            role,
            issued_at,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InviteStatus;

    fn user(role: Role) -> User {
        User {
            user_id: "u-1".into(),
            email: "a@example.org".into(),
            role,
            invite_status: InviteStatus::Accepted,
            created_at: Utc::now(),
            last_login_at: None,
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let keys = JwtKeys::new(b"secret", "ragchat", 1).unwrap();
        let token = keys.issue(&user(Role::Admin)).unwrap();
        let claims = keys.verify(&token).unwrap();

        assert_eq!(claims.user_id, "u-1");
        assert_eq!(claims.role, Role::Admin);
        assert_eq!(claims.expires_at - claims.issued_at, 3600);
    }

    #[test]
    fn test_wrong_key_or_issuer_rejected() {
        let keys = JwtKeys::new(b"secret", "ragchat", 1).unwrap();
        let token = keys.issue(&user(Role::User)).unwrap();

        let other_key = JwtKeys::new(b"other", "ragchat", 1).unwrap();
        assert!(other_key.verify(&token).is_none());

        let other_issuer = JwtKeys::new(b"secret", "elsewhere", 1).unwrap();
        assert!(other_issuer.verify(&token).is_none());

        assert!(keys.verify("not.a.token").is_none());
    }

    #[test]
    fn test_expired_token_rejected() {
        let keys = JwtKeys::new(b"secret", "ragchat", 1).unwrap();
        let token = keys
            .issue_at(&user(Role::User), Utc::now().timestamp() - 7200)
            .unwrap();
        assert!(keys.verify(&token).is_none());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(JwtKeys::new(b"", "ragchat", 1).is_err());
    }
}
