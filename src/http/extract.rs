//! Request extractors: the signed-in user and the client address.

use crate::auth::{InviteStatus, Role, User};
use crate::error::{RagchatError, Result};
use crate::http::AppState;
use axum::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::{header, request::Parts};
use std::convert::Infallible;
use std::net::SocketAddr;

/// Name of the cookie carrying the session token.
pub const AUTH_COOKIE: &str = "auth";

/// A caller with a valid session for an active account.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

/// Like [`AuthUser`], but anonymous callers (or stale sessions) are `None`.
#[derive(Debug, Clone)]
pub struct OptionalAuthUser(pub Option<User>);

/// Client address: first `X-Forwarded-For` hop, else the socket peer.
#[derive(Debug, Clone)]
pub struct ClientIp(pub Option<String>);

fn session_token(parts: &Parts) -> Option<String> {
    let bearer = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    if bearer.is_some() {
        return bearer;
    }

    parts
        .headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == AUTH_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|t| !t.is_empty())
}

/// Resolve the session to a current account. Role and status come from the
/// database, so demotions and revocations apply to existing tokens.
async fn authenticate(parts: &Parts, state: &AppState) -> Result<Option<User>> {
    let Some(token) = session_token(parts) else {
        return Ok(None);
    };
    let claims = state
        .auth
        .jwt
        .verify(&token)
        .ok_or_else(|| RagchatError::Unauthorized("Invalid or expired session".to_string()))?;

    match state.auth.accounts.get(&claims.user_id).await? {
        Some(user) if user.invite_status == InviteStatus::Accepted => Ok(Some(user)),
        _ => Err(RagchatError::Unauthorized("Account is not active".to_string())),
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = RagchatError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        authenticate(parts, state)
            .await?
            .map(AuthUser)
            .ok_or_else(|| RagchatError::Unauthorized("Sign in required".to_string()))
    }
}

#[async_trait]
impl FromRequestParts<AppState> for OptionalAuthUser {
    type Rejection = RagchatError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        match authenticate(parts, state).await {
            Ok(user) => Ok(OptionalAuthUser(user)),
            Err(RagchatError::Unauthorized(reason)) => {
                log::debug!("Ignoring session: {}", reason);
                Ok(OptionalAuthUser(None))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Infallible> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(String::from);

        let ip = forwarded.or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        });
        Ok(ClientIp(ip))
    }
}

pub fn require_role(user: &User, required: Role) -> Result<()> {
    if user.role.allows(required) {
        Ok(())
    } else {
        Err(RagchatError::Forbidden(format!("Requires the {} role", required.as_str())))
    }
}

/// Whether the caller may see private libraries and answers drawn from them.
pub fn sees_private_content(state: &AppState, user: Option<&User>) -> bool {
    user.is_some_and(|u| u.role.allows(state.config.site.private_role))
}

/// Sites with `require_login` refuse anonymous callers.
pub fn require_login_if_configured(state: &AppState, user: &Option<User>) -> Result<()> {
    if state.config.site.require_login && user.is_none() {
        return Err(RagchatError::Unauthorized("Sign in required".to_string()));
    }
    Ok(())
}

/// Key for rate limits and likes: the account when signed in, else the address.
pub fn caller_key(user: Option<&User>, ip: &ClientIp) -> String {
    match (user, &ip.0) {
        (Some(user), _) => format!("user:{}", user.user_id),
        (None, Some(ip)) => format!("ip:{}", ip),
        (None, None) => "anonymous".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tests::{signed_in, test_state};
    use axum::http::Request;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_token_from_header_or_cookie() {
        assert_eq!(session_token(&parts(&[("authorization", "Bearer abc")])).as_deref(), Some("abc"));
        assert_eq!(
            session_token(&parts(&[("cookie", "theme=dark; auth=xyz; other=1")])).as_deref(),
            Some("xyz")
        );
        assert_eq!(session_token(&parts(&[("authorization", "Basic abc")])), None);
        assert_eq!(session_token(&parts(&[])), None);
    }

    #[tokio::test]
    async fn test_client_ip_prefers_forwarded_for() {
        let mut p = parts(&[("x-forwarded-for", "203.0.113.5, 10.0.0.1")]);
        let ClientIp(ip) = ClientIp::from_request_parts(&mut p, &()).await.unwrap();
        assert_eq!(ip.as_deref(), Some("203.0.113.5"));

        let mut p = parts(&[]);
        p.extensions.insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 2], 4000))));
        let ClientIp(ip) = ClientIp::from_request_parts(&mut p, &()).await.unwrap();
        assert_eq!(ip.as_deref(), Some("192.168.1.2"));
    }

    #[tokio::test]
    async fn test_revoked_account_loses_session() {
        let (_dir, state) = test_state().await;
        let (user, token) = signed_in(&state, "ana@example.org", Role::Admin).await;
        let header = format!("Bearer {}", token);

        let mut p = parts(&[("authorization", header.as_str())]);
        let AuthUser(found) = AuthUser::from_request_parts(&mut p, &state).await.unwrap();
        assert_eq!(found.user_id, user.user_id);

        state.auth.accounts.revoke(&user.email).await.unwrap();
        let mut p = parts(&[("authorization", header.as_str())]);
        assert!(AuthUser::from_request_parts(&mut p, &state).await.is_err());
        let mut p = parts(&[("authorization", header.as_str())]);
        let OptionalAuthUser(none) = OptionalAuthUser::from_request_parts(&mut p, &state).await.unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_caller_key() {
        assert_eq!(caller_key(None, &ClientIp(Some("1.2.3.4".into()))), "ip:1.2.3.4");
        assert_eq!(caller_key(None, &ClientIp(None)), "anonymous");
    }
}
