use crate::audit::{self, AuditAction, AuditEvent};
use crate::auth::{Role, Session};
use crate::error::Result;
use crate::http::extract::{require_role, AuthUser, ClientIp, AUTH_COOKIE};
use crate::http::AppState;
use axum::extract::State;
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct EmailBody {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenBody {
    pub email: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct InviteBody {
    pub email: String,
    #[serde(default)]
    pub role: Option<Role>,
}

/// Session JSON plus an HttpOnly cookie so browsers are signed in too.
fn session_response(state: &AppState, session: Session) -> Response {
    let max_age = state.config.auth.token_ttl_hours * 3600;
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        AUTH_COOKIE, session.token, max_age
    );
    let mut response = Json(session).into_response();
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
        Err(e) => log::warn!("Could not build session cookie: {}", e),
    }
    response
}

/// `POST /api/auth/login`. Answers the same way whether or not the address has an account.
pub async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(body): Json<EmailBody>,
) -> Result<Json<serde_json::Value>> {
    let key = format!("login:{}", ip.as_deref().unwrap_or("unknown"));
    state.enforce_limit(&state.auth_limit(), &key, ip.clone()).await?;

    let link = state.auth.request_login_link(&body.email).await?;
    let issued = link.is_some();
    if let Some(link) = link {
        // Links are not mailed; operators relay them from the log
        log::info!("Login link for {}: {}", body.email.trim(), link);
    }

    let mut event = AuditEvent::new(AuditAction::LoginRequested)
        .target(body.email.trim().to_lowercase())
        .client_ip(ip);
    if !issued {
        event = event.failed();
    }
    audit::record(&state.db, event).await;

    Ok(Json(json!({
        "ok": true,
        "message": "If this address has an account, a login link has been issued."
    })))
}

/// `POST /api/auth/verify`: trade a login link token for a session.
pub async fn verify(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(body): Json<TokenBody>,
) -> Result<Response> {
    let key = format!("login:{}", ip.as_deref().unwrap_or("unknown"));
    state.enforce_limit(&state.auth_limit(), &key, ip.clone()).await?;

    let result = state.auth.verify_login(&body.email, &body.token).await;
    let mut event = AuditEvent::new(AuditAction::LoginVerified)
        .target(body.email.trim().to_lowercase())
        .client_ip(ip);
    if let Ok(session) = &result {
        event = event.actor(session.user.user_id.clone());
    } else {
        event = event.failed();
    }
    audit::record(&state.db, event).await;

    Ok(session_response(&state, result?))
}

/// `POST /api/auth/invite` (admin). The link goes back to the inviter.
pub async fn invite(
    State(state): State<AppState>,
    AuthUser(admin): AuthUser,
    ClientIp(ip): ClientIp,
    Json(body): Json<InviteBody>,
) -> Result<Json<serde_json::Value>> {
    require_role(&admin, Role::Admin)?;
    let role = body.role.unwrap_or(Role::User);
    let (user, link) = state.auth.invite(&body.email, role, &admin).await?;

    log::info!("{} invited {} as {}", admin.email, user.email, role.as_str());
    audit::record(
        &state.db,
        AuditEvent::new(AuditAction::InviteCreated)
            .actor(admin.user_id.clone())
            .target(user.email.clone())
            .client_ip(ip)
            .details(json!({ "role": role.as_str() })),
    )
    .await;

    Ok(Json(json!({ "user": user, "inviteLink": link })))
}

/// `POST /api/auth/invite/accept`
pub async fn accept_invite(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(body): Json<TokenBody>,
) -> Result<Response> {
    let key = format!("invite:{}", ip.as_deref().unwrap_or("unknown"));
    state.enforce_limit(&state.auth_limit(), &key, ip.clone()).await?;

    let result = state.auth.accept_invite(&body.email, &body.token).await;
    let mut event = AuditEvent::new(AuditAction::InviteAccepted)
        .target(body.email.trim().to_lowercase())
        .client_ip(ip);
    if result.is_err() {
        event = event.failed();
    }
    audit::record(&state.db, event).await;

    Ok(session_response(&state, result?))
}

/// `POST /api/auth/invite/revoke` (admin)
pub async fn revoke_invite(
    State(state): State<AppState>,
    AuthUser(admin): AuthUser,
    ClientIp(ip): ClientIp,
    Json(body): Json<EmailBody>,
) -> Result<Json<crate::auth::User>> {
    require_role(&admin, Role::Admin)?;
    if let Some(target) = state.auth.accounts.find_by_email(&body.email.trim().to_lowercase()).await? {
        // Admins may not lock out someone ranked above them
        require_role(&admin, target.role)?;
    }
    let user = state.auth.revoke_invite(&body.email).await?;

    audit::record(
        &state.db,
        AuditEvent::new(AuditAction::InviteRevoked)
            .actor(admin.user_id.clone())
            .target(user.email.clone())
            .client_ip(ip),
    )
    .await;

    Ok(Json(user))
}

/// `GET /api/auth/me`
pub async fn me(AuthUser(user): AuthUser) -> Json<crate::auth::User> {
    Json(user)
}
