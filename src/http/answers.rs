use crate::answers::{Answer, MAX_BATCH_IDS};
use crate::audit::{self, AuditAction, AuditEntry, AuditEvent};
use crate::auth::Role;
use crate::error::{RagchatError, Result};
use crate::http::extract::{
    caller_key, require_login_if_configured, require_role, sees_private_content, AuthUser, ClientIp, OptionalAuthUser,
};
use crate::http::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_RECENT: usize = 20;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Comma-separated answer ids
    pub ids: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct IdsQuery {
    #[serde(default)]
    pub ids: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeBody {
    pub answer_id: String,
    #[serde(default = "default_like")]
    pub like: bool,
}

fn default_like() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteBody {
    pub doc_id: String,
    pub vote: i8,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

fn split_ids(ids: &str) -> Vec<String> {
    ids.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect()
}

/// `GET /api/answers?ids=a,b` or the most recent answers.
pub async fn list(
    State(state): State<AppState>,
    OptionalAuthUser(user): OptionalAuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Answer>>> {
    require_login_if_configured(&state, &user)?;
    let private = sees_private_content(&state, user.as_ref());
    let answers = match query.ids.as_deref() {
        Some(ids) => state.answers.get_many(&split_ids(ids), private).await?,
        None => {
            let limit = query.limit.unwrap_or(DEFAULT_RECENT).clamp(1, MAX_BATCH_IDS);
            state.answers.recent(limit, private).await?
        }
    };
    Ok(Json(answers))
}

/// `GET /api/answers/:id`. Answers from private libraries read as missing without access.
pub async fn get_one(
    State(state): State<AppState>,
    OptionalAuthUser(user): OptionalAuthUser,
    Path(id): Path<String>,
) -> Result<Json<Answer>> {
    require_login_if_configured(&state, &user)?;
    let private = sees_private_content(&state, user.as_ref());
    Ok(Json(state.answers.get(&id, private).await?))
}

/// `DELETE /api/answers/:id` (admin)
pub async fn delete(
    State(state): State<AppState>,
    AuthUser(admin): AuthUser,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    require_role(&admin, Role::Admin)?;
    state.answers.delete(&id).await?;

    log::info!("{} deleted answer {}", admin.email, id);
    audit::record(
        &state.db,
        AuditEvent::new(AuditAction::AnswerDeleted)
            .actor(admin.user_id.clone())
            .target(id)
            .client_ip(ip),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/like`
pub async fn like(
    State(state): State<AppState>,
    OptionalAuthUser(user): OptionalAuthUser,
    client_ip: ClientIp,
    Json(body): Json<LikeBody>,
) -> Result<Json<Value>> {
    require_login_if_configured(&state, &user)?;
    let key = caller_key(user.as_ref(), &client_ip);
    state.enforce_limit(&state.vote_limit(), &key, client_ip.0.clone()).await?;

    let count = state.answers.set_like(&body.answer_id, &key, body.like).await?;
    Ok(Json(json!({ "answerId": body.answer_id, "liked": body.like, "likeCount": count })))
}

/// `GET /api/like?ids=a,b`: which of the given answers the caller liked.
pub async fn liked(
    State(state): State<AppState>,
    OptionalAuthUser(user): OptionalAuthUser,
    client_ip: ClientIp,
    Query(query): Query<IdsQuery>,
) -> Result<Json<Vec<String>>> {
    require_login_if_configured(&state, &user)?;
    let key = caller_key(user.as_ref(), &client_ip);
    Ok(Json(state.answers.liked_by(&key, &split_ids(&query.ids)).await?))
}

/// `POST /api/vote`
pub async fn vote(
    State(state): State<AppState>,
    OptionalAuthUser(user): OptionalAuthUser,
    client_ip: ClientIp,
    Json(body): Json<VoteBody>,
) -> Result<Json<Value>> {
    let key = caller_key(user.as_ref(), &client_ip);
    state.enforce_limit(&state.vote_limit(), &key, client_ip.0.clone()).await?;

    if body.doc_id.trim().is_empty() {
        return Err(RagchatError::InvalidInput("docId is required".to_string()));
    }
    state.answers.vote(&body.doc_id, &key, body.vote).await?;
    Ok(Json(json!({ "ok": true })))
}

/// `GET /api/admin/audit` (superuser)
pub async fn audit_log(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>> {
    require_role(&user, Role::Superuser)?;
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    Ok(Json(audit::recent(&state.db, limit).await?))
}
