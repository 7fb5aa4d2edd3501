//! HTTP surface: the chat event stream plus the account, answer and feedback APIs.

pub mod answers;
pub mod auth;
pub mod chat;
pub mod extract;

use crate::answers::AnswerStore;
use crate::audit::{self, AuditAction, AuditEvent};
use crate::auth::{AuthService, JwtKeys};
use crate::chat::{ChatService, QaChain};
use crate::config::Config;
use crate::db::Db;
use crate::error::{RagchatError, Result};
use crate::ratelimit::{Limit, RateLimiter};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Db,
    pub chat: ChatService,
    pub answers: AnswerStore,
    pub auth: Arc<AuthService>,
    pub limiter: RateLimiter,
}

impl AppState {
    pub fn new(config: Arc<Config>, db: Db, chain: QaChain, jwt: JwtKeys) -> Self {
        let answers = AnswerStore::new(db.clone());
        Self {
            chat: ChatService::new(Arc::clone(&config), chain, answers.clone()),
            auth: Arc::new(AuthService::new(db.clone(), jwt, config.auth.clone())),
            limiter: RateLimiter::new(db.clone(), config.rate_limit.window_secs),
            answers,
            db,
            config,
        }
    }

    pub fn chat_limit(&self) -> Limit {
        Limit { name: "chat", max_requests: self.config.rate_limit.chat_max }
    }

    pub fn auth_limit(&self) -> Limit {
        Limit { name: "auth", max_requests: self.config.rate_limit.auth_max }
    }

    pub fn vote_limit(&self) -> Limit {
        Limit { name: "vote", max_requests: self.config.rate_limit.vote_max }
    }

    /// Count one request against `limit`, auditing rejections.
    pub async fn enforce_limit(&self, limit: &Limit, caller_key: &str, client_ip: Option<String>) -> Result<()> {
        match self.limiter.check(limit, caller_key).await {
            Ok(_) => Ok(()),
            Err(e @ RagchatError::RateLimited { .. }) => {
                audit::record(
                    &self.db,
                    AuditEvent::new(AuditAction::RateLimitExceeded)
                        .actor(caller_key)
                        .target(limit.name)
                        .client_ip(client_ip),
                )
                .await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

/// Create the axum router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat::chat))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/verify", post(auth::verify))
        .route("/api/auth/invite", post(auth::invite))
        .route("/api/auth/invite/accept", post(auth::accept_invite))
        .route("/api/auth/invite/revoke", post(auth::revoke_invite))
        .route("/api/auth/me", get(auth::me))
        .route("/api/answers", get(answers::list))
        .route("/api/answers/:id", get(answers::get_one).delete(answers::delete))
        .route("/api/like", get(answers::liked).post(answers::like))
        .route("/api/vote", post(answers::vote))
        .route("/api/admin/audit", get(answers::audit_log))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server until ctrl-c.
pub async fn serve(state: AppState) -> Result<()> {
    let addr = format!("{}:{}", state.config.server.bind_address, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        RagchatError::Io(std::io::Error::new(e.kind(), format!("Failed to bind to {}: {}", addr, e)))
    })?;

    log::info!("Serving {} on http://{}", state.config.site.name, addr);
    log::info!("Chat endpoint: http://{}/api/chat", addr);

    axum::serve(listener, router(state).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| RagchatError::Io(std::io::Error::other(format!("HTTP server error: {}", e))))?;

    log::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }
}

async fn handle_health() -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "service": "ragchat",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
        .into_response()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::{Role, User};
    use crate::config::tests::sample_config;
    use crate::db::tests::migrated_db;
    use crate::retrieval::Retriever;
    use crate::testing::{sample_docs, FakeChatModel, FakeEmbedder, FakeStore};
    use axum::body::Body;
    use axum::http::{header, Request};
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    pub(crate) async fn test_state_with(config: Config) -> (TempDir, AppState) {
        test_state_with_store(config, Arc::new(FakeStore::with_docs(sample_docs()))).await
    }

    /// Like [`test_state_with`], keeping a handle on the store to inspect the filters it saw.
    pub(crate) async fn test_state_with_store(config: Config, store: Arc<FakeStore>) -> (TempDir, AppState) {
        let (dir, db) = migrated_db().await;
        let retriever = Retriever::new(Arc::new(FakeEmbedder), store);
        let chain = QaChain::new(Arc::new(FakeChatModel::new(&["Sit", " still."])), retriever, "gpt-4o-mini");
        let jwt = JwtKeys::new(b"test-secret", &config.auth.issuer, config.auth.token_ttl_hours).unwrap();
        (dir, AppState::new(Arc::new(config), db, chain, jwt))
    }

    pub(crate) async fn test_state() -> (TempDir, AppState) {
        test_state_with(sample_config("unused.db")).await
    }

    /// An active account with a session token.
    pub(crate) async fn signed_in(state: &AppState, email: &str, role: Role) -> (User, String) {
        let user = state.auth.accounts.bootstrap(email, role).await.unwrap();
        let token = state.auth.jwt.issue(&user).unwrap();
        (user, token)
    }

    pub(crate) fn json_request(method: &str, uri: &str, body: Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    pub(crate) fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    pub(crate) async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, state) = test_state().await;
        let response = router(state).oneshot(get_request("/health", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "ragchat");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (_dir, state) = test_state().await;
        let response = router(state).oneshot(get_request("/api/nope", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rate_limit_rejection_is_audited() {
        let (_dir, state) = test_state().await;
        let limit = Limit { name: "auth", max_requests: 1 };

        state.enforce_limit(&limit, "k", None).await.unwrap();
        let err = state.enforce_limit(&limit, "k", Some("10.0.0.9".into())).await.unwrap_err();
        assert!(matches!(err, RagchatError::RateLimited { .. }));

        let entries = audit::recent(&state.db, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "rate_limit_exceeded");
        assert_eq!(entries[0].target.as_deref(), Some("auth"));
        assert_eq!(entries[0].client_ip.as_deref(), Some("10.0.0.9"));
    }
}
