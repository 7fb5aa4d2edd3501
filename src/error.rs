use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Main error type for RAGChat
#[derive(Error, Debug)]
pub enum RagchatError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Embedding API errors
    #[error("Embedding API error: {0}")]
    Embedding(String),

    /// Chat completion API errors
    #[error("LLM error: {0}")]
    Llm(String),

    /// The vector index (or its backing table) does not exist
    #[error("Vector index not found: {0}")]
    IndexNotFound(String),

    /// Provider reported that the account ran out of quota
    #[error("Provider quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Any other vector store failure
    #[error("Vector store error: {0}")]
    VectorStore(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Caller exceeded its request quota for the current window
    #[error("Too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

/// Convenient Result type using RagchatError
pub type Result<T> = std::result::Result<T, RagchatError>;

/// Coarse error category reported to streaming clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    IndexNotFound,
    QuotaExceeded,
    Generic,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::IndexNotFound => "index_not_found",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Generic => "generic",
        }
    }
}

impl RagchatError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RagchatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RagchatError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RagchatError::Forbidden(_) => StatusCode::FORBIDDEN,
            RagchatError::NotFound(_) => StatusCode::NOT_FOUND,
            RagchatError::Conflict(_) => StatusCode::CONFLICT,
            RagchatError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RagchatError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            RagchatError::IndexNotFound(_) => StatusCode::SERVICE_UNAVAILABLE,
            RagchatError::Embedding(_) | RagchatError::Llm(_) | RagchatError::VectorStore(_) => {
                StatusCode::BAD_GATEWAY
            }
            RagchatError::Database(_) | RagchatError::Io(_) | RagchatError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RagchatError::IndexNotFound(_) => ErrorKind::IndexNotFound,
            RagchatError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            _ => ErrorKind::Generic,
        }
    }

    /// Message safe to show to end users. Internal failures are not echoed back.
    pub fn public_message(&self) -> String {
        match self {
            RagchatError::IndexNotFound(_) => {
                "The knowledge base is not available right now. Please try again later.".to_string()
            }
            RagchatError::QuotaExceeded(_) => {
                "The AI service has reached its usage limit. Please try again later.".to_string()
            }
            RagchatError::Database(_) | RagchatError::Io(_) | RagchatError::Config(_) => {
                "Internal server error".to_string()
            }
            RagchatError::Embedding(_) | RagchatError::Llm(_) | RagchatError::VectorStore(_) => {
                "The AI service failed to answer. Please try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for RagchatError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        } else {
            log::debug!("Request rejected: {}", self);
        }

        let body = Json(serde_json::json!({
            "error": self.public_message(),
            "kind": self.kind().as_str(),
        }));
        let mut response = (status, body).into_response();

        if let RagchatError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
