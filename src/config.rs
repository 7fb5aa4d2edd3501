use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Media types a document chunk can carry in its `type` metadata field.
pub const KNOWN_MEDIA_TYPES: &[&str] = &["text", "audio", "youtube"];

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub embeddings: EmbeddingsConfig,
    pub llm: LlmConfig,
    pub vector_store: VectorStoreConfig,
    pub site: SiteConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    pub auth: AuthConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_http_port(),
            log_level: default_log_level(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

/// Embeddings configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsConfig {
    pub model: String,
    pub api_key_env: String,
    pub dimensions: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_openai_base")]
    pub api_base: String,
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

/// Chat model configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_openai_base")]
    pub api_base: String,
    pub api_key_env: String,
    pub default_model: String,
    /// Models a client may request. The default model is always allowed.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Deadline for a whole completion; for streamed answers, the longest gap between chunks.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_temperature() -> f32 {
    0.3
}

fn default_request_timeout() -> u64 {
    120
}

impl LlmConfig {
    pub fn is_model_allowed(&self, model: &str) -> bool {
        model == self.default_model || self.allowed_models.iter().any(|m| m == model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorStoreProvider {
    Sqlite,
    Pinecone,
}

/// Vector index configuration
#[derive(Debug, Clone, Deserialize)]
pub struct VectorStoreConfig {
    pub provider: VectorStoreProvider,
    pub index_name: String,
    /// Index host for hosted providers, e.g. `https://my-index-abc.svc.pinecone.io`
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    4
}

/// Per-site behaviour: which libraries and media types are searchable and
/// what a chat request may ask for.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub site_id: String,
    pub name: String,
    /// Libraries searched when the client asks for `all`. Empty means every library.
    #[serde(default)]
    pub included_libraries: Vec<String>,
    #[serde(default)]
    pub excluded_libraries: Vec<String>,
    /// Libraries only visible to signed-in users with at least `private_role`.
    #[serde(default)]
    pub private_libraries: Vec<String>,
    #[serde(default = "default_private_role")]
    pub private_role: crate::auth::Role,
    /// Named collections a client may pick, each mapping to a library.
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default = "default_media_types")]
    pub enabled_media_types: Vec<String>,
    #[serde(default = "default_max_question_length")]
    pub max_question_length: usize,
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
    #[serde(default)]
    pub allow_model_comparison: bool,
    #[serde(default)]
    pub require_login: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_private_role() -> crate::auth::Role {
    crate::auth::Role::User
}

fn default_media_types() -> Vec<String> {
    KNOWN_MEDIA_TYPES.iter().map(|s| s.to_string()).collect()
}

fn default_max_question_length() -> usize {
    4000
}

fn default_max_history_turns() -> usize {
    10
}

/// Fixed-window rate limits per caller
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_chat_max")]
    pub chat_max: u32,
    #[serde(default = "default_auth_max")]
    pub auth_max: u32,
    #[serde(default = "default_vote_max")]
    pub vote_max: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            chat_max: default_chat_max(),
            auth_max: default_auth_max(),
            vote_max: default_vote_max(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_chat_max() -> u32 {
    8
}

fn default_auth_max() -> u32 {
    5
}

fn default_vote_max() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret_env: String,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_hours: i64,
    #[serde(default = "default_login_link_ttl")]
    pub login_link_ttl_minutes: i64,
    #[serde(default = "default_invite_ttl")]
    pub invite_ttl_days: i64,
    pub public_base_url: String,
}

fn default_issuer() -> String {
    "ragchat".to_string()
}

fn default_token_ttl() -> i64 {
    24 * 30
}

fn default_login_link_ttl() -> i64 {
    60
}

fn default_invite_ttl() -> i64 {
    14
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in RAGCHAT_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        let config = Self::read()?;
        config.validate_env()?;
        Ok(config)
    }

    /// Like [`Config::load`] but without requiring the API secrets, for
    /// maintenance commands that never call out.
    pub fn read() -> Result<Self> {
        let _ = dotenv::dotenv();

        let config_path = std::env::var("RAGCHAT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        Self::from_toml(&config_str)
    }

    /// Parse and validate configuration text without touching the environment.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).context("Failed to parse config.toml")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.vector_store.top_k == 0 || self.vector_store.top_k > 20 {
            anyhow::bail!("vector_store.top_k must be between 1 and 20");
        }

        if self.vector_store.provider == VectorStoreProvider::Pinecone {
            if self.vector_store.host.is_none() {
                anyhow::bail!("vector_store.host is required for the pinecone provider");
            }
            if self.vector_store.api_key_env.is_none() {
                anyhow::bail!("vector_store.api_key_env is required for the pinecone provider");
            }
        }

        if self.embeddings.dimensions == 0 {
            anyhow::bail!("embeddings.dimensions must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.llm.temperature) {
            anyhow::bail!("llm.temperature must be between 0.0 and 1.0");
        }

        if self.site.enabled_media_types.is_empty() {
            anyhow::bail!("site.enabled_media_types must not be empty");
        }
        for media_type in &self.site.enabled_media_types {
            if !KNOWN_MEDIA_TYPES.contains(&media_type.as_str()) {
                anyhow::bail!(
                    "Unknown media type '{}' in site.enabled_media_types (expected one of {:?})",
                    media_type,
                    KNOWN_MEDIA_TYPES
                );
            }
        }

        if self.site.max_question_length == 0 {
            anyhow::bail!("site.max_question_length must be greater than 0");
        }

        if self.rate_limit.window_secs == 0 {
            anyhow::bail!("rate_limit.window_secs must be greater than 0");
        }
        if self.rate_limit.chat_max == 0 || self.rate_limit.auth_max == 0 || self.rate_limit.vote_max == 0 {
            anyhow::bail!("rate_limit maximums must be greater than 0");
        }

        if self.auth.token_ttl_hours <= 0 || self.auth.login_link_ttl_minutes <= 0 || self.auth.invite_ttl_days <= 0 {
            anyhow::bail!("auth TTLs must be positive");
        }

        url::Url::parse(&self.auth.public_base_url)
            .with_context(|| format!("auth.public_base_url is not a valid URL: {}", self.auth.public_base_url))?;

        Ok(())
    }

    /// Check that every secret the config refers to is present in the environment.
    fn validate_env(&self) -> Result<()> {
        let mut required = vec![
            &self.embeddings.api_key_env,
            &self.llm.api_key_env,
            &self.auth.jwt_secret_env,
        ];
        if let Some(env) = &self.vector_store.api_key_env {
            if self.vector_store.provider == VectorStoreProvider::Pinecone {
                required.push(env);
            }
        }

        for var in required {
            std::env::var(var).with_context(|| {
                format!(
                    "Environment variable {} not set. Set it in your .env file or as an environment variable.",
                    var
                )
            })?;
        }
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.database.path
    }

    /// Every library name the site knows about (collections plus the configured lists).
    pub fn known_libraries(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .site
            .collections
            .iter()
            .chain(self.site.included_libraries.iter())
            .chain(self.site.private_libraries.iter())
            .map(|s| s.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}
