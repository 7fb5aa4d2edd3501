use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ragchat::auth::{JwtKeys, Role};
use ragchat::cache::EmbeddingCache;
use ragchat::chat::QaChain;
use ragchat::config::VectorStoreProvider;
use ragchat::db::Db;
use ragchat::embeddings::{Embedder, OpenAIEmbedder};
use ragchat::http::{self, AppState};
use ragchat::llm::{ChatModel, OpenAIChat};
use ragchat::retrieval::{PineconeStore, Retriever, SqliteVectorStore, VectorStore};
use ragchat::Config;
use std::sync::Arc;
use std::time::Duration;

/// Retrieval-augmented chat server
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
    /// Delete expired rate-limit counters, login tokens and audit entries
    Purge,
    /// Create or promote an active account without an invite
    Bootstrap {
        email: String,
        #[arg(long, default_value = "superuser")]
        role: String,
    },
}

fn env_secret(var: &str) -> Result<String> {
    std::env::var(var).with_context(|| {
        format!(
            "Environment variable {} not set. Set it in your .env file or as an environment variable.",
            var
        )
    })
}

/// Build the embedder with an optional LRU query-embedding cache.
fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    let api_key = env_secret(&config.embeddings.api_key_env)?;

    let cache = if config.embeddings.cache_capacity > 0 {
        Some(Arc::new(EmbeddingCache::new(config.embeddings.cache_capacity)))
    } else {
        None
    };

    let embedder = OpenAIEmbedder::new(
        config.embeddings.api_base.clone(),
        api_key,
        config.embeddings.model.clone(),
        config.embeddings.dimensions,
        cache,
    )?;
    Ok(Arc::new(embedder))
}

fn build_store(config: &Config, db: &Db) -> Result<Arc<dyn VectorStore>> {
    let vs = &config.vector_store;
    let store: Arc<dyn VectorStore> = match vs.provider {
        VectorStoreProvider::Sqlite => Arc::new(SqliteVectorStore::new(db.clone(), vs.index_name.clone())),
        VectorStoreProvider::Pinecone => {
            let host = vs.host.as_deref().context("vector_store.host is required for pinecone")?;
            let key_env = vs
                .api_key_env
                .as_deref()
                .context("vector_store.api_key_env is required for pinecone")?;
            Arc::new(PineconeStore::new(
                host,
                vs.index_name.clone(),
                env_secret(key_env)?,
                vs.namespace.clone(),
            )?)
        }
    };
    log::info!("Vector store: {}", store.describe());
    Ok(store)
}

fn build_chat_model(config: &Config) -> Result<Arc<dyn ChatModel>> {
    let api_key = env_secret(&config.llm.api_key_env)?;
    let model = OpenAIChat::new(
        config.llm.api_base.clone(),
        api_key,
        Duration::from_secs(config.llm.request_timeout_secs),
    )?;
    Ok(Arc::new(model))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server().await,
        Command::Migrate => {
            let (_, db) = open_database(false).await?;
            log::info!("Database at {} is up to date", db.path().display());
            Ok(())
        }
        Command::Purge => {
            let (_, db) = open_database(false).await?;
            let removed = db.purge_expired(chrono::Utc::now().timestamp()).await?;
            log::info!("Purged {} expired rows", removed);
            Ok(())
        }
        Command::Bootstrap { email, role } => {
            let role = Role::parse(&role).with_context(|| format!("Unknown role '{}'", role))?;
            let (_, db) = open_database(false).await?;
            let user = ragchat::auth::AccountStore::new(db).bootstrap(&email, role).await?;
            log::info!("Account {} is active with role {}", user.email, user.role.as_str());
            Ok(())
        }
    }
}

/// Load config, start logging and bring the schema up to date.
async fn open_database(require_secrets: bool) -> Result<(Config, Db)> {
    let config = if require_secrets { Config::load()? } else { Config::read()? };

    // RUST_LOG wins over the configured level
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", &config.server.log_level))
        .init();

    let db = Db::new(config.db_path());
    db.migrate(&config.database.migrations_dir)
        .await
        .with_context(|| format!("Failed to migrate {}", config.db_path().display()))?;
    Ok((config, db))
}

async fn run_server() -> Result<()> {
    let (config, db) = open_database(true).await?;
    log::info!("Starting RAGChat v{} for {}", env!("CARGO_PKG_VERSION"), config.site.name);

    let retriever = Retriever::new(build_embedder(&config)?, build_store(&config, &db)?);
    let chain = QaChain::new(build_chat_model(&config)?, retriever, config.llm.default_model.clone());

    let secret = env_secret(&config.auth.jwt_secret_env)?;
    let jwt = JwtKeys::new(secret.as_bytes(), &config.auth.issuer, config.auth.token_ttl_hours)?;

    let state = AppState::new(Arc::new(config), db, chain, jwt);
    http::serve(state).await?;
    Ok(())
}
