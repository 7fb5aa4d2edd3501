use rusqlite::Connection;
use std::path::Path;
use tokio::task;
use crate::error::{Result, RagchatError};

pub mod migrate;

/// WAL for concurrent readers while the chat pipeline writes answers.
/// `busy_timeout` comes first so the pragmas after it wait on a locked file.
const CONNECTION_PRAGMAS: &str = "PRAGMA busy_timeout = 5000; \
     PRAGMA journal_mode = WAL; \
     PRAGMA synchronous = NORMAL; \
     PRAGMA foreign_keys = ON; \
     PRAGMA temp_store = MEMORY;";

/// Database connection wrapper
#[derive(Debug, Clone)]
pub struct Db {
    path: std::path::PathBuf,
}

impl Db {
    /// Create a new database connection manager
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            path: db_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new database connection with the standard pragmas applied
    pub fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .map_err(RagchatError::Database)?;
        conn.execute_batch(CONNECTION_PRAGMAS)?;
        Ok(conn)
    }

    /// Execute a closure with a database connection in a blocking task
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        task::spawn_blocking(move || {
            let mut conn = db.open_connection()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| RagchatError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Database task failed: {}", e),
        )))?
    }

    /// Apply pending migrations from `migrations_dir`.
    pub async fn migrate(&self, migrations_dir: &Path) -> Result<()> {
        let dir = migrations_dir.to_path_buf();
        self.with_connection(move |conn| migrate::run_migrations(conn, &dir))
            .await
    }

    /// Delete rows whose `expires_at` lies in the past. Returns the number of rows removed.
    pub async fn purge_expired(&self, now: i64) -> Result<usize> {
        self.with_connection(move |conn| {
            let mut removed = 0;
            for table in ["rate_limits", "login_tokens", "audit_log"] {
                removed += conn.execute(
                    &format!("DELETE FROM {} WHERE expires_at <= ?1", table),
                    [now],
                )?;
            }
            Ok(removed)
        })
        .await
    }
}
