//! Versioned SQL migrations read from `migrations/NNN_name.sql`.

use rusqlite::{Connection, params};
use std::fs;
use std::path::Path;
use crate::error::{Result, RagchatError};

struct Migration {
    version: u32,
    name: String,
    sql: String,
}

fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Names of applied migrations in version order
pub fn get_applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY version")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(names)
}

fn parse_version(filename: &str) -> Result<u32> {
    let prefix = filename
        .split('_')
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| RagchatError::Config(format!("Invalid migration filename: {}", filename)))?;
    prefix
        .parse()
        .map_err(|_| RagchatError::Config(format!("Invalid migration version in {}", filename)))
}

fn load_migrations(migrations_dir: &Path) -> Result<Vec<Migration>> {
    let mut migrations = Vec::new();

    for entry in fs::read_dir(migrations_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("sql") {
            continue;
        }
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RagchatError::Config("Invalid migration filename".to_string()))?;

        migrations.push(Migration {
            version: parse_version(filename)?,
            name: filename.trim_end_matches(".sql").to_string(),
            sql: fs::read_to_string(&path)?,
        });
    }

    migrations.sort_by_key(|m| m.version);

    if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
        return Err(RagchatError::Config(format!(
            "Duplicate migration version {}: {} and {}",
            pair[0].version, pair[0].name, pair[1].name
        )));
    }

    Ok(migrations)
}

/// Run all pending migrations, each in its own transaction
pub fn run_migrations(conn: &mut Connection, migrations_dir: &Path) -> Result<()> {
    ensure_migrations_table(conn)?;

    let applied = get_applied_migrations(conn)?;
    let mut count = 0;

    for migration in load_migrations(migrations_dir)? {
        if applied.contains(&migration.name) {
            log::debug!("Migration {} already applied, skipping", migration.name);
            continue;
        }

        log::info!("Applying migration: {} (version {})", migration.name, migration.version);

        let tx = conn.transaction()?;
        tx.execute_batch(&migration.sql).map_err(|e| {
            RagchatError::Config(format!("Failed to execute migration {}: {}", migration.name, e))
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;
        count += 1;
    }

    log::info!("Migrations complete ({} applied)", count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()
            .unwrap()
    }

    #[test]
    fn test_load_migrations_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("002_another.sql"), "CREATE TABLE another (id INTEGER);").unwrap();
        fs::write(dir.join("001_test.sql"), "CREATE TABLE test (id INTEGER);").unwrap();
        fs::write(dir.join("README.md"), "ignored").unwrap();

        let migrations = load_migrations(dir).unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].version, 1);
        assert_eq!(migrations[1].name, "002_another");
    }

    #[test]
    fn test_duplicate_versions_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("001_a.sql"), "SELECT 1;").unwrap();
        fs::write(dir.join("001_b.sql"), "SELECT 1;").unwrap();

        assert!(matches!(load_migrations(dir), Err(RagchatError::Config(_))));
    }

    #[test]
    fn test_full_migration_schema_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let mut conn = Connection::open(temp_dir.path().join("test.db")).unwrap();
        let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");

        run_migrations(&mut conn, &migrations_dir).unwrap();
        run_migrations(&mut conn, &migrations_dir).unwrap();

        let tables = table_names(&conn);
        for expected in [
            "answers",
            "answer_likes",
            "answer_votes",
            "audit_log",
            "chunks",
            "documents",
            "login_tokens",
            "rate_limits",
            "schema_migrations",
            "users",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing table {}", expected);
        }

        assert_eq!(get_applied_migrations(&conn).unwrap().len(), 5);
    }
}
