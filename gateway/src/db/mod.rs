use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod models;

/// Schema files, applied in order. Every statement is idempotent.
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial_schema.sql",
    include_str!("../../migrations/001_initial_schema.sql"),
)];

/// Database-related errors
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Rusqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Database configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Database connection pool
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Create a new database connection pool
    pub fn new(database_path: &str) -> Result<Self> {
        tracing::info!(path = %database_path, "Connecting to database");

        let is_memory = database_path == ":memory:" || database_path.contains("mode=memory");

        if !is_memory {
            if let Some(parent) = std::path::Path::new(database_path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DbError::Config(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        // All pooled connections must see the same in-memory database
        let connection_string = if database_path == ":memory:" {
            "file::memory:?cache=shared"
        } else {
            database_path
        };

        let manager = SqliteConnectionManager::file(connection_string).with_init(move |conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.busy_timeout(Duration::from_secs(5))?;
            if !is_memory {
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            }
            Ok(())
        });

        let pool = Pool::builder().max_size(10).build(manager)?;

        tracing::info!("Database connected successfully");

        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations
    pub fn migrate(&self) -> Result<()> {
        let conn = self.pool.get()?;

        for (name, sql) in MIGRATIONS {
            tracing::info!(migration = %name, "Applying migration");
            conn.execute_batch(sql)?;
        }

        tracing::info!("Migrations completed successfully");
        Ok(())
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Get default database path: `~/.punch-gateway/gateway.db`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".punch-gateway").join("gateway.db"))
    }
}

#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(test)]
static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create a unique in-memory database for testing
/// Each call returns a new isolated database
#[cfg(test)]
pub(crate) fn create_test_db() -> Database {
    let id = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let db_name = format!("file:gatewaytest{}?mode=memory&cache=shared", id);
    let db = Database::new(&db_name).expect("Failed to create test database");
    db.migrate().expect("Failed to run migrations");
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_migrations() {
        let db = create_test_db();

        let conn = db.get_conn().expect("Failed to get connection");
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("Failed to prepare statement");

        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .expect("Failed to query tables")
            .collect::<std::result::Result<Vec<_>, _>>()
            .expect("Failed to collect results");

        for table in [
            "devices",
            "punch_records",
            "time_window_rules",
            "device_commands",
            "employees",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_migrations_are_rerunnable() {
        let db = create_test_db();
        db.migrate().expect("second migration run should be a no-op");
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("gateway.db");
        let path_str = path.to_str().unwrap();

        {
            let db = Database::new(path_str).unwrap();
            db.migrate().unwrap();
            db.get_conn()
                .unwrap()
                .execute(
                    "INSERT INTO device_commands (device_serial, payload, created_at)
                     VALUES ('T001', 'INFO', '2024-01-01T00:00:00Z')",
                    [],
                )
                .unwrap();
        }

        let db = Database::new(path_str).unwrap();
        db.migrate().unwrap();
        let pending: i64 = db
            .get_conn()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM device_commands WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(pending, 1);
    }

    #[test]
    fn test_default_path() {
        let path = Database::default_path().expect("Failed to get default path");
        assert!(path.to_string_lossy().contains(".punch-gateway"));
        assert!(path.to_string_lossy().ends_with("gateway.db"));
    }
}
