use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use hgr_types::{HangarError, Result};

/// Per-run metrics store backed by a single SQLite file.
///
/// The rollback journal is used instead of WAL so that, once closed, the
/// database is one self-contained file that can be uploaded as-is.
pub struct MetricsStore {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl MetricsStore {
    /// Open (creating if needed) the store at `path` and initialize its schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .busy_timeout(std::time::Duration::from_millis(5000));

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(opts)
            .await
            .map_err(|e| HangarError::Database(format!("Failed to connect: {e}")))?;

        let store = Self {
            pool,
            path: Some(path.to_path_buf()),
        };
        store.initialize().await?;
        debug!(path = %path.display(), "Metrics store opened");
        Ok(store)
    }

    /// Create a new in-memory store (for testing).
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::new().filename(":memory:");

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| HangarError::Database(format!("Failed to connect: {e}")))?;

        let store = Self { pool, path: None };
        store.initialize().await?;
        Ok(store)
    }

    /// Initialize tables and indexes.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                load_one REAL NOT NULL,
                load_five REAL NOT NULL,
                load_fifteen REAL NOT NULL,
                mem_used INTEGER NOT NULL,
                mem_total INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| HangarError::Database(format!("Create samples table: {e}")))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                detail TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| HangarError::Database(format!("Create events table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_samples_time ON samples(timestamp)")
            .execute(&self.pool)
            .await
            .map_err(|e| HangarError::Database(format!("Create samples index: {e}")))?;

        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Backing file, if the store is file-based.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Close all connections so the file is complete on disk.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Metrics store closed");
    }
}
