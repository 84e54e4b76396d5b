//! Shared SQLite state database
//!
//! Uses a deadpool-backed SQLite connection pool to provide async access
//! without blocking the Tokio runtime. The registry and resource-map stores
//! run their queries through [`Database::with_connection`]; every mutation is
//! its own short transaction.

use crate::config::StorageConfig;
use crate::error::{McsdError, Result, StorageError};
use deadpool_sqlite::rusqlite;
use deadpool_sqlite::{Config as DeadpoolConfig, Pool, Runtime};
use std::path::PathBuf;
use tracing::{debug, info};

const SCHEMA_VERSION: i32 = 1;

/// Handle to the state database. Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool,
    db_path: PathBuf,
}

impl Database {
    fn configure_connection(conn: &mut rusqlite::Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;
        Ok(())
    }

    /// Runs a closure against a pooled connection on a blocking worker.
    pub(crate) async fn with_connection<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.pool.get().await.map_err(|e| {
            McsdError::Storage(StorageError::DatabaseError {
                message: format!("Failed to acquire SQLite connection: {e}"),
            })
        })?;

        let result = conn
            .interact(move |conn| {
                Self::configure_connection(conn)?;
                f(conn)
            })
            .await
            .map_err(|e| {
                McsdError::Storage(StorageError::DatabaseError {
                    message: format!("SQLite connection worker failed: {e}"),
                })
            })?;

        result.map_err(|e| {
            McsdError::Storage(StorageError::DatabaseError {
                message: e.to_string(),
            })
        })
    }

    pub async fn new(config: StorageConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = DeadpoolConfig::new(config.db_path.clone())
            .builder(Runtime::Tokio1)
            .map_err(|e| {
                McsdError::Storage(StorageError::InitializationFailed {
                    message: format!("Failed to create SQLite pool builder: {e}"),
                })
            })?
            .max_size(config.connection_pool_size)
            .wait_timeout(Some(std::time::Duration::from_secs(30)))
            .create_timeout(Some(std::time::Duration::from_secs(30)))
            .recycle_timeout(Some(std::time::Duration::from_secs(30)))
            .build()
            .map_err(|e| {
                McsdError::Storage(StorageError::InitializationFailed {
                    message: format!("Failed to create SQLite pool: {e}"),
                })
            })?;

        let db = Self {
            pool,
            db_path: config.db_path,
        };

        db.init_schema().await?;
        info!("State database initialized at {:?}", db.db_path);
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        self.with_connection(move |conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS metadata (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS directory_info (
                    id TEXT PRIMARY KEY,
                    endpoint_address TEXT NOT NULL,
                    failed_sync_count INTEGER NOT NULL DEFAULT 0,
                    failed_attempts INTEGER NOT NULL DEFAULT 0,
                    last_success_sync TEXT,
                    is_ignored INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    modified_at TEXT NOT NULL,
                    deleted_at TEXT,
                    origin TEXT NOT NULL DEFAULT 'provider'
                );

                CREATE TABLE IF NOT EXISTS resource_map (
                    id TEXT PRIMARY KEY,
                    directory_id TEXT NOT NULL,
                    resource_type TEXT NOT NULL,
                    directory_resource_id TEXT NOT NULL,
                    directory_resource_version INTEGER NOT NULL DEFAULT 0,
                    update_client_resource_id TEXT NOT NULL UNIQUE,
                    update_client_resource_version INTEGER NOT NULL DEFAULT 0,
                    last_update TEXT,
                    created_at TEXT NOT NULL,
                    modified_at TEXT NOT NULL,
                    UNIQUE(directory_id, resource_type, directory_resource_id)
                );

                CREATE TABLE IF NOT EXISTS directory_providers (
                    id TEXT PRIMARY KEY,
                    url TEXT NOT NULL UNIQUE,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    last_refresh_at TEXT,
                    created_at TEXT NOT NULL,
                    modified_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS directory_provider_directories (
                    provider_id TEXT NOT NULL,
                    directory_id TEXT NOT NULL,
                    first_seen_at TEXT NOT NULL,
                    last_seen_at TEXT NOT NULL,
                    removed_at TEXT,
                    PRIMARY KEY (provider_id, directory_id)
                );

                CREATE INDEX IF NOT EXISTS idx_resource_map_directory
                    ON resource_map(directory_id);
                CREATE INDEX IF NOT EXISTS idx_resource_map_type
                    ON resource_map(directory_id, resource_type);
                "#,
            )?;

            conn.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
                rusqlite::params![SCHEMA_VERSION.to_string()],
            )?;
            Ok(())
        })
        .await?;

        debug!("SQLite schema initialized (version {})", SCHEMA_VERSION);
        Ok(())
    }
}
