use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::shared::config::DatabaseConfig;
use crate::shared::error::Result;

pub type DbPool = Pool<Sqlite>;

/// Local Store。キャッシュエントリと操作ログの正本を SQLite に置く。
pub struct Database;

impl Database {
    pub async fn initialize(config: &DatabaseConfig) -> Result<DbPool> {
        // Create database directory
        let file_path = config
            .url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");
        if !file_path.starts_with(':') {
            if let Some(parent) = Path::new(file_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Create database connection pool
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout))
            .connect(&config.url)
            .await?;

        info!("Database connected: {}", config.url);

        Self::create_schema(&pool).await?;

        Ok(pool)
    }

    /// スキーマとインデックスを冪等に作成する。何度呼んでも安全。
    pub async fn create_schema(pool: &DbPool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                timestamp INTEGER NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache(expires_at)")
            .execute(pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS operation_log (
                id TEXT PRIMARY KEY,
                operation TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                data BLOB NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                timestamp INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_operation_log_status ON operation_log(status)",
        )
        .execute(pool)
        .await?;

        // FIFO ドレイン用
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_operation_log_status_ts ON operation_log(status, timestamp)",
        )
        .execute(pool)
        .await?;

        info!("Database schema ready");
        Ok(())
    }
}
