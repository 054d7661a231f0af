use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::config::StoreConfig;

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &StoreConfig) -> Result<Self> {
        let url = config.db_url();
        info!("🗄️  Connecting to database: {}", url);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect(&url)
            .await
            .with_context(|| format!("Failed to connect to database: {}", url))?;

        info!("Running database migrations...");
        self::run_migrations(&pool).await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;
        // Concurrent upserts from several hubs sharing one file.
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&pool)
            .await?;

        info!("✅ Database initialized successfully");

        Ok(Self { pool })
    }
}

const SCHEMA_VERSION: i64 = 1;

pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch()),
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await
            .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        anyhow::bail!(
            "Database schema version {} is newer than supported version {}. Please upgrade the application.",
            current_version,
            SCHEMA_VERSION
        );
    }

    if current_version == SCHEMA_VERSION {
        info!(
            "Database schema is up to date (version {})",
            current_version
        );
        return Ok(());
    }

    info!(
        "Migrating database from version {} to {}",
        current_version, SCHEMA_VERSION
    );

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS status_records (
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL UNIQUE,
            content TEXT,
            status TEXT NOT NULL DEFAULT 'offline',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR REPLACE INTO schema_version (version, description) VALUES (?, ?)")
        .bind(SCHEMA_VERSION)
        .bind("status_records and accounts")
        .execute(pool)
        .await?;
    info!("Schema upgraded to version {}", SCHEMA_VERSION);

    Ok(())
}
