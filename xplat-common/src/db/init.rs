//! Database initialization
//!
//! Opens (or creates) the SQLite database and brings the schema up to date.
//! Every statement is idempotent, so initialization is safe on every start.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Name of the batch number sequence in the `sequences` table
pub const PREDICTION_NUMBER_SEQUENCE: &str = "prediction_number";
/// Name of the record number sequence in the `sequences` table
pub const RECORD_NUMBER_SEQUENCE: &str = "record_number";

/// How long a connection waits on a locked database before failing
pub const BUSY_TIMEOUT_MS: u64 = 5000;

/// First prediction number handed out on an empty database
pub const PREDICTION_NUMBER_START: i64 = 1;
/// First record number handed out on an empty database
pub const RECORD_NUMBER_START: i64 = 1;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Per-connection PRAGMAs; WAL lets the HTTP handlers read while queue workers write
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;
    crate::db::migrations::run_migrations(&pool).await?;

    Ok(pool)
}

/// Create every table and index used by the prediction service
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_sequences_table(pool).await?;
    create_predictions_table(pool).await?;
    create_prediction_records_table(pool).await?;
    create_jobs_table(pool).await?;
    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Named counters backing prediction and record numbers
///
/// Each counter stores the last value handed out, so it is seeded one below
/// the start value.
async fn create_sequences_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sequences (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for (name, start) in [
        (PREDICTION_NUMBER_SEQUENCE, PREDICTION_NUMBER_START),
        (RECORD_NUMBER_SEQUENCE, RECORD_NUMBER_START),
    ] {
        sqlx::query("INSERT OR IGNORE INTO sequences (name, value) VALUES (?, ?)")
            .bind(name)
            .bind(start - 1)
            .execute(pool)
            .await?;
    }

    Ok(())
}

async fn create_predictions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS predictions (
            id TEXT PRIMARY KEY,
            prediction_number INTEGER NOT NULL UNIQUE,
            model_name TEXT NOT NULL,
            df_columns TEXT NOT NULL,
            heatmap TEXT,
            beeswarm TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_predictions_created_at ON predictions(created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_prediction_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prediction_records (
            id TEXT PRIMARY KEY,
            record_number INTEGER NOT NULL UNIQUE,
            prediction_id TEXT NOT NULL REFERENCES predictions(id),
            df_data TEXT NOT NULL,
            proba REAL,
            class INTEGER,
            waterfall TEXT,
            status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (status IN ('PENDING', 'IN_PROGRESS', 'SUCCESS', 'ERROR', 'CANCELED')),
            error_message TEXT,
            version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_prediction_status ON prediction_records(prediction_id, status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Durable job queue
///
/// `run_at`, `created_at` and `claimed_at` are Unix epoch milliseconds so the
/// claim query can compare them numerically.
async fn create_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            prediction_id TEXT NOT NULL,
            record_id TEXT,
            payload TEXT NOT NULL,
            state TEXT NOT NULL
                CHECK (state IN ('waiting', 'active', 'delayed', 'failed')),
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            run_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            claimed_at INTEGER,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state_run_at ON jobs(state, run_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_prediction ON jobs(prediction_id)")
        .execute(pool)
        .await?;

    Ok(())
}
