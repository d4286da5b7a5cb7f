//! Database migrations and initialization.

use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use tracing::info;

/// Pool sized for the writers that share it: the batch flusher, the
/// concurrent per-interval calculation tasks, and the range-query readers.
const POOL_MAX_CONNECTIONS: u32 = 5;

/// Connection pragmas. WAL keeps the batch writer from blocking range-query
/// readers; the busy timeout covers contention between the market+PnL
/// transaction and a concurrent flush.
const CONNECTION_PRAGMAS: &[&str] = &[
    "PRAGMA foreign_keys = ON",
    "PRAGMA busy_timeout = 5000",
    "PRAGMA synchronous = NORMAL",
];

/// Unique keys every idempotent write path relies on. Checked after
/// migration so schema drift fails at startup instead of surfacing later as
/// duplicate trades or double-counted PnL.
const REQUIRED_UNIQUE_KEYS: &[(&str, &[&str])] = &[
    ("trades", &["partition_id", "log_offset"]),
    ("markets", &["partition_id", "log_offset"]),
    ("markets", &["start_time_ms", "end_time_ms"]),
    ("pnls", &["market_start_time_ms", "market_end_time_ms"]),
];

/// Initialize the SQLite database with schema and pragmas.
pub async fn init_db(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).ok();
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(POOL_MAX_CONNECTIONS)
        .after_connect(|conn, _meta| Box::pin(async move { configure_pragmas_conn(conn).await }))
        .connect(&format!("sqlite:{}?mode=rwc", db_path))
        .await?;

    run_migrations(&pool).await?;
    verify_unique_keys(&pool).await?;

    info!("Database initialized successfully at {}", db_path);
    Ok(pool)
}

/// Run all database migrations.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    info!("Running database migrations...");
    let schema_sql = include_str!("schema.sql");

    for statement in schema_sql.split(';') {
        let trimmed = statement.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(pool).await?;
        }
    }

    info!("Migrations completed successfully");
    Ok(())
}

/// Configure SQLite pragmas for performance and reliability.
async fn configure_pragmas_conn(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    // journal_mode returns the actual mode set; must use fetch to get result
    let row = sqlx::query("PRAGMA journal_mode = WAL")
        .fetch_one(&mut *conn)
        .await?;
    let journal_mode: String = row.get(0);
    info!("SQLite journal_mode set to: {}", journal_mode);

    for pragma in CONNECTION_PRAGMAS {
        sqlx::query(pragma).execute(&mut *conn).await?;
    }

    Ok(())
}

/// Fail fast unless every unique key the idempotent writes depend on is
/// enforced by the live schema.
async fn verify_unique_keys(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for (table, columns) in REQUIRED_UNIQUE_KEYS {
        if !has_unique_key(pool, table, columns).await? {
            return Err(sqlx::Error::Protocol(format!(
                "table {} is missing the unique key ({})",
                table,
                columns.join(", ")
            )));
        }
    }
    Ok(())
}

async fn has_unique_key(
    pool: &SqlitePool,
    table: &str,
    columns: &[&str],
) -> Result<bool, sqlx::Error> {
    // Table and column names come from the constant above, never from input.
    let indexes = sqlx::query(&format!("PRAGMA index_list({table})"))
        .fetch_all(pool)
        .await?;

    let mut wanted: Vec<&str> = columns.to_vec();
    wanted.sort_unstable();

    for index in &indexes {
        let unique: i64 = index.get("unique");
        if unique == 0 {
            continue;
        }
        let name: String = index.get("name");
        let info = sqlx::query(&format!("PRAGMA index_info({name})"))
            .fetch_all(pool)
            .await?;
        let mut indexed: Vec<String> = info
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();
        indexed.sort_unstable();

        if indexed == wanted {
            return Ok(true);
        }
    }
    Ok(false)
}
