//! Database pool and settings queries

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::error::CoreResult;

// ============================================================================
// Connection Setup
// ============================================================================

/// Open (or create) the database at `path` and run migrations
///
/// WAL journal for concurrent readers while a sync pass writes; `synchronous =
/// FULL` so a queue write is on disk when `enqueue` returns.
pub async fn open(path: &str) -> CoreResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(std::time::Duration::from_secs(5));

    let db = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    migrate(&db).await?;

    tracing::info!("Database initialized with WAL mode at: {}", path);
    Ok(db)
}

/// Open a private in-memory database
///
/// Limited to one connection that is never recycled: every connection to
/// `sqlite::memory:` is a separate database.
pub async fn open_in_memory() -> CoreResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    migrate(&db).await?;
    Ok(db)
}

async fn migrate(db: &SqlitePool) -> CoreResult<()> {
    sqlx::migrate!("./migrations").run(db).await?;
    Ok(())
}

// ============================================================================
// Settings Queries
// ============================================================================

/// Get all settings rows as (key, raw JSON value)
pub async fn get_settings(pool: &SqlitePool) -> CoreResult<Vec<(String, String)>> {
    let rows = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM settings")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Update a single setting
pub async fn update_setting(pool: &SqlitePool, key: &str, value: &str) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at)
        VALUES (?, ?, datetime('now'))
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = datetime('now')
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete all settings (back to defaults)
pub async fn reset_settings(pool: &SqlitePool) -> CoreResult<()> {
    sqlx::query("DELETE FROM settings").execute(pool).await?;
    Ok(())
}
