//! SQLite implementation of the Queue trait from liteque

pub mod queue;
pub mod types;

pub use queue::SqliteQueue;
use anyhow::Context;
use liteque::core::queue::QueueError;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

pub static MIGRATOR: Migrator = sqlx::migrate!();

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (creating if needed) the database at `path` and optionally bring its schema up to date.
///
/// `path` is a file path or `:memory:`. An in-memory database lives as long as its connection,
/// so the pool is pinned to a single connection that is never recycled.
pub async fn connect(path: &str, run_migrations: bool) -> Result<SqlitePool, QueueError> {
    let in_memory = path == ":memory:";
    let options = if in_memory {
        SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory database options")?
    } else {
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
    };
    let options = options.busy_timeout(BUSY_TIMEOUT);

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new()
    };

    let pool = pool_options
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database at '{}'", path))?;

    if run_migrations {
        MIGRATOR
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
    }
    tracing::debug!(path, run_migrations, "Opened task database");
    Ok(pool)
}
