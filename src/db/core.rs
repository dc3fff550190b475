use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, Sqlite,
};
use std::str::FromStr;
use tokio::time::Duration;
use tracing::{info, instrument};

use crate::error::Error;
use crate::TARGET_DB;

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Get access to the database pool
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    #[instrument(target = "db", level = "info")]
    pub async fn new(database_path: &str) -> Result<Self, Error> {
        info!(target: TARGET_DB, "Creating database pool for: {}", database_path);

        let connect_options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", database_path))
                .map_err(Error::Storage)?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5))
                .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;

        info!(target: TARGET_DB, "Database pool created");

        let db = Database { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    /// In-memory database for tests. A single connection keeps every query
    /// on the same SQLite memory instance.
    pub async fn new_in_memory() -> Result<Self, Error> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(Error::Storage)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;

        let db = Database { pool };
        db.initialize_schema().await?;
        Ok(db)
    }
}

/// Canonical timestamp encoding: RFC 3339, whole seconds, `Z` suffix.
/// Stored as TEXT so string comparison matches chronological order.
pub fn iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn now_iso() -> String {
    iso(Utc::now())
}

pub fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
