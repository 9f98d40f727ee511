//! SQLite persistence for every domain entity.
//!
//! The [`Store`] is the sole gateway to the database. Reads and writes go
//! through one connection pool; multi-statement mutations run inside
//! transactions. Two unique indexes carry the concurrency model:
//!
//! - `tasks_external_identity` on `(user_id, source, external_id)` makes
//!   re-ingest idempotent
//! - `notifications_live` on non-dismissed `(user_id, task_id, plan_id)`
//!   makes nudge reservation at-most-once (conditional insert, never
//!   read-then-write)
//!
//! Timestamps persist as RFC 3339 TEXT in UTC; dates as `YYYY-MM-DD`.

pub mod credentials;
pub mod dependencies;
pub mod energy;
pub mod feedback;
pub mod notifications;
pub mod plans;
pub mod reminders;
pub mod settings;
pub mod tasks;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::CoreError;

/// Central store handle; cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the database at `path` and apply migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or migrations fail.
    pub async fn open(path: &str) -> Result<Self, CoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().connect_with(opts).await?;
        let store = Self { pool };
        store.apply_migrations().await?;
        info!(path, "store opened");
        Ok(store)
    }

    /// Open an in-memory database for tests.
    ///
    /// In-memory databases are per-connection, so the pool is limited to a
    /// single connection shared by all queries.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created or migrations fail.
    pub async fn open_in_memory() -> Result<Self, CoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.apply_migrations().await?;
        Ok(store)
    }

    async fn apply_migrations(&self) -> Result<(), CoreError> {
        let schema = include_str!("../../migrations/001_schema.sql");
        sqlx::raw_sql(schema).execute(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool, for migrations and ad-hoc queries in tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Text encoding helpers shared by the submodules
// ---------------------------------------------------------------------------

/// Encode a timestamp as fixed-width RFC 3339 UTC text.
pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Encode an optional timestamp.
pub(crate) fn fmt_opt_ts(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(fmt_ts)
}

/// Decode a timestamp from store text.
pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CoreError::internal(format!("bad stored timestamp {s:?}: {e}")))
}

/// Decode an optional timestamp.
pub(crate) fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, CoreError> {
    s.map(|v| parse_ts(&v)).transpose()
}

/// Encode a date as `YYYY-MM-DD`.
pub(crate) fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// Decode a date from store text.
pub(crate) fn parse_date(s: &str) -> Result<NaiveDate, CoreError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| CoreError::internal(format!("bad stored date {s:?}: {e}")))
}

/// Whether a database error is a unique-constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_apply_on_fresh_database() {
        let store = Store::open_in_memory().await.expect("store opens");
        // Applying twice must be a no-op (idempotent DDL).
        store.apply_migrations().await.expect("re-apply ok");
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let t = DateTime::parse_from_rfc3339("2026-03-01T09:30:00.123456Z")
            .expect("valid")
            .with_timezone(&Utc);
        assert_eq!(parse_ts(&fmt_ts(t)).expect("ok"), t);
    }

    #[test]
    fn test_timestamp_text_sorts_chronologically() {
        let early = DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
            .expect("valid")
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .expect("valid")
            .with_timezone(&Utc);
        assert!(fmt_ts(early) < fmt_ts(late));
    }

    #[test]
    fn test_date_roundtrip() {
        let d = NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid");
        assert_eq!(parse_date(&fmt_date(d)).expect("ok"), d);
    }
}
