//! Energy level rows: unique per (user, date), last write wins.

use chrono::{DateTime, NaiveDate, Utc};

use super::{fmt_date, fmt_ts, Store};
use crate::error::CoreError;
use crate::types::UserId;

impl Store {
    /// Record the user's energy for a date, overwriting any prior value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for levels outside `1..=5`.
    pub async fn set_energy(
        &self,
        user: &UserId,
        date: NaiveDate,
        level: u8,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if !(1..=5).contains(&level) {
            return Err(CoreError::invalid(format!(
                "energy level must be 1..=5, got {level}"
            )));
        }
        sqlx::query(
            "INSERT INTO energy_levels (user_id, date, level, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(user_id, date) DO UPDATE SET level = ?3, updated_at = ?4",
        )
        .bind(user.as_str())
        .bind(fmt_date(date))
        .bind(i64::from(level))
        .bind(fmt_ts(now))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// The user's recorded energy for a date, if any.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn energy(&self, user: &UserId, date: NaiveDate) -> Result<Option<u8>, CoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT level FROM energy_levels WHERE user_id = ?1 AND date = ?2")
                .bind(user.as_str())
                .bind(fmt_date(date))
                .fetch_optional(self.pool())
                .await?;
        Ok(row.and_then(|(level,)| u8::try_from(level).ok()))
    }
}
