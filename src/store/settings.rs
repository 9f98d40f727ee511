//! Per-user settings: timezone, nudge email, working window overrides.

use sqlx::FromRow;

use super::Store;
use crate::error::CoreError;
use crate::types::{UserId, UserSettings};

/// Raw settings row as stored.
#[derive(Debug, FromRow)]
struct SettingsRow {
    user_id: String,
    timezone: Option<String>,
    email: Option<String>,
    email_enabled: i64,
    work_start: Option<String>,
    work_end: Option<String>,
}

impl Store {
    /// The user's settings; defaults when the row is absent.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn user_settings(&self, user: &UserId) -> Result<UserSettings, CoreError> {
        let row: Option<SettingsRow> =
            sqlx::query_as("SELECT * FROM user_settings WHERE user_id = ?1")
                .bind(user.as_str())
                .fetch_optional(self.pool())
                .await?;
        Ok(match row {
            Some(row) => UserSettings {
                user: UserId(row.user_id),
                timezone: row.timezone,
                email: row.email,
                email_enabled: row.email_enabled != 0,
                work_start: row.work_start,
                work_end: row.work_end,
            },
            None => UserSettings {
                user: user.clone(),
                ..UserSettings::default()
            },
        })
    }

    /// Store (or replace) the user's settings row.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn put_user_settings(&self, settings: &UserSettings) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO user_settings (user_id, timezone, email, email_enabled, work_start, \
             work_end) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(user_id) DO UPDATE SET timezone = ?2, email = ?3, email_enabled = ?4, \
             work_start = ?5, work_end = ?6",
        )
        .bind(settings.user.as_str())
        .bind(&settings.timezone)
        .bind(&settings.email)
        .bind(i64::from(settings.email_enabled))
        .bind(&settings.work_start)
        .bind(&settings.work_end)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_absent_settings_default() {
        let store = Store::open_in_memory().await.expect("store");
        let settings = store
            .user_settings(&UserId::from("u1"))
            .await
            .expect("ok");
        assert!(settings.timezone.is_none());
        assert!(!settings.email_enabled);
    }

    #[tokio::test]
    async fn test_settings_roundtrip() {
        let store = Store::open_in_memory().await.expect("store");
        let settings = UserSettings {
            user: UserId::from("u1"),
            timezone: Some("Europe/Madrid".to_owned()),
            email: Some("u1@example.com".to_owned()),
            email_enabled: true,
            work_start: Some("09:00".to_owned()),
            work_end: Some("18:00".to_owned()),
        };
        store.put_user_settings(&settings).await.expect("stored");

        let loaded = store.user_settings(&UserId::from("u1")).await.expect("ok");
        assert_eq!(loaded.timezone.as_deref(), Some("Europe/Madrid"));
        assert!(loaded.email_enabled);
    }
}
