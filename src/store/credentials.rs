//! Provider credential rows: one active credential per (user, provider).

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::{fmt_opt_ts, fmt_ts, parse_opt_ts, parse_ts, Store};
use crate::error::CoreError;
use crate::types::{Provider, ProviderCredential, UserId};

/// Raw credential row as stored.
#[derive(Debug, FromRow)]
struct CredentialRow {
    id: String,
    user_id: String,
    provider: String,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<String>,
    scopes: String,
    revoked: i64,
    created_at: String,
    updated_at: String,
}

impl CredentialRow {
    fn into_credential(self) -> Result<ProviderCredential, CoreError> {
        Ok(ProviderCredential {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| CoreError::internal(format!("bad stored uuid: {e}")))?,
            user: UserId(self.user_id),
            provider: Provider::parse(&self.provider)?,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: parse_opt_ts(self.expires_at)?,
            scopes: self.scopes,
            revoked: self.revoked != 0,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

impl Store {
    /// Store (or replace) the credential for `(user, provider)`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn put_credential(&self, credential: &ProviderCredential) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO credentials (id, user_id, provider, access_token, refresh_token, \
             expires_at, scopes, revoked, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(user_id, provider) DO UPDATE SET \
             access_token = ?4, refresh_token = ?5, expires_at = ?6, scopes = ?7, \
             revoked = ?8, updated_at = ?10",
        )
        .bind(credential.id.to_string())
        .bind(credential.user.as_str())
        .bind(credential.provider.as_str())
        .bind(&credential.access_token)
        .bind(&credential.refresh_token)
        .bind(fmt_opt_ts(credential.expires_at))
        .bind(&credential.scopes)
        .bind(i64::from(credential.revoked))
        .bind(fmt_ts(credential.created_at))
        .bind(fmt_ts(credential.updated_at))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// The stored credential for `(user, provider)`, if any.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn credential(
        &self,
        user: &UserId,
        provider: Provider,
    ) -> Result<Option<ProviderCredential>, CoreError> {
        let row: Option<CredentialRow> =
            sqlx::query_as("SELECT * FROM credentials WHERE user_id = ?1 AND provider = ?2")
                .bind(user.as_str())
                .bind(provider.as_str())
                .fetch_optional(self.pool())
                .await?;
        row.map(CredentialRow::into_credential).transpose()
    }

    /// Update the access token after a successful refresh.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn update_credential_tokens(
        &self,
        user: &UserId,
        provider: Provider,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE credentials SET access_token = ?1, \
             refresh_token = COALESCE(?2, refresh_token), expires_at = ?3, revoked = 0, \
             updated_at = ?4 \
             WHERE user_id = ?5 AND provider = ?6",
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(fmt_opt_ts(expires_at))
        .bind(fmt_ts(now))
        .bind(user.as_str())
        .bind(provider.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Users holding a live (non-revoked) credential for `provider`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn users_with_credential(
        &self,
        provider: Provider,
    ) -> Result<Vec<UserId>, CoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT user_id FROM credentials \
             WHERE provider = ?1 AND revoked = 0 ORDER BY user_id",
        )
        .bind(provider.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(user,)| UserId(user)).collect())
    }

    /// Mark the credential revoked after a failed refresh.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn mark_credential_revoked(
        &self,
        user: &UserId,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE credentials SET revoked = 1, updated_at = ?1 \
             WHERE user_id = ?2 AND provider = ?3",
        )
        .bind(fmt_ts(now))
        .bind(user.as_str())
        .bind(provider.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().expect("valid")
    }

    fn credential(user: &str, token: &str) -> ProviderCredential {
        ProviderCredential {
            id: Uuid::new_v4(),
            user: UserId::from(user),
            provider: Provider::Calendar,
            access_token: token.to_owned(),
            refresh_token: Some("refresh".to_owned()),
            expires_at: Some(t(12)),
            scopes: "events.read".to_owned(),
            revoked: false,
            created_at: t(9),
            updated_at: t(9),
        }
    }

    #[tokio::test]
    async fn test_one_active_credential_per_pair() {
        let store = Store::open_in_memory().await.expect("store");
        store.put_credential(&credential("u1", "old")).await.expect("first");
        store.put_credential(&credential("u1", "new")).await.expect("replace");

        let stored = store
            .credential(&UserId::from("u1"), Provider::Calendar)
            .await
            .expect("ok")
            .expect("exists");
        assert_eq!(stored.access_token, "new");
    }

    #[tokio::test]
    async fn test_refresh_updates_and_unrevokes() {
        let store = Store::open_in_memory().await.expect("store");
        let user = UserId::from("u1");
        store.put_credential(&credential("u1", "tok")).await.expect("put");
        store
            .mark_credential_revoked(&user, Provider::Calendar, t(10))
            .await
            .expect("revoked");

        store
            .update_credential_tokens(&user, Provider::Calendar, "tok2", None, Some(t(14)), t(11))
            .await
            .expect("refreshed");

        let stored = store
            .credential(&user, Provider::Calendar)
            .await
            .expect("ok")
            .expect("exists");
        assert_eq!(stored.access_token, "tok2");
        assert!(!stored.revoked);
        assert_eq!(
            stored.refresh_token.as_deref(),
            Some("refresh"),
            "absent refresh token keeps the old one"
        );
    }
}
