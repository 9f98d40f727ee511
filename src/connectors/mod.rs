//! External provider clients: calendar, mail, and task manager.
//!
//! Two capability traits cover everything the core needs:
//! - [`ItemSource`] — paginated listing of raw items within a window
//! - [`TaskManagerApi`] — CRUD against the external task manager
//!
//! Connectors receive the access token per call; credential loading and
//! refresh happen upstream in the auth stage ([`oauth`]). Provider wire
//! formats are normalized into [`RawItem`] JSON payloads with a common
//! key vocabulary the extractor understands (`title`, `start`, `end`,
//! `all_day`, `status`, `labels`, `sender`, `body`, `due`, ...).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub mod http;
pub mod oauth;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Time window for a fetch; open bounds mean "all".
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchWindow {
    /// Inclusive lower bound.
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub end: Option<DateTime<Utc>>,
}

/// A raw provider item before extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawItem {
    /// Provider identity, when the provider assigns one.
    pub external_id: Option<String>,
    /// Provider's last-mutation timestamp.
    pub external_updated_at: Option<DateTime<Utc>>,
    /// Normalized provider payload.
    pub payload: serde_json::Value,
}

/// One page of provider results.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Items in this page.
    pub items: Vec<RawItem>,
    /// Cursor for the next page, absent on the last page.
    pub next_cursor: Option<String>,
}

/// A task as the external task manager reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTask {
    /// Provider identity.
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    /// Due timestamp, if the provider tracks one.
    pub due: Option<DateTime<Utc>>,
    pub completed: bool,
    /// Provider's last-mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Set when the provider reports the item deleted.
    pub deleted: bool,
}

/// Outbound task fields pushed to the task manager.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteTaskDraft {
    pub title: String,
    pub description: Option<String>,
    pub due: Option<DateTime<Utc>>,
    pub completed: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from provider connectors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Token rejected (HTTP 401/403); the credential needs a refresh or
    /// reconnect.
    #[error("provider auth failed: {0}")]
    Auth(String),

    /// Provider throttled the call (HTTP 429).
    #[error("provider rate limited: {0}")]
    RateLimited(String),

    /// Retryable network/5xx failure.
    #[error("provider transient failure: {0}")]
    Transient(String),

    /// Provider rejected the request shape.
    #[error("provider invalid request: {0}")]
    InvalidRequest(String),

    /// Response did not match the expected format.
    #[error("provider response parse error: {0}")]
    Parse(String),

    /// The referenced remote item does not exist.
    #[error("remote item not found: {0}")]
    NotFound(String),
}

impl ConnectorError {
    /// Whether a bounded retry may help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transient(_))
    }
}

impl From<ConnectorError> for CoreError {
    fn from(e: ConnectorError) -> Self {
        match e {
            ConnectorError::Auth(msg) => CoreError::AuthRequired(msg),
            ConnectorError::RateLimited(msg) => CoreError::RateLimited(msg),
            ConnectorError::Transient(msg) => CoreError::Transient(msg),
            ConnectorError::InvalidRequest(msg) | ConnectorError::Parse(msg) => {
                CoreError::InvalidRequest(msg)
            }
            ConnectorError::NotFound(msg) => CoreError::NotFound(msg),
        }
    }
}

/// Map an HTTP status + body excerpt into a [`ConnectorError`].
pub(crate) fn classify_status(status: u16, body: &str) -> ConnectorError {
    let summary: String = body.chars().take(256).collect();
    match status {
        401 | 403 => ConnectorError::Auth(format!("status {status}: {summary}")),
        404 => ConnectorError::NotFound(summary),
        429 => ConnectorError::RateLimited(format!("status 429: {summary}")),
        500..=599 => ConnectorError::Transient(format!("status {status}: {summary}")),
        _ => ConnectorError::InvalidRequest(format!("status {status}: {summary}")),
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Paginated item listing for calendar and mail providers (and for the
/// task manager's open-item listing during ingestion).
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// List items in `window` starting at `cursor`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`]; only `Auth` is terminal for a fetch.
    async fn list(
        &self,
        access_token: &str,
        window: &FetchWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ConnectorError>;
}

/// CRUD surface of the external task manager used by the sync engine.
#[async_trait]
pub trait TaskManagerApi: Send + Sync {
    /// Remote items changed since `since` (all items when `None`),
    /// including tombstones for deletions.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] on any provider failure.
    async fn changes_since(
        &self,
        access_token: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteTask>, ConnectorError>;

    /// Create a remote item; returns it with provider identity assigned.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] on any provider failure.
    async fn create(
        &self,
        access_token: &str,
        draft: &RemoteTaskDraft,
    ) -> Result<RemoteTask, ConnectorError>;

    /// Overwrite a remote item's fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] on any provider failure.
    async fn update(
        &self,
        access_token: &str,
        external_id: &str,
        draft: &RemoteTaskDraft,
    ) -> Result<RemoteTask, ConnectorError>;

    /// Move a remote item to its done state.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] on any provider failure.
    async fn complete(
        &self,
        access_token: &str,
        external_id: &str,
    ) -> Result<RemoteTask, ConnectorError>;

    /// Delete a remote item.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] on any provider failure.
    async fn delete(&self, access_token: &str, external_id: &str) -> Result<(), ConnectorError>;
}
