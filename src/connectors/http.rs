//! HTTP JSON implementations of the connector traits.
//!
//! Providers are assumed to expose a JSON listing endpoint
//! (`GET {base_url}/items?from=&to=&cursor=`) and, for the task manager,
//! a CRUD surface under `{base_url}/tasks`. Responses carry
//! `external_id` and `updated_at` per item.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{
    classify_status, ConnectorError, FetchWindow, ItemSource, Page, RawItem, RemoteTask,
    RemoteTaskDraft, TaskManagerApi,
};

/// Paginated listing client for one provider endpoint.
#[derive(Debug, Clone)]
pub struct HttpItemSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpItemSource {
    /// Create a listing client for the given base URL.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ItemSource for HttpItemSource {
    async fn list(
        &self,
        access_token: &str,
        window: &FetchWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ConnectorError> {
        let url = format!("{}/items", self.base_url);
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(start) = window.start {
            query.push(("from", rfc3339(start)));
        }
        if let Some(end) = window.end {
            query.push(("to", rfc3339(end)));
        }
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_owned()));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .query(&query)
            .send()
            .await
            .map_err(|e| ConnectorError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        let payload = response
            .text()
            .await
            .map_err(|e| ConnectorError::Transient(format!("body read failed: {e}")))?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &payload));
        }

        let parsed: ListResponse =
            serde_json::from_str(&payload).map_err(|e| ConnectorError::Parse(e.to_string()))?;

        let items = parsed
            .items
            .into_iter()
            .map(|item| RawItem {
                external_id: item.external_id,
                external_updated_at: item.updated_at,
                payload: item.payload,
            })
            .collect();

        Ok(Page {
            items,
            next_cursor: parsed.next_cursor,
        })
    }
}

/// Listing wire format.
#[derive(Debug, Deserialize)]
struct ListResponse {
    items: Vec<ListItem>,
    next_cursor: Option<String>,
}

/// One wire item.
#[derive(Debug, Deserialize)]
struct ListItem {
    external_id: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Task manager
// ---------------------------------------------------------------------------

/// CRUD client for the external task manager.
#[derive(Debug, Clone)]
pub struct HttpTaskManager {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTaskManager {
    /// Create a CRUD client for the given base URL.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
        }
    }

    async fn send_for_task(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<RemoteTask, ConnectorError> {
        let response = request
            .send()
            .await
            .map_err(|e| ConnectorError::Transient(format!("request failed: {e}")))?;
        let status = response.status();
        let payload = response
            .text()
            .await
            .map_err(|e| ConnectorError::Transient(format!("body read failed: {e}")))?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &payload));
        }
        let task: WireTask =
            serde_json::from_str(&payload).map_err(|e| ConnectorError::Parse(e.to_string()))?;
        Ok(task.into_remote())
    }
}

#[async_trait]
impl TaskManagerApi for HttpTaskManager {
    async fn changes_since(
        &self,
        access_token: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteTask>, ConnectorError> {
        let url = format!("{}/tasks/changes", self.base_url);
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(since) = since {
            query.push(("since", rfc3339(since)));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .query(&query)
            .send()
            .await
            .map_err(|e| ConnectorError::Transient(format!("request failed: {e}")))?;
        let status = response.status();
        let payload = response
            .text()
            .await
            .map_err(|e| ConnectorError::Transient(format!("body read failed: {e}")))?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &payload));
        }

        let parsed: ChangesResponse =
            serde_json::from_str(&payload).map_err(|e| ConnectorError::Parse(e.to_string()))?;
        Ok(parsed
            .tasks
            .into_iter()
            .map(WireTask::into_remote)
            .collect())
    }

    async fn create(
        &self,
        access_token: &str,
        draft: &RemoteTaskDraft,
    ) -> Result<RemoteTask, ConnectorError> {
        let url = format!("{}/tasks", self.base_url);
        self.send_for_task(
            self.client
                .post(&url)
                .bearer_auth(access_token)
                .json(draft),
        )
        .await
    }

    async fn update(
        &self,
        access_token: &str,
        external_id: &str,
        draft: &RemoteTaskDraft,
    ) -> Result<RemoteTask, ConnectorError> {
        let url = format!("{}/tasks/{external_id}", self.base_url);
        self.send_for_task(self.client.put(&url).bearer_auth(access_token).json(draft))
            .await
    }

    async fn complete(
        &self,
        access_token: &str,
        external_id: &str,
    ) -> Result<RemoteTask, ConnectorError> {
        let url = format!("{}/tasks/{external_id}/complete", self.base_url);
        self.send_for_task(
            self.client
                .post(&url)
                .bearer_auth(access_token)
                .json(&json!({})),
        )
        .await
    }

    async fn delete(&self, access_token: &str, external_id: &str) -> Result<(), ConnectorError> {
        let url = format!("{}/tasks/{external_id}", self.base_url);
        let response = self
            .client
            .delete(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ConnectorError::Transient(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let payload = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &payload));
        }
        Ok(())
    }
}

/// Task wire format shared by the changes feed and CRUD responses.
#[derive(Debug, Deserialize)]
struct WireTask {
    external_id: String,
    title: String,
    description: Option<String>,
    due: Option<DateTime<Utc>>,
    #[serde(default)]
    completed: bool,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    deleted: bool,
}

impl WireTask {
    fn into_remote(self) -> RemoteTask {
        RemoteTask {
            external_id: self.external_id,
            title: self.title,
            description: self.description,
            due: self.due,
            completed: self.completed,
            updated_at: self.updated_at,
            deleted: self.deleted,
        }
    }
}

/// Changes feed wire format.
#[derive(Debug, Deserialize)]
struct ChangesResponse {
    tasks: Vec<WireTask>,
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}
