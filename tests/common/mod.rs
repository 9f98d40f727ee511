//! Shared test doubles and core assembly helpers.
#![allow(dead_code)] // each test binary uses a different subset

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use dayflow::clock::ManualClock;
use dayflow::config::DayflowConfig;
use dayflow::connectors::oauth::{TokenGrant, TokenRefresher};
use dayflow::connectors::{
    ConnectorError, FetchWindow, ItemSource, Page, RawItem, RemoteTask, RemoteTaskDraft,
    TaskManagerApi,
};
use dayflow::core::{Collaborators, Core};
use dayflow::embed::{EmbedError, Embedder};
use dayflow::llm::{ChatError, ChatRequest, ChatResponse, Chatter};
use dayflow::nudge::deliver::{MailError, Mailer};
use dayflow::store::Store;
use dayflow::types::{Provider, ProviderCredential, UserId};
use dayflow::vector::{VectorError, VectorStore};

/// A fixed reference instant: 2026-03-02 09:00 UTC (a Monday).
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().expect("valid")
}

/// Offset helper.
pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).single().expect("valid")
}

// ---------------------------------------------------------------------------
// Item source
// ---------------------------------------------------------------------------

/// Pages served in order; repeats the configured set per run.
pub struct MockSource {
    pub pages: Vec<Page>,
    pub delay_ms: u64,
    pub calls: AtomicU32,
}

impl MockSource {
    pub fn single_page(items: Vec<RawItem>) -> Self {
        Self {
            pages: vec![Page {
                items,
                next_cursor: None,
            }],
            delay_ms: 0,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ItemSource for MockSource {
    async fn list(
        &self,
        _access_token: &str,
        _window: &FetchWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ConnectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        let index: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let page = self
            .pages
            .get(index)
            .cloned()
            .unwrap_or(Page {
                items: vec![],
                next_cursor: None,
            });
        Ok(page)
    }
}

// ---------------------------------------------------------------------------
// Task manager
// ---------------------------------------------------------------------------

/// In-memory remote task manager with mutable state.
pub struct MockTaskManager {
    pub remote: Mutex<Vec<RemoteTask>>,
    /// When set, every mutating call fails with this status.
    pub fail_with: Mutex<Option<u16>>,
    /// When set, the change feed fails with this status.
    pub fail_changes: Mutex<Option<u16>>,
    pub now: Mutex<DateTime<Utc>>,
}

impl MockTaskManager {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            remote: Mutex::new(vec![]),
            fail_with: Mutex::new(None),
            fail_changes: Mutex::new(None),
            now: Mutex::new(now),
        }
    }

    pub fn seed(&self, task: RemoteTask) {
        self.remote.lock().expect("lock").push(task);
    }

    pub fn set_failure(&self, status: Option<u16>) {
        *self.fail_with.lock().expect("lock") = status;
    }

    pub fn set_changes_failure(&self, status: Option<u16>) {
        *self.fail_changes.lock().expect("lock") = status;
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("lock") = now;
    }

    pub fn remote_by_id(&self, external_id: &str) -> Option<RemoteTask> {
        self.remote
            .lock()
            .expect("lock")
            .iter()
            .find(|t| t.external_id == external_id)
            .cloned()
    }

    fn check_failure(&self) -> Result<(), ConnectorError> {
        Self::status_to_error(*self.fail_with.lock().expect("lock"))
    }

    fn check_changes_failure(&self) -> Result<(), ConnectorError> {
        Self::status_to_error(*self.fail_changes.lock().expect("lock"))
    }

    fn status_to_error(status: Option<u16>) -> Result<(), ConnectorError> {
        match status {
            Some(429) => Err(ConnectorError::RateLimited("throttled".to_owned())),
            Some(status) if status >= 500 => {
                Err(ConnectorError::Transient(format!("status {status}")))
            }
            Some(status) => Err(ConnectorError::InvalidRequest(format!("status {status}"))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TaskManagerApi for MockTaskManager {
    async fn changes_since(
        &self,
        _access_token: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteTask>, ConnectorError> {
        self.check_changes_failure()?;
        let remote = self.remote.lock().expect("lock");
        Ok(remote
            .iter()
            .filter(|t| since.map(|s| t.updated_at > s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn create(
        &self,
        _access_token: &str,
        draft: &RemoteTaskDraft,
    ) -> Result<RemoteTask, ConnectorError> {
        self.check_failure()?;
        let now = *self.now.lock().expect("lock");
        let task = RemoteTask {
            external_id: format!("rem-{}", Uuid::new_v4()),
            title: draft.title.clone(),
            description: draft.description.clone(),
            due: draft.due,
            completed: draft.completed,
            updated_at: now,
            deleted: false,
        };
        self.remote.lock().expect("lock").push(task.clone());
        Ok(task)
    }

    async fn update(
        &self,
        _access_token: &str,
        external_id: &str,
        draft: &RemoteTaskDraft,
    ) -> Result<RemoteTask, ConnectorError> {
        self.check_failure()?;
        let now = *self.now.lock().expect("lock");
        let mut remote = self.remote.lock().expect("lock");
        let task = remote
            .iter_mut()
            .find(|t| t.external_id == external_id)
            .ok_or_else(|| ConnectorError::NotFound(external_id.to_owned()))?;
        task.title = draft.title.clone();
        task.description = draft.description.clone();
        task.due = draft.due;
        task.completed = draft.completed;
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn complete(
        &self,
        _access_token: &str,
        external_id: &str,
    ) -> Result<RemoteTask, ConnectorError> {
        self.check_failure()?;
        let now = *self.now.lock().expect("lock");
        let mut remote = self.remote.lock().expect("lock");
        let task = remote
            .iter_mut()
            .find(|t| t.external_id == external_id)
            .ok_or_else(|| ConnectorError::NotFound(external_id.to_owned()))?;
        task.completed = true;
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn delete(
        &self,
        _access_token: &str,
        external_id: &str,
    ) -> Result<(), ConnectorError> {
        self.check_failure()?;
        let mut remote = self.remote.lock().expect("lock");
        if let Some(task) = remote.iter_mut().find(|t| t.external_id == external_id) {
            task.deleted = true;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// OAuth refresher
// ---------------------------------------------------------------------------

pub struct MockRefresher {
    pub succeed: bool,
}

#[async_trait]
impl TokenRefresher for MockRefresher {
    async fn refresh(
        &self,
        _provider: Provider,
        _refresh_token: &str,
    ) -> Result<TokenGrant, ConnectorError> {
        if self.succeed {
            Ok(TokenGrant {
                access_token: "refreshed".to_owned(),
                refresh_token: None,
                expires_in: Some(3600),
            })
        } else {
            Err(ConnectorError::Auth("refresh token dead".to_owned()))
        }
    }
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

/// Serves queued responses in order, then repeats the last one.
pub struct StubChatter {
    responses: Mutex<Vec<Result<String, ()>>>,
    pub calls: AtomicU32,
}

impl StubChatter {
    pub fn new(responses: Vec<Result<String, ()>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: AtomicU32::new(0),
        }
    }

    pub fn always(text: &str) -> Self {
        Self::new(vec![Ok(text.to_owned())])
    }

    pub fn failing() -> Self {
        Self::new(vec![Err(())])
    }
}

#[async_trait]
impl Chatter for StubChatter {
    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let responses = self.responses.lock().expect("lock");
        let slot = responses
            .get(index)
            .or_else(|| responses.last())
            .cloned()
            .unwrap_or(Err(()));
        match slot {
            Ok(text) => Ok(ChatResponse { text }),
            Err(()) => Err(ChatError::InvalidRequest("stub failure".to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Embedding / vectors / mail
// ---------------------------------------------------------------------------

pub struct MockEmbedder {
    pub fail: bool,
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if self.fail {
            return Err(EmbedError::Unavailable("embedding model down".to_owned()));
        }
        // Fixed toy embedding; tests only care that upserts happen.
        let lead = if text.is_empty() { 0.0 } else { 1.0 };
        Ok(vec![lead, 2.0])
    }

    fn dimensions(&self) -> usize {
        2
    }
}

#[derive(Default)]
pub struct RecordingVectorStore {
    pub upserts: Mutex<Vec<String>>,
}

#[async_trait]
impl VectorStore for RecordingVectorStore {
    async fn upsert(
        &self,
        task_id: &str,
        _embedding: &[f32],
        _metadata: serde_json::Value,
    ) -> Result<(), VectorError> {
        self.upserts.lock().expect("lock").push(task_id.to_owned());
        Ok(())
    }

    async fn query(&self, _embedding: &[f32], _k: usize) -> Result<Vec<String>, VectorError> {
        Ok(vec![])
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<(String, String)>>,
    pub fail: bool,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(
        &self,
        _from: &str,
        to: &str,
        subject: &str,
        _html: &str,
        _text: &str,
    ) -> Result<(), MailError> {
        if self.fail {
            return Err(MailError::Send("relay down".to_owned()));
        }
        self.sent
            .lock()
            .expect("lock")
            .push((to.to_owned(), subject.to_owned()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Everything a test needs to drive the core.
pub struct Harness {
    pub core: Core,
    pub store: Store,
    pub clock: ManualClock,
    pub task_manager: Arc<MockTaskManager>,
}

/// Optional overrides for [`harness`].
#[derive(Default)]
pub struct HarnessOptions {
    pub chatter: Option<Arc<dyn Chatter>>,
    pub sources: HashMap<Provider, Arc<dyn ItemSource>>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub vectors: Option<Arc<dyn VectorStore>>,
    pub mailer: Option<Arc<dyn Mailer>>,
    pub config: Option<DayflowConfig>,
}

/// Build a core over an in-memory store with mock collaborators.
pub async fn harness(options: HarnessOptions) -> Harness {
    let store = Store::open_in_memory().await.expect("in-memory store");
    let clock = ManualClock::new(t0());
    let task_manager = Arc::new(MockTaskManager::new(t0()));

    let mut config = options.config.unwrap_or_default();
    // Tests drive email through the recording mailer when provided.
    if options.mailer.is_some() {
        config.email.email_enabled = true;
    }

    let collab = Collaborators {
        chatter: options.chatter,
        embedder: options.embedder,
        vectors: options.vectors,
        sources: options.sources,
        task_manager: task_manager.clone(),
        refresher: Arc::new(MockRefresher { succeed: true }),
        mailer: options.mailer,
        clock: Arc::new(clock.clone()),
    };
    let core = Core::new(store.clone(), config, collab).expect("core assembles");
    Harness {
        core,
        store,
        clock,
        task_manager,
    }
}

/// Seed a live credential for `(user, provider)`.
pub async fn seed_credential(store: &Store, user: &str, provider: Provider) {
    store
        .put_credential(&ProviderCredential {
            id: Uuid::new_v4(),
            user: UserId::from(user),
            provider,
            access_token: "token".to_owned(),
            refresh_token: Some("refresh".to_owned()),
            expires_at: None,
            scopes: String::new(),
            revoked: false,
            created_at: t0(),
            updated_at: t0(),
        })
        .await
        .expect("credential seeds");
}
