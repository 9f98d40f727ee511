//! Staged ingestion pipeline: `Auth → Fetch → Extract → Persist → Encode`.
//!
//! One linear stage list with explicit state threaded between stages.
//! Stage-terminal failures abort the run with a single error (`Result` is
//! the Continue/Terminate pair); item-level failures are collected into
//! the [`RunReport`] and the stage completes. Encoding is optional: its
//! failures degrade the report, never the run.
//!
//! Concurrency: at most one run per `(user, source)` at a time — a second
//! request is rejected with `Busy`, never queued. Different sources for
//! the same user run in parallel.

pub mod report;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Duration;
use serde_json::json;
use tracing::{info, warn};

use crate::cancel::CancelSignal;
use crate::clock::Clock;
use crate::config::{IngestConfig, LimitsConfig};
use crate::connectors::oauth::CredentialBroker;
use crate::connectors::{ConnectorError, FetchWindow, ItemSource, RawItem};
use crate::embed::Embedder;
use crate::error::CoreError;
use crate::extract::{Extractor, NormalizedItem};
use crate::limits::{Backoff, RateLimiter};
use crate::llm::Chatter;
use crate::store::tasks::UpsertOutcome;
use crate::store::Store;
use crate::types::{Provider, UserId};
use crate::vector::VectorStore;

use self::report::{IngestMetrics, RunReport};

/// Transient-fetch retry attempts per page.
const FETCH_RETRIES: u32 = 3;

/// Guard set enforcing one run per (user, source).
#[derive(Debug, Default, Clone)]
pub struct InflightGuard {
    inner: Arc<Mutex<HashSet<(UserId, Provider)>>>,
}

/// RAII slot held for the duration of one run.
#[derive(Debug)]
pub struct InflightSlot {
    key: (UserId, Provider),
    inner: Arc<Mutex<HashSet<(UserId, Provider)>>>,
}

impl InflightGuard {
    /// Claim the slot for `(user, provider)`.
    ///
    /// # Errors
    ///
    /// Returns `Busy` when a run for the same pair is already in flight.
    pub fn try_acquire(&self, user: &UserId, provider: Provider) -> Result<InflightSlot, CoreError> {
        let key = (user.clone(), provider);
        let mut held = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !held.insert(key.clone()) {
            return Err(CoreError::Busy(format!(
                "ingest already running for user {user} source {}",
                provider.as_str()
            )));
        }
        Ok(InflightSlot {
            key,
            inner: self.inner.clone(),
        })
    }
}

impl Drop for InflightSlot {
    fn drop(&mut self) {
        let mut held = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        held.remove(&self.key);
    }
}

/// The ingestion pipeline and its collaborators.
pub struct IngestPipeline<C> {
    store: Store,
    broker: Arc<CredentialBroker>,
    sources: HashMap<Provider, Arc<dyn ItemSource>>,
    extractor: Arc<Extractor<C>>,
    embedder: Option<Arc<dyn Embedder>>,
    vectors: Option<Arc<dyn VectorStore>>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    ingest_config: IngestConfig,
    limits: LimitsConfig,
    guard: InflightGuard,
    metrics: Arc<IngestMetrics>,
}

impl<C> std::fmt::Debug for IngestPipeline<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<C: Chatter> IngestPipeline<C> {
    /// Wire up the pipeline.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        broker: Arc<CredentialBroker>,
        sources: HashMap<Provider, Arc<dyn ItemSource>>,
        extractor: Arc<Extractor<C>>,
        embedder: Option<Arc<dyn Embedder>>,
        vectors: Option<Arc<dyn VectorStore>>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        ingest_config: IngestConfig,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            store,
            broker,
            sources,
            extractor,
            embedder,
            vectors,
            limiter,
            clock,
            ingest_config,
            limits,
            guard: InflightGuard::default(),
            metrics: Arc::new(IngestMetrics::default()),
        }
    }

    /// Process-wide ingestion metrics.
    pub fn metrics(&self) -> Arc<IngestMetrics> {
        self.metrics.clone()
    }

    /// Run the full pipeline for `(user, provider)`.
    ///
    /// # Errors
    ///
    /// `Busy` for a duplicate in-flight run, `AuthRequired` from the auth
    /// stage, `RateLimited`/`Transient` once retries are exhausted.
    pub async fn run(
        &self,
        user: &UserId,
        provider: Provider,
        cancel: &CancelSignal,
    ) -> Result<RunReport, CoreError> {
        let _slot = self.guard.try_acquire(user, provider)?;
        let run = tokio::time::timeout(
            self.limits.run_timeout(),
            self.run_stages(user, provider, cancel),
        )
        .await
        .unwrap_or_else(|_| Err(CoreError::Transient("ingest run timed out".to_owned())));

        match run {
            Ok(report) => {
                self.metrics.record_success(&report);
                info!(
                    user = %user,
                    source = provider.as_str(),
                    fetched = report.fetched,
                    persisted_new = report.persisted_new,
                    persisted_updated = report.persisted_updated,
                    degraded = report.degraded,
                    "ingest run completed"
                );
                Ok(report)
            }
            Err(e) => {
                self.metrics.record_failure();
                warn!(user = %user, source = provider.as_str(), error = %e, "ingest run failed");
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        user: &UserId,
        provider: Provider,
        cancel: &CancelSignal,
    ) -> Result<RunReport, CoreError> {
        let mut report = RunReport::default();

        // === AUTH ===
        cancel.check()?;
        let credential = tokio::time::timeout(
            self.limits.stage_timeout(),
            self.broker.fresh_credential(&self.store, user, provider),
        )
        .await
        .unwrap_or_else(|_| Err(CoreError::Transient("auth stage timed out".to_owned())))?;

        // === FETCH ===
        cancel.check()?;
        let items = tokio::time::timeout(
            self.limits.stage_timeout(),
            self.fetch_all(user, provider, &credential.access_token, cancel),
        )
        .await
        .unwrap_or_else(|_| Err(CoreError::Transient("fetch stage timed out".to_owned())))?;
        report.fetched = u64::try_from(items.len()).unwrap_or(u64::MAX);

        // === EXTRACT + PERSIST ===
        // Extraction and persistence proceed item by item so a cancel or
        // crash mid-stage leaves only whole items committed.
        let mut changed_tasks: Vec<String> = Vec::new();
        for item in &items {
            cancel.check()?;
            let now = self.clock.now_utc();
            let outcome = self
                .extractor
                .extract(provider.task_source(), item, now, cancel)
                .await;
            match outcome {
                NormalizedItem::Task(draft) => {
                    report.extracted = report.extracted.saturating_add(1);
                    if draft.is_spam {
                        report.skipped_spam = report.skipped_spam.saturating_add(1);
                    }
                    match self
                        .store
                        .upsert_ingested_task(user, provider.task_source(), &draft, now)
                        .await
                    {
                        Ok((task_id, UpsertOutcome::Inserted)) => {
                            report.persisted_new = report.persisted_new.saturating_add(1);
                            changed_tasks.push(task_id);
                        }
                        Ok((task_id, UpsertOutcome::Updated)) => {
                            report.persisted_updated = report.persisted_updated.saturating_add(1);
                            changed_tasks.push(task_id);
                        }
                        Ok((_, UpsertOutcome::Unchanged)) => {}
                        Err(e) => report.push_error(format!("persist: {e}")),
                    }
                }
                NormalizedItem::Reminder(draft) => {
                    report.extracted = report.extracted.saturating_add(1);
                    if let Err(e) = self
                        .store
                        .upsert_ingested_reminder(user, provider.task_source(), &draft, now)
                        .await
                    {
                        report.push_error(format!("persist reminder: {e}"));
                    }
                }
                NormalizedItem::Skip(reason) => {
                    report.skipped_other = report.skipped_other.saturating_add(1);
                    if reason.starts_with("extraction_failed") {
                        report.push_error(reason);
                    }
                }
            }
        }

        // === ENCODE ===
        // Best-effort: failures mark the run degraded, never failed.
        if let (Some(embedder), Some(vectors)) = (&self.embedder, &self.vectors) {
            for task_id in &changed_tasks {
                if cancel.is_cancelled() {
                    break;
                }
                match self.encode_task(user, task_id, embedder.as_ref(), vectors.as_ref()).await {
                    Ok(()) => report.encoded = report.encoded.saturating_add(1),
                    Err(e) => {
                        report.degraded = true;
                        report.push_error(format!("encode {task_id}: {e}"));
                    }
                }
            }
        }

        Ok(report)
    }

    /// Drain provider pagination within the configured window.
    async fn fetch_all(
        &self,
        user: &UserId,
        provider: Provider,
        access_token: &str,
        cancel: &CancelSignal,
    ) -> Result<Vec<RawItem>, CoreError> {
        let source = self
            .sources
            .get(&provider)
            .ok_or_else(|| {
                CoreError::invalid(format!("no connector for {}", provider.as_str()))
            })?
            .clone();
        let window = self.window_for(provider);
        let backoff = Backoff::standard();

        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            self.limiter.acquire(user, provider).await;

            let mut attempt: u32 = 0;
            let page = loop {
                cancel.check()?;
                let call = tokio::time::timeout(
                    self.limits.call_timeout(),
                    source.list(access_token, &window, cursor.as_deref()),
                );
                let result = tokio::select! {
                    r = call => r.unwrap_or(Err(ConnectorError::Transient(
                        "list call timed out".to_owned(),
                    ))),
                    () = cancel.cancelled() => {
                        return Err(CoreError::Transient("cancelled".to_owned()));
                    }
                };
                match result {
                    Ok(page) => break page,
                    Err(e) if e.is_retryable() && attempt < FETCH_RETRIES => {
                        let delay = backoff.delay(attempt);
                        warn!(
                            user = %user,
                            source = provider.as_str(),
                            attempt,
                            error = %e,
                            "fetch page failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt = attempt.saturating_add(1);
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            items.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(items)
    }

    fn window_for(&self, provider: Provider) -> FetchWindow {
        let now = self.clock.now_utc();
        match provider {
            Provider::Calendar => FetchWindow {
                start: now.checked_sub_signed(Duration::days(i64::from(
                    self.ingest_config.calendar_days_back,
                ))),
                end: now.checked_add_signed(Duration::days(i64::from(
                    self.ingest_config.calendar_days_forward,
                ))),
            },
            Provider::Mail => FetchWindow {
                start: now.checked_sub_signed(Duration::days(i64::from(
                    self.ingest_config.mail_days_back,
                ))),
                end: None,
            },
            // All open items.
            Provider::TaskManager => FetchWindow::default(),
        }
    }

    async fn encode_task(
        &self,
        user: &UserId,
        task_id: &str,
        embedder: &dyn Embedder,
        vectors: &dyn VectorStore,
    ) -> Result<(), CoreError> {
        let task = self
            .store
            .task(user, task_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;
        let text = match task.description {
            Some(ref description) => format!("{}\n{description}", task.title),
            None => task.title.clone(),
        };
        let embedding = embedder
            .embed(&text)
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;
        vectors
            .upsert(
                task_id,
                &embedding,
                json!({
                    "user": task.user.as_str(),
                    "source": task.source.as_str(),
                    "title": task.title,
                    "start": task.start.to_rfc3339(),
                }),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;
        Ok(())
    }
}
