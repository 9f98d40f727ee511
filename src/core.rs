//! The core facade: wires the components together and exposes every
//! public operation to the (external) HTTP layer and the CLI.
//!
//! Foreground workflows (ingest, plan generation, sync) run to
//! completion under the configured run timeout and accept a cooperative
//! cancellation signal. The nudge scheduler runs as a background task
//! spawned from here.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use chrono_tz::Tz;
use tokio::sync::watch;
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::clock::Clock;
use crate::config::DayflowConfig;
use crate::connectors::oauth::{CredentialBroker, TokenRefresher};
use crate::connectors::{ItemSource, TaskManagerApi};
use crate::embed::Embedder;
use crate::error::CoreError;
use crate::extract::Extractor;
use crate::ingest::report::MetricsSnapshot;
use crate::ingest::{IngestPipeline, report::RunReport};
use crate::limits::RateLimiter;
use crate::llm::{Chatter, RetryingChatter};
use crate::nudge::deliver::Mailer;
use crate::nudge::{self, Nudger, TickStats};
use crate::planner::Planner;
use crate::store::Store;
use crate::sync::{ConflictChoice, SyncEngine, SyncReport, SyncSummary};
use crate::types::{
    DailyPlan, FeedbackAction, Notification, NotificationStatus, PlanStatus, Provider, Reminder,
    Task, TaskFlags, UserId,
};

/// External collaborators injected at construction; tests pass doubles.
pub struct Collaborators {
    /// LLM provider; `None` degrades every LLM path to rules/fallbacks.
    pub chatter: Option<Arc<dyn Chatter>>,
    /// Embedding provider for the encode stage.
    pub embedder: Option<Arc<dyn Embedder>>,
    /// Vector store for the encode stage.
    pub vectors: Option<Arc<dyn crate::vector::VectorStore>>,
    /// Listing connectors per provider.
    pub sources: HashMap<Provider, Arc<dyn ItemSource>>,
    /// Task-manager CRUD connector.
    pub task_manager: Arc<dyn TaskManagerApi>,
    /// OAuth refresh client.
    pub refresher: Arc<dyn TokenRefresher>,
    /// SMTP dispatch; `None` disables email delivery.
    pub mailer: Option<Arc<dyn Mailer>>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// The assembled core.
pub struct Core {
    store: Store,
    config: DayflowConfig,
    clock: Arc<dyn Clock>,
    pipeline: IngestPipeline<Arc<dyn Chatter>>,
    planner: Planner<Arc<dyn Chatter>>,
    nudger: Arc<Nudger>,
    sync: Arc<SyncEngine>,
    plan_guard: Mutex<HashSet<(UserId, NaiveDate)>>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core").finish_non_exhaustive()
    }
}

impl Core {
    /// Assemble the core from config and collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured fallback timezone is invalid.
    pub fn new(
        store: Store,
        config: DayflowConfig,
        collab: Collaborators,
    ) -> Result<Self, CoreError> {
        let default_tz: Tz = config
            .core
            .timezone
            .parse()
            .map_err(|_| CoreError::invalid(format!("bad timezone {:?}", config.core.timezone)))?;

        let clock = collab.clock;
        let broker = Arc::new(CredentialBroker::new(collab.refresher, clock.clone()));
        let limiter = Arc::new(RateLimiter::new(&config.limits, clock.clone()));

        let retrying = |chatter: &Option<Arc<dyn Chatter>>| {
            chatter
                .as_ref()
                .map(|c| RetryingChatter::new(c.clone(), config.llm.llm_retry_budget))
        };

        let extractor = Arc::new(Extractor::new(
            config.spam.spam_llm_threshold,
            retrying(&collab.chatter),
        ));

        let pipeline = IngestPipeline::new(
            store.clone(),
            broker.clone(),
            collab.sources,
            extractor,
            collab.embedder,
            collab.vectors,
            limiter.clone(),
            clock.clone(),
            config.ingest.clone(),
            config.limits.clone(),
        );

        let planner = Planner::new(
            store.clone(),
            retrying(&collab.chatter),
            config.planning.clone(),
            &config.spam,
            default_tz,
            clock.clone(),
        );

        let nudger = Arc::new(Nudger::new(
            store.clone(),
            collab.mailer,
            config.email.clone(),
            config.scheduler.clone(),
            default_tz,
            clock.clone(),
        ));

        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            broker,
            collab.task_manager,
            limiter,
            clock.clone(),
        ));

        Ok(Self {
            store,
            config,
            clock,
            pipeline,
            planner,
            nudger,
            sync,
            plan_guard: Mutex::new(HashSet::new()),
        })
    }

    /// The underlying store (credential bootstrap, tests).
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Spawn the nudge scheduler; returns its join handle.
    pub fn spawn_scheduler(&self, shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(nudge::run_scheduler(self.nudger.clone(), shutdown_rx))
    }

    /// Spawn the background sync loop when a cadence is configured.
    ///
    /// Returns `None` when `scheduler.sync_cadence` is unset.
    pub fn spawn_sync_cadence(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        use std::str::FromStr;
        let cadence = self.config.scheduler.sync_cadence.as_deref()?;
        // Validated at config load; a parse failure here means no cadence.
        let schedule = cron::Schedule::from_str(cadence).ok()?;
        Some(tokio::spawn(crate::sync::run_sync_cadence(
            self.sync.clone(),
            schedule,
            shutdown_rx,
        )))
    }

    /// Run one scheduler tick under the outer budget (tests, CLI).
    ///
    /// # Errors
    ///
    /// Propagates tick failures; budget overrun maps to `Transient`.
    pub async fn tick_once(&self) -> Result<TickStats, CoreError> {
        nudge::tick_once(&self.nudger, self.config.scheduler.tick_budget()).await
    }

    // ── Ingestion ───────────────────────────────────────────────

    /// Run the ingestion pipeline for `(user, source)`.
    ///
    /// # Errors
    ///
    /// See [`IngestPipeline::run`].
    pub async fn run_ingest(
        &self,
        user: &UserId,
        source: Provider,
        cancel: &CancelSignal,
    ) -> Result<RunReport, CoreError> {
        self.pipeline.run(user, source, cancel).await
    }

    /// Ingestion health counters.
    pub fn ingest_metrics(&self) -> MetricsSnapshot {
        self.pipeline.metrics().snapshot()
    }

    // ── Planning ────────────────────────────────────────────────

    /// Generate (or regenerate) the plan for `(user, date)`.
    ///
    /// # Errors
    ///
    /// `Busy` when a generation for the same `(user, date)` is already in
    /// flight; otherwise see [`Planner::generate`].
    pub async fn generate_plan(
        &self,
        user: &UserId,
        date: NaiveDate,
        cancel: &CancelSignal,
    ) -> Result<DailyPlan, CoreError> {
        let key = (user.clone(), date);
        {
            let mut held = self
                .plan_guard
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !held.insert(key.clone()) {
                return Err(CoreError::Busy(format!(
                    "plan generation already running for {user} on {date}"
                )));
            }
        }
        let result = tokio::time::timeout(
            self.config.limits.run_timeout(),
            self.planner.generate(user, date, cancel),
        )
        .await
        .unwrap_or_else(|_| Err(CoreError::Transient("plan generation timed out".to_owned())));

        let mut held = self
            .plan_guard
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        held.remove(&key);
        result
    }

    /// The stored plan for `(user, date)`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn get_plan(
        &self,
        user: &UserId,
        date: NaiveDate,
    ) -> Result<Option<DailyPlan>, CoreError> {
        self.store.plan(user, date).await
    }

    /// Explicit plan lifecycle transition.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown plan.
    pub async fn update_plan_status(
        &self,
        user: &UserId,
        plan_id: Uuid,
        status: PlanStatus,
    ) -> Result<(), CoreError> {
        self.store.update_plan_status(user, plan_id, status).await
    }

    // ── Feedback & notifications ────────────────────────────────

    /// Record a done/snooze action against a task (and plan entry).
    ///
    /// # Errors
    ///
    /// `InvalidRequest` when a snooze omits its duration.
    pub async fn record_feedback(
        &self,
        user: &UserId,
        task_id: &str,
        action: FeedbackAction,
        snooze_minutes: Option<u32>,
        plan_id: Option<Uuid>,
    ) -> Result<(), CoreError> {
        match action {
            FeedbackAction::Done => self.nudger.mark_done(user, task_id, plan_id).await,
            FeedbackAction::Snoozed => {
                let minutes = snooze_minutes
                    .ok_or_else(|| CoreError::invalid("snooze requires a duration"))?;
                self.nudger.snooze(user, task_id, minutes, plan_id).await
            }
        }
    }

    /// List notifications, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn list_notifications(
        &self,
        user: &UserId,
        status: Option<NotificationStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Notification>, CoreError> {
        self.store
            .list_notifications(user, status, limit.unwrap_or(50))
            .await
    }

    /// Dismiss a notification.
    ///
    /// # Errors
    ///
    /// `NotFound` when no such non-dismissed notification exists.
    pub async fn dismiss_notification(
        &self,
        user: &UserId,
        notification_id: Uuid,
    ) -> Result<(), CoreError> {
        self.nudger.dismiss(user, notification_id).await
    }

    // ── Sync ────────────────────────────────────────────────────

    /// Run one task-manager sync cycle.
    ///
    /// # Errors
    ///
    /// See [`SyncEngine::sync`].
    pub async fn sync_task_manager(
        &self,
        user: &UserId,
        cancel: &CancelSignal,
    ) -> Result<SyncReport, CoreError> {
        tokio::time::timeout(
            self.config.limits.run_timeout(),
            self.sync.sync(user, cancel),
        )
        .await
        .unwrap_or_else(|_| Err(CoreError::Transient("sync cycle timed out".to_owned())))
    }

    /// Sync status summary.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn sync_status(&self, user: &UserId) -> Result<SyncSummary, CoreError> {
        self.sync.status(user).await
    }

    /// Resolve a sync conflict.
    ///
    /// # Errors
    ///
    /// See [`SyncEngine::resolve`].
    pub async fn resolve_conflict(
        &self,
        user: &UserId,
        task_id: &str,
        choice: ConflictChoice,
        cancel: &CancelSignal,
    ) -> Result<Task, CoreError> {
        self.sync.resolve(user, task_id, choice, cancel).await
    }

    // ── Tasks, energy, reminders ────────────────────────────────

    /// Record the user's energy for a date (last write wins).
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for levels outside `1..=5`.
    pub async fn set_energy(
        &self,
        user: &UserId,
        date: NaiveDate,
        level: u8,
    ) -> Result<(), CoreError> {
        self.store
            .set_energy(user, date, level, self.clock.now_utc())
            .await
    }

    /// List tasks, optionally bounded by start time.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn list_tasks(
        &self,
        user: &UserId,
        from: Option<chrono::DateTime<chrono::Utc>>,
        to: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<Task>, CoreError> {
        self.store.list_tasks(user, from, to).await
    }

    /// Edit a task's user-settable flags.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown task.
    pub async fn update_task_flags(
        &self,
        user: &UserId,
        task_id: &str,
        flags: TaskFlags,
    ) -> Result<Task, CoreError> {
        self.store
            .update_task_flags(user, task_id, flags, self.clock.now_utc())
            .await
    }

    /// Promote a reminder into a task.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown reminder.
    pub async fn promote_reminder(
        &self,
        user: &UserId,
        reminder_id: &str,
    ) -> Result<Task, CoreError> {
        self.store
            .promote_reminder(user, reminder_id, self.clock.now_utc())
            .await
    }

    /// Fetch a reminder.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn get_reminder(
        &self,
        user: &UserId,
        reminder_id: &str,
    ) -> Result<Option<Reminder>, CoreError> {
        self.store.reminder(user, reminder_id).await
    }

    /// Add a dependency edge between two tasks.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` on self-edges and cycles.
    pub async fn add_task_dependency(
        &self,
        user: &UserId,
        task_id: &str,
        blocked_by_task_id: &str,
        kind: crate::types::DependencyKind,
    ) -> Result<(), CoreError> {
        self.store
            .add_dependency(user, task_id, blocked_by_task_id, kind, self.clock.now_utc())
            .await
    }
}
