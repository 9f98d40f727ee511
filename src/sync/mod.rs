//! Bidirectional reconciliation with the external task manager.
//!
//! One cycle pulls remote changes first, then pushes local ones:
//!
//! 1. **Pull** — remote items changed since the newest `last_synced_at`.
//!    Unknown items create local tasks; locally-unchanged tasks are
//!    overwritten by remote; tasks changed on both sides since the last
//!    sync become conflicts, with the remote version snapshotted for
//!    resolution. Remote deletions complete the local task (nothing is
//!    hard-deleted).
//! 2. **Push** — locally-mutated `pending` tasks go outbound, plus
//!    errored tasks whose retry floor has elapsed (5 minutes doubling per
//!    attempt, capped at one hour).
//!
//! Conflicts are user-resolved via [`SyncEngine::resolve`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::clock::Clock;
use crate::connectors::{RemoteTask, RemoteTaskDraft, TaskManagerApi};
use crate::connectors::oauth::CredentialBroker;
use crate::error::CoreError;
use crate::ingest::InflightGuard;
use crate::limits::{sync_retry_floor, Backoff, RateLimiter};
use crate::store::Store;
use crate::types::{
    Priority, Provider, SyncDirection, SyncStatus, Task, TaskSource, UserId,
};

/// Outbound retry attempts within one cycle before a task goes to `error`.
const PUSH_RETRIES: u32 = 2;

/// Which side wins a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Keep the local version and push it outward.
    Local,
    /// Overwrite local with the stored remote version.
    External,
}

impl ConflictChoice {
    /// Parse from an API string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for anything but `local`/`external`.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "local" => Ok(Self::Local),
            "external" => Ok(Self::External),
            other => Err(CoreError::invalid(format!(
                "unknown conflict choice: {other}"
            ))),
        }
    }
}

/// What one sync cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub pulled: u64,
    pub created_inbound: u64,
    pub overwritten_local: u64,
    pub conflicts_found: u64,
    pub completed_by_remote_delete: u64,
    pub pushed: u64,
    pub push_errors: u64,
}

/// Engine status summary surfaced to the API layer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncSummary {
    /// Whether a live credential exists.
    pub connected: bool,
    /// Newest successful reconciliation timestamp.
    pub last_sync: Option<DateTime<Utc>>,
    /// Worst-state rollup: conflict > error > pending > synced.
    pub sync_status: SyncStatus,
    /// Per-status task counts.
    pub status_counts: HashMap<String, u64>,
    pub conflicts_count: u64,
    pub errors_count: u64,
}

/// The reconciliation engine.
pub struct SyncEngine {
    store: Store,
    broker: Arc<CredentialBroker>,
    api: Arc<dyn TaskManagerApi>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    guard: InflightGuard,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine").finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Wire up the engine.
    pub fn new(
        store: Store,
        broker: Arc<CredentialBroker>,
        api: Arc<dyn TaskManagerApi>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            broker,
            api,
            limiter,
            clock,
            guard: InflightGuard::default(),
        }
    }

    /// Run one full sync cycle for `user`.
    ///
    /// Remote changes always apply before local pushes.
    ///
    /// # Errors
    ///
    /// `Busy` for a duplicate in-flight cycle, `AuthRequired` when the
    /// credential is missing/revoked, `RateLimited`/`Transient` once the
    /// pull retries are exhausted. Push failures degrade per task and do
    /// not fail the cycle.
    pub async fn sync(&self, user: &UserId, cancel: &CancelSignal) -> Result<SyncReport, CoreError> {
        let _slot = self.guard.try_acquire(user, Provider::TaskManager)?;
        let credential = self
            .broker
            .fresh_credential(&self.store, user, Provider::TaskManager)
            .await?;
        let mut report = SyncReport::default();

        // === PULL ===
        cancel.check()?;
        let since = self.store.last_sync_time(user).await?;
        let changes = self
            .pull_changes(user, &credential.access_token, since, cancel)
            .await?;
        report.pulled = u64::try_from(changes.len()).unwrap_or(u64::MAX);

        for remote in &changes {
            cancel.check()?;
            self.apply_remote(user, remote, &mut report).await?;
        }

        // === PUSH ===
        let now = self.clock.now_utc();
        let mut outbound = self.store.tasks_with_sync_status(user, SyncStatus::Pending).await?;
        let errored = self.store.tasks_with_sync_status(user, SyncStatus::Error).await?;
        for task in errored {
            let floor = sync_retry_floor(task.sync_attempts.saturating_sub(1));
            let due = task
                .sync_attempted_at
                .map(|attempted| {
                    now.signed_duration_since(attempted)
                        >= Duration::from_std(floor).unwrap_or_else(|_| Duration::zero())
                })
                .unwrap_or(true);
            if due {
                outbound.push(task);
            } else {
                debug!(task = %task.id, "errored task below retry floor, skipping");
            }
        }

        for task in outbound {
            cancel.check()?;
            // Only push mutations newer than the last reconciliation.
            let locally_newer = match task.last_synced_at {
                Some(last) => task.updated_at > last,
                None => true,
            };
            if !locally_newer {
                continue;
            }
            match self.push_task(user, &credential.access_token, task, cancel).await {
                Ok(()) => report.pushed = report.pushed.saturating_add(1),
                Err(e) => {
                    report.push_errors = report.push_errors.saturating_add(1);
                    warn!(user = %user, error = %e, "outbound push failed");
                }
            }
        }

        info!(
            user = %user,
            pulled = report.pulled,
            pushed = report.pushed,
            conflicts = report.conflicts_found,
            "sync cycle complete"
        );
        Ok(report)
    }

    /// Pull the remote change feed with bounded backoff on throttling.
    async fn pull_changes(
        &self,
        user: &UserId,
        token: &str,
        since: Option<DateTime<Utc>>,
        cancel: &CancelSignal,
    ) -> Result<Vec<RemoteTask>, CoreError> {
        let backoff = Backoff::standard();
        let mut attempt: u32 = 0;
        loop {
            cancel.check()?;
            self.limiter.acquire(user, Provider::TaskManager).await;
            match self.api.changes_since(token, since).await {
                Ok(changes) => return Ok(changes),
                Err(e) if e.is_retryable() && attempt < PUSH_RETRIES => {
                    let delay = backoff.delay(attempt);
                    warn!(user = %user, attempt, error = %e, "change feed fetch failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Apply one remote change to the local store.
    async fn apply_remote(
        &self,
        user: &UserId,
        remote: &RemoteTask,
        report: &mut SyncReport,
    ) -> Result<(), CoreError> {
        let now = self.clock.now_utc();
        let local = self
            .store
            .task_by_external_id(user, TaskSource::TaskManager, &remote.external_id)
            .await?;

        if remote.deleted {
            if let Some(mut task) = local {
                if !task.is_completed {
                    task.is_completed = true;
                    task.completed_at = Some(now);
                }
                task.sync_status = SyncStatus::Synced;
                task.last_synced_at = Some(now);
                task.external_updated_at = Some(remote.updated_at);
                task.updated_at = now;
                self.store.save_task(&task).await?;
                report.completed_by_remote_delete =
                    report.completed_by_remote_delete.saturating_add(1);
            }
            return Ok(());
        }

        match local {
            None => {
                let task = remote_to_task(user, remote, now);
                self.store.insert_task(&task).await?;
                report.created_inbound = report.created_inbound.saturating_add(1);
            }
            Some(mut task) => {
                let local_changed = match task.last_synced_at {
                    Some(last) => task.updated_at > last,
                    None => false,
                };
                let remote_changed = match task.last_synced_at {
                    Some(last) => remote.updated_at > last,
                    None => true,
                };

                if local_changed && remote_changed {
                    task.sync_status = SyncStatus::Conflict;
                    task.external_updated_at = Some(remote.updated_at);
                    self.store.save_task(&task).await?;
                    self.store
                        .set_remote_snapshot(user, &task.id, &serde_json::to_value(remote)?)
                        .await?;
                    report.conflicts_found = report.conflicts_found.saturating_add(1);
                } else if remote_changed {
                    overwrite_with_remote(&mut task, remote, now);
                    self.store.save_task(&task).await?;
                    report.overwritten_local = report.overwritten_local.saturating_add(1);
                }
            }
        }
        Ok(())
    }

    /// Push one local task outbound, with bounded retry.
    async fn push_task(
        &self,
        user: &UserId,
        token: &str,
        mut task: Task,
        cancel: &CancelSignal,
    ) -> Result<(), CoreError> {
        let draft = RemoteTaskDraft {
            title: task.title.clone(),
            description: task.description.clone(),
            due: Some(task.start),
            completed: task.is_completed,
        };
        let backoff = Backoff::standard();
        let mut attempt: u32 = 0;
        let now = self.clock.now_utc();

        let result = loop {
            cancel.check()?;
            self.limiter.acquire(user, Provider::TaskManager).await;
            let call = match task.external_id {
                Some(ref external_id) if task.is_completed => {
                    self.api.complete(token, external_id).await
                }
                Some(ref external_id) => self.api.update(token, external_id, &draft).await,
                None => self.api.create(token, &draft).await,
            };
            match call {
                Ok(remote) => break Ok(remote),
                Err(e) if e.is_retryable() && attempt < PUSH_RETRIES => {
                    let delay = backoff.delay(attempt);
                    warn!(task = %task.id, attempt, error = %e, "push attempt failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(remote) => {
                task.external_id = Some(remote.external_id);
                task.sync_status = SyncStatus::Synced;
                task.last_synced_at = Some(now);
                task.external_updated_at = Some(remote.updated_at);
                task.sync_error = None;
                task.sync_attempted_at = None;
                task.sync_attempts = 0;
                // Deliberately not bumping updated_at: the content did not
                // change, only the sync bookkeeping.
                self.store.save_task(&task).await?;
                Ok(())
            }
            Err(e) => {
                task.sync_status = SyncStatus::Error;
                task.sync_error = Some(e.to_string());
                task.sync_attempted_at = Some(now);
                task.sync_attempts = task.sync_attempts.saturating_add(1);
                self.store.save_task(&task).await?;
                Err(e.into())
            }
        }
    }

    /// Resolve a conflict in the chosen direction.
    ///
    /// `local` pushes the local version outward immediately; `external`
    /// applies the stored remote snapshot. Both clear the error state and
    /// advance `last_synced_at`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown task, `InvalidRequest` when the task is
    /// not in conflict, `AuthRequired`/provider errors from the outbound
    /// push on the `local` path.
    pub async fn resolve(
        &self,
        user: &UserId,
        task_id: &str,
        choice: ConflictChoice,
        cancel: &CancelSignal,
    ) -> Result<Task, CoreError> {
        let task = self
            .store
            .task(user, task_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;
        if task.sync_status != SyncStatus::Conflict {
            return Err(CoreError::invalid(format!(
                "task {task_id} is not in conflict"
            )));
        }
        let now = self.clock.now_utc();

        match choice {
            ConflictChoice::Local => {
                let credential = self
                    .broker
                    .fresh_credential(&self.store, user, Provider::TaskManager)
                    .await?;
                let mut to_push = task;
                to_push.sync_status = SyncStatus::Pending;
                to_push.sync_error = None;
                self.store.save_task(&to_push).await?;
                self.push_task(user, &credential.access_token, to_push, cancel)
                    .await?;
            }
            ConflictChoice::External => {
                let snapshot = self
                    .store
                    .remote_snapshot(user, task_id)
                    .await?
                    .ok_or_else(|| {
                        CoreError::internal(format!("conflicted task {task_id} has no snapshot"))
                    })?;
                let remote: RemoteTask = serde_json::from_value(snapshot)?;
                let mut resolved = task;
                overwrite_with_remote(&mut resolved, &remote, now);
                resolved.sync_error = None;
                self.store.save_task(&resolved).await?;
            }
        }

        self.store
            .set_remote_snapshot(user, task_id, &serde_json::Value::Null)
            .await?;
        let resolved = self
            .store
            .task(user, task_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;
        info!(user = %user, task = task_id, choice = ?choice, "conflict resolved");
        Ok(resolved)
    }

    /// Status summary for the API layer.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn status(&self, user: &UserId) -> Result<SyncSummary, CoreError> {
        let credential = self.store.credential(user, Provider::TaskManager).await?;
        let connected = credential.map(|c| !c.revoked).unwrap_or(false);
        let last_sync = self.store.last_sync_time(user).await?;

        let counts = self.store.sync_status_counts(user).await?;
        let mut status_counts = HashMap::new();
        let mut conflicts_count = 0;
        let mut errors_count = 0;
        let mut pending_count = 0;
        for (status, count) in counts {
            match status {
                SyncStatus::Conflict => conflicts_count = count,
                SyncStatus::Error => errors_count = count,
                SyncStatus::Pending => pending_count = count,
                SyncStatus::Synced => {}
            }
            status_counts.insert(status.as_str().to_owned(), count);
        }

        let sync_status = if conflicts_count > 0 {
            SyncStatus::Conflict
        } else if errors_count > 0 {
            SyncStatus::Error
        } else if pending_count > 0 {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };

        Ok(SyncSummary {
            connected,
            last_sync,
            sync_status,
            status_counts,
            conflicts_count,
            errors_count,
        })
    }
}

/// Run periodic background sync for every connected user.
///
/// Evaluates the cron cadence once a minute; a matching instant since the
/// last run triggers one cycle per user holding a live task-manager
/// credential. Per-user failures log and move on.
pub async fn run_sync_cadence(
    engine: Arc<SyncEngine>,
    schedule: cron::Schedule,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    info!(cadence = %schedule, "background sync started");
    let mut last_run = engine.clock.now_utc();
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = engine.clock.now_utc();
                let due = schedule.after(&last_run).take(1).any(|next| next <= now);
                if !due {
                    continue;
                }
                last_run = now;
                let users = match engine.store.users_with_credential(Provider::TaskManager).await {
                    Ok(users) => users,
                    Err(e) => {
                        warn!(error = %e, "could not list users for background sync");
                        continue;
                    }
                };
                for user in users {
                    match engine.sync(&user, &CancelSignal::never()).await {
                        Ok(report) => debug!(
                            user = %user,
                            pulled = report.pulled,
                            pushed = report.pushed,
                            "background sync cycle done"
                        ),
                        Err(e) => warn!(user = %user, error = %e, "background sync cycle failed"),
                    }
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("background sync shutting down");
                    break;
                }
            }
        }
    }
}

/// Build a local task from a remote item (inbound create).
fn remote_to_task(user: &UserId, remote: &RemoteTask, now: DateTime<Utc>) -> Task {
    let start = remote.due.unwrap_or(remote.updated_at);
    let end = start
        .checked_add_signed(Duration::minutes(30))
        .unwrap_or(start);
    Task {
        id: Uuid::new_v4().to_string(),
        user: user.clone(),
        source: TaskSource::TaskManager,
        title: remote.title.clone(),
        description: remote.description.clone(),
        start,
        end,
        attendees: vec![],
        location: None,
        recurrence: None,
        priority: Priority::Normal,
        is_critical: false,
        is_urgent: false,
        is_spam: false,
        spam_reason: None,
        spam_score: None,
        is_completed: remote.completed,
        completed_at: remote.completed.then_some(now),
        raw_payload: serde_json::to_value(remote).unwrap_or(serde_json::Value::Null),
        external_id: Some(remote.external_id.clone()),
        sync_status: SyncStatus::Synced,
        sync_direction: SyncDirection::Bidirectional,
        last_synced_at: Some(now),
        external_updated_at: Some(remote.updated_at),
        sync_error: None,
        sync_attempted_at: None,
        sync_attempts: 0,
        created_at: now,
        updated_at: now,
    }
}

/// Overwrite local content with the remote version (local unchanged since
/// last sync, or explicit external resolution).
fn overwrite_with_remote(task: &mut Task, remote: &RemoteTask, now: DateTime<Utc>) {
    task.title = remote.title.clone();
    task.description = remote.description.clone();
    if let Some(due) = remote.due {
        let duration = task.end.signed_duration_since(task.start);
        task.start = due;
        task.end = due.checked_add_signed(duration).unwrap_or(due);
    }
    if remote.completed && !task.is_completed {
        task.is_completed = true;
        task.completed_at = Some(now);
    } else if !remote.completed && task.is_completed {
        task.is_completed = false;
        task.completed_at = None;
    }
    task.sync_status = SyncStatus::Synced;
    task.last_synced_at = Some(now);
    task.external_updated_at = Some(remote.updated_at);
    task.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_choice_parse() {
        assert_eq!(ConflictChoice::parse("local").expect("ok"), ConflictChoice::Local);
        assert_eq!(
            ConflictChoice::parse("external").expect("ok"),
            ConflictChoice::External
        );
        assert!(ConflictChoice::parse("both").is_err());
    }

    #[test]
    fn test_overwrite_with_remote_completion_coupling() {
        let now = Utc::now();
        let mut task = remote_to_task(
            &UserId::from("u1"),
            &RemoteTask {
                external_id: "x1".to_owned(),
                title: "old".to_owned(),
                description: None,
                due: None,
                completed: false,
                updated_at: now,
                deleted: false,
            },
            now,
        );
        let remote = RemoteTask {
            external_id: "x1".to_owned(),
            title: "new".to_owned(),
            description: Some("notes".to_owned()),
            due: None,
            completed: true,
            updated_at: now,
            deleted: false,
        };
        overwrite_with_remote(&mut task, &remote, now);
        assert_eq!(task.title, "new");
        assert!(task.is_completed);
        assert!(task.completed_at.is_some());

        let reopened = RemoteTask {
            completed: false,
            ..remote
        };
        overwrite_with_remote(&mut task, &reopened, now);
        assert!(!task.is_completed);
        assert!(task.completed_at.is_none(), "reopening clears the stamp");
    }
}
