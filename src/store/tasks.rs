//! Task rows: ingest upserts, flag edits, sync bookkeeping.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::trace;
use uuid::Uuid;

use super::{fmt_opt_ts, fmt_ts, parse_opt_ts, parse_ts, Store};
use crate::error::CoreError;
use crate::types::{
    Priority, SyncDirection, SyncStatus, Task, TaskDraft, TaskFlags, TaskSource, UserId,
};

/// What an ingest upsert did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was created.
    Inserted,
    /// An existing row's content changed.
    Updated,
    /// The row already held identical content; nothing was written.
    Unchanged,
}

/// Raw task row as stored.
#[derive(Debug, FromRow)]
pub(crate) struct TaskRow {
    pub id: String,
    pub user_id: String,
    pub source: String,
    pub title: String,
    pub description: Option<String>,
    pub start_at: String,
    pub end_at: String,
    pub attendees: String,
    pub location: Option<String>,
    pub recurrence: Option<String>,
    pub priority: String,
    pub is_critical: i64,
    pub is_urgent: i64,
    pub is_spam: i64,
    pub spam_reason: Option<String>,
    pub spam_score: Option<f64>,
    pub is_completed: i64,
    pub completed_at: Option<String>,
    pub raw_payload: String,
    pub external_id: Option<String>,
    pub sync_status: String,
    pub sync_direction: String,
    pub last_synced_at: Option<String>,
    pub external_updated_at: Option<String>,
    pub sync_error: Option<String>,
    pub sync_attempted_at: Option<String>,
    pub sync_attempts: i64,
    pub remote_snapshot: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskRow {
    pub(crate) fn into_task(self) -> Result<Task, CoreError> {
        Ok(Task {
            id: self.id,
            user: UserId(self.user_id),
            source: TaskSource::parse(&self.source)?,
            title: self.title,
            description: self.description,
            start: parse_ts(&self.start_at)?,
            end: parse_ts(&self.end_at)?,
            attendees: serde_json::from_str(&self.attendees)?,
            location: self.location,
            recurrence: self.recurrence,
            priority: Priority::parse(&self.priority)?,
            is_critical: self.is_critical != 0,
            is_urgent: self.is_urgent != 0,
            is_spam: self.is_spam != 0,
            spam_reason: self.spam_reason,
            spam_score: self.spam_score,
            is_completed: self.is_completed != 0,
            completed_at: parse_opt_ts(self.completed_at)?,
            raw_payload: serde_json::from_str(&self.raw_payload)?,
            external_id: self.external_id,
            sync_status: SyncStatus::parse(&self.sync_status)?,
            sync_direction: SyncDirection::parse(&self.sync_direction)?,
            last_synced_at: parse_opt_ts(self.last_synced_at)?,
            external_updated_at: parse_opt_ts(self.external_updated_at)?,
            sync_error: self.sync_error,
            sync_attempted_at: parse_opt_ts(self.sync_attempted_at)?,
            sync_attempts: u32::try_from(self.sync_attempts).unwrap_or(0),
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Stable identity for items the provider did not tag.
///
/// FNV-1a over the identifying fields; re-ingest of the same item maps to
/// the same row.
pub fn deterministic_task_id(
    user: &UserId,
    source: TaskSource,
    title: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> String {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    let material = format!(
        "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
        source.as_str(),
        title,
        start.timestamp_micros(),
        end.timestamp_micros(),
        user
    );
    for byte in material.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    format!("det-{hash:016x}")
}

impl Store {
    /// Insert or update a task from ingestion, deduplicating by
    /// `(source, external_id)` (or by deterministic id when untagged).
    ///
    /// Content fields are overwritten on update; the user-settable flags
    /// `is_critical`, `is_urgent`, `is_completed`/`completed_at` are
    /// preserved. Rows with identical content are left untouched so
    /// `updated_at` stays stable across idempotent re-ingests.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` when `end < start`; storage errors as
    /// `Internal`.
    pub async fn upsert_ingested_task(
        &self,
        user: &UserId,
        source: TaskSource,
        draft: &TaskDraft,
        now: DateTime<Utc>,
    ) -> Result<(String, UpsertOutcome), CoreError> {
        if draft.end < draft.start {
            return Err(CoreError::invalid(format!(
                "task {:?} ends before it starts",
                draft.title
            )));
        }

        let mut tx = self.pool().begin().await?;

        let existing: Option<TaskRow> = match draft.external_id {
            Some(ref ext) => {
                sqlx::query_as(
                    "SELECT * FROM tasks WHERE user_id = ?1 AND source = ?2 AND external_id = ?3",
                )
                .bind(user.as_str())
                .bind(source.as_str())
                .bind(ext)
                .fetch_optional(&mut *tx)
                .await?
            }
            None => {
                let id = deterministic_task_id(user, source, &draft.title, draft.start, draft.end);
                sqlx::query_as("SELECT * FROM tasks WHERE id = ?1 AND user_id = ?2")
                    .bind(&id)
                    .bind(user.as_str())
                    .fetch_optional(&mut *tx)
                    .await?
            }
        };

        let attendees_json = serde_json::to_string(&draft.attendees)?;
        let payload_json = serde_json::to_string(&draft.raw_payload)?;

        let (task_id, outcome) = match existing {
            None => {
                let id = match draft.external_id {
                    Some(_) => Uuid::new_v4().to_string(),
                    None => {
                        deterministic_task_id(user, source, &draft.title, draft.start, draft.end)
                    }
                };
                let direction = if source == TaskSource::TaskManager {
                    SyncDirection::Bidirectional
                } else {
                    SyncDirection::Inbound
                };
                let last_synced = if source == TaskSource::TaskManager {
                    Some(now)
                } else {
                    None
                };
                sqlx::query(
                    "INSERT INTO tasks (id, user_id, source, title, description, start_at, end_at, \
                     attendees, location, recurrence, priority, is_critical, is_urgent, is_spam, \
                     spam_reason, spam_score, raw_payload, external_id, sync_status, \
                     sync_direction, last_synced_at, external_updated_at, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
                )
                .bind(&id)
                .bind(user.as_str())
                .bind(source.as_str())
                .bind(&draft.title)
                .bind(&draft.description)
                .bind(fmt_ts(draft.start))
                .bind(fmt_ts(draft.end))
                .bind(&attendees_json)
                .bind(&draft.location)
                .bind(&draft.recurrence)
                .bind(draft.priority.as_str())
                .bind(i64::from(draft.is_critical))
                .bind(i64::from(draft.is_urgent))
                .bind(i64::from(draft.is_spam))
                .bind(&draft.spam_reason)
                .bind(draft.spam_score)
                .bind(&payload_json)
                .bind(&draft.external_id)
                .bind(SyncStatus::Synced.as_str())
                .bind(direction.as_str())
                .bind(fmt_opt_ts(last_synced))
                .bind(fmt_opt_ts(draft.external_updated_at))
                .bind(fmt_ts(now))
                .bind(fmt_ts(now))
                .execute(&mut *tx)
                .await?;
                (id, UpsertOutcome::Inserted)
            }
            Some(row) => {
                let unchanged = row.title == draft.title
                    && row.description == draft.description
                    && row.start_at == fmt_ts(draft.start)
                    && row.end_at == fmt_ts(draft.end)
                    && row.attendees == attendees_json
                    && row.location == draft.location
                    && row.recurrence == draft.recurrence
                    && row.priority == draft.priority.as_str()
                    && (row.is_spam != 0) == draft.is_spam
                    && row.spam_reason == draft.spam_reason
                    && row.raw_payload == payload_json;
                if unchanged {
                    (row.id, UpsertOutcome::Unchanged)
                } else {
                    sqlx::query(
                        "UPDATE tasks SET title = ?1, description = ?2, start_at = ?3, \
                         end_at = ?4, attendees = ?5, location = ?6, recurrence = ?7, \
                         priority = ?8, is_spam = ?9, spam_reason = ?10, spam_score = ?11, \
                         raw_payload = ?12, external_updated_at = ?13, updated_at = ?14 \
                         WHERE id = ?15",
                    )
                    .bind(&draft.title)
                    .bind(&draft.description)
                    .bind(fmt_ts(draft.start))
                    .bind(fmt_ts(draft.end))
                    .bind(&attendees_json)
                    .bind(&draft.location)
                    .bind(&draft.recurrence)
                    .bind(draft.priority.as_str())
                    .bind(i64::from(draft.is_spam))
                    .bind(&draft.spam_reason)
                    .bind(draft.spam_score)
                    .bind(&payload_json)
                    .bind(fmt_opt_ts(draft.external_updated_at))
                    .bind(fmt_ts(now))
                    .bind(&row.id)
                    .execute(&mut *tx)
                    .await?;
                    (row.id, UpsertOutcome::Updated)
                }
            }
        };

        tx.commit().await?;
        trace!(task = %task_id, ?outcome, "ingest upsert");
        Ok((task_id, outcome))
    }

    /// Fetch one task scoped to its owner.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn task(&self, user: &UserId, task_id: &str) -> Result<Option<Task>, CoreError> {
        let row: Option<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE id = ?1 AND user_id = ?2")
                .bind(task_id)
                .bind(user.as_str())
                .fetch_optional(self.pool())
                .await?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Fetch a task by external identity.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn task_by_external_id(
        &self,
        user: &UserId,
        source: TaskSource,
        external_id: &str,
    ) -> Result<Option<Task>, CoreError> {
        let row: Option<TaskRow> = sqlx::query_as(
            "SELECT * FROM tasks WHERE user_id = ?1 AND source = ?2 AND external_id = ?3",
        )
        .bind(user.as_str())
        .bind(source.as_str())
        .bind(external_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(TaskRow::into_task).transpose()
    }

    /// List a user's tasks, optionally bounded to `[from, to)` by start
    /// time, ordered by start then id.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn list_tasks(
        &self,
        user: &UserId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Task>, CoreError> {
        let from_text = from.map(fmt_ts).unwrap_or_else(|| "0000".to_owned());
        let to_text = to.map(fmt_ts).unwrap_or_else(|| "9999".to_owned());
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT * FROM tasks WHERE user_id = ?1 AND start_at >= ?2 AND start_at < ?3 \
             ORDER BY start_at, id",
        )
        .bind(user.as_str())
        .bind(&from_text)
        .bind(&to_text)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Overwrite every mutable column of `task` (sync engine writes).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the row does not exist for this user.
    pub async fn save_task(&self, task: &Task) -> Result<(), CoreError> {
        let attendees_json = serde_json::to_string(&task.attendees)?;
        let payload_json = serde_json::to_string(&task.raw_payload)?;
        let result = sqlx::query(
            "UPDATE tasks SET title = ?1, description = ?2, start_at = ?3, end_at = ?4, \
             attendees = ?5, location = ?6, recurrence = ?7, priority = ?8, is_critical = ?9, \
             is_urgent = ?10, is_spam = ?11, spam_reason = ?12, spam_score = ?13, \
             is_completed = ?14, completed_at = ?15, raw_payload = ?16, external_id = ?17, \
             sync_status = ?18, sync_direction = ?19, last_synced_at = ?20, \
             external_updated_at = ?21, sync_error = ?22, sync_attempted_at = ?23, \
             sync_attempts = ?24, updated_at = ?25 \
             WHERE id = ?26 AND user_id = ?27",
        )
        .bind(&task.title)
        .bind(&task.description)
        .bind(fmt_ts(task.start))
        .bind(fmt_ts(task.end))
        .bind(&attendees_json)
        .bind(&task.location)
        .bind(&task.recurrence)
        .bind(task.priority.as_str())
        .bind(i64::from(task.is_critical))
        .bind(i64::from(task.is_urgent))
        .bind(i64::from(task.is_spam))
        .bind(&task.spam_reason)
        .bind(task.spam_score)
        .bind(i64::from(task.is_completed))
        .bind(fmt_opt_ts(task.completed_at))
        .bind(&payload_json)
        .bind(&task.external_id)
        .bind(task.sync_status.as_str())
        .bind(task.sync_direction.as_str())
        .bind(fmt_opt_ts(task.last_synced_at))
        .bind(fmt_opt_ts(task.external_updated_at))
        .bind(&task.sync_error)
        .bind(fmt_opt_ts(task.sync_attempted_at))
        .bind(i64::from(task.sync_attempts))
        .bind(fmt_ts(task.updated_at))
        .bind(&task.id)
        .bind(task.user.as_str())
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    /// Insert a fully-formed task row (sync inbound create, reminder
    /// promotion).
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if a task with the same external identity
    /// already exists.
    pub async fn insert_task(&self, task: &Task) -> Result<(), CoreError> {
        let attendees_json = serde_json::to_string(&task.attendees)?;
        let payload_json = serde_json::to_string(&task.raw_payload)?;
        let result = sqlx::query(
            "INSERT INTO tasks (id, user_id, source, title, description, start_at, end_at, \
             attendees, location, recurrence, priority, is_critical, is_urgent, is_spam, \
             spam_reason, spam_score, is_completed, completed_at, raw_payload, external_id, \
             sync_status, sync_direction, last_synced_at, external_updated_at, sync_error, \
             sync_attempted_at, sync_attempts, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
             ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29)",
        )
        .bind(&task.id)
        .bind(task.user.as_str())
        .bind(task.source.as_str())
        .bind(&task.title)
        .bind(&task.description)
        .bind(fmt_ts(task.start))
        .bind(fmt_ts(task.end))
        .bind(&attendees_json)
        .bind(&task.location)
        .bind(&task.recurrence)
        .bind(task.priority.as_str())
        .bind(i64::from(task.is_critical))
        .bind(i64::from(task.is_urgent))
        .bind(i64::from(task.is_spam))
        .bind(&task.spam_reason)
        .bind(task.spam_score)
        .bind(i64::from(task.is_completed))
        .bind(fmt_opt_ts(task.completed_at))
        .bind(&payload_json)
        .bind(&task.external_id)
        .bind(task.sync_status.as_str())
        .bind(task.sync_direction.as_str())
        .bind(fmt_opt_ts(task.last_synced_at))
        .bind(fmt_opt_ts(task.external_updated_at))
        .bind(&task.sync_error)
        .bind(fmt_opt_ts(task.sync_attempted_at))
        .bind(i64::from(task.sync_attempts))
        .bind(fmt_ts(task.created_at))
        .bind(fmt_ts(task.updated_at))
        .execute(self.pool())
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if super::is_unique_violation(&e) => Err(CoreError::invalid(format!(
                "task with external id {:?} already exists",
                task.external_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply user flag edits with the completion coupling: setting
    /// `is_completed` stamps `completed_at`, clearing it clears the stamp.
    /// Externally-synced tasks flip to `pending` so the next sync cycle
    /// pushes the change.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the task does not exist for this user.
    pub async fn update_task_flags(
        &self,
        user: &UserId,
        task_id: &str,
        flags: TaskFlags,
        now: DateTime<Utc>,
    ) -> Result<Task, CoreError> {
        let mut task = self
            .task(user, task_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;

        if let Some(critical) = flags.is_critical {
            task.is_critical = critical;
        }
        if let Some(urgent) = flags.is_urgent {
            task.is_urgent = urgent;
        }
        if let Some(completed) = flags.is_completed {
            task.is_completed = completed;
            task.completed_at = completed.then_some(now);
        }
        task.updated_at = now;
        if task.source == TaskSource::TaskManager && task.sync_status != SyncStatus::Conflict {
            task.sync_status = SyncStatus::Pending;
        }
        self.save_task(&task).await?;
        Ok(task)
    }

    /// Mark a task done (feedback path). Same coupling and sync rules as
    /// [`Store::update_task_flags`].
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the task does not exist for this user.
    pub async fn mark_task_done(
        &self,
        user: &UserId,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, CoreError> {
        self.update_task_flags(
            user,
            task_id,
            TaskFlags {
                is_completed: Some(true),
                ..TaskFlags::default()
            },
            now,
        )
        .await
    }

    /// Tasks of this user sourced from the task manager.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn task_manager_tasks(&self, user: &UserId) -> Result<Vec<Task>, CoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT * FROM tasks WHERE user_id = ?1 AND source = ?2 ORDER BY start_at, id",
        )
        .bind(user.as_str())
        .bind(TaskSource::TaskManager.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Tasks awaiting an outbound push.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn tasks_with_sync_status(
        &self,
        user: &UserId,
        status: SyncStatus,
    ) -> Result<Vec<Task>, CoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT * FROM tasks WHERE user_id = ?1 AND sync_status = ?2 ORDER BY updated_at, id",
        )
        .bind(user.as_str())
        .bind(status.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Counts of task-manager tasks per sync status, for the status
    /// summary.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn sync_status_counts(
        &self,
        user: &UserId,
    ) -> Result<Vec<(SyncStatus, u64)>, CoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT sync_status, count(*) FROM tasks \
             WHERE user_id = ?1 AND source = ?2 GROUP BY sync_status",
        )
        .bind(user.as_str())
        .bind(TaskSource::TaskManager.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|(status, count)| {
                Ok((SyncStatus::parse(&status)?, u64::try_from(count).unwrap_or(0)))
            })
            .collect()
    }

    /// Latest successful sync timestamp across this user's task-manager
    /// tasks.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn last_sync_time(&self, user: &UserId) -> Result<Option<DateTime<Utc>>, CoreError> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT max(last_synced_at) FROM tasks WHERE user_id = ?1 AND source = ?2",
        )
        .bind(user.as_str())
        .bind(TaskSource::TaskManager.as_str())
        .fetch_optional(self.pool())
        .await?;
        parse_opt_ts(row.and_then(|(v,)| v))
    }

    /// Store the remote version of a conflicted task for later resolution.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn set_remote_snapshot(
        &self,
        user: &UserId,
        task_id: &str,
        snapshot: &serde_json::Value,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE tasks SET remote_snapshot = ?1 WHERE id = ?2 AND user_id = ?3")
            .bind(serde_json::to_string(snapshot)?)
            .bind(task_id)
            .bind(user.as_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Load a conflicted task's stored remote version.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn remote_snapshot(
        &self,
        user: &UserId,
        task_id: &str,
    ) -> Result<Option<serde_json::Value>, CoreError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT remote_snapshot FROM tasks WHERE id = ?1 AND user_id = ?2")
                .bind(task_id)
                .bind(user.as_str())
                .fetch_optional(self.pool())
                .await?;
        match row.and_then(|(v,)| v) {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }
}
