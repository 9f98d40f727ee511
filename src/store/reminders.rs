//! Reminder rows: extracted items kept off the plan unless promoted.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::tasks::deterministic_task_id;
use super::{fmt_ts, parse_ts, Store};
use crate::error::CoreError;
use crate::types::{
    Priority, Reminder, SyncDirection, SyncStatus, Task, TaskSource, UserId,
};

/// Content fields for a reminder as produced by extraction.
#[derive(Debug, Clone)]
pub struct ReminderDraft {
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub is_all_day: bool,
    pub raw_payload: serde_json::Value,
    pub external_id: Option<String>,
}

/// Raw reminder row as stored.
#[derive(Debug, FromRow)]
struct ReminderRow {
    id: String,
    user_id: String,
    source: String,
    title: String,
    description: Option<String>,
    start_at: String,
    end_at: String,
    is_all_day: i64,
    external_id: Option<String>,
    raw_payload: String,
    created_at: String,
    updated_at: String,
}

impl ReminderRow {
    fn into_reminder(self) -> Result<Reminder, CoreError> {
        Ok(Reminder {
            id: self.id,
            user: UserId(self.user_id),
            source: TaskSource::parse(&self.source)?,
            title: self.title,
            description: self.description,
            start: parse_ts(&self.start_at)?,
            end: parse_ts(&self.end_at)?,
            is_all_day: self.is_all_day != 0,
            external_id: self.external_id,
            raw_payload: serde_json::from_str(&self.raw_payload)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

impl Store {
    /// Insert or update a reminder from ingestion, deduplicating like
    /// tasks: by `(source, external_id)`, or by deterministic id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` when `end < start`.
    pub async fn upsert_ingested_reminder(
        &self,
        user: &UserId,
        source: TaskSource,
        draft: &ReminderDraft,
        now: DateTime<Utc>,
    ) -> Result<String, CoreError> {
        if draft.end < draft.start {
            return Err(CoreError::invalid(format!(
                "reminder {:?} ends before it starts",
                draft.title
            )));
        }
        let payload_json = serde_json::to_string(&draft.raw_payload)?;

        let existing: Option<(String,)> = match draft.external_id {
            Some(ref ext) => {
                sqlx::query_as(
                    "SELECT id FROM reminders \
                     WHERE user_id = ?1 AND source = ?2 AND external_id = ?3",
                )
                .bind(user.as_str())
                .bind(source.as_str())
                .bind(ext)
                .fetch_optional(self.pool())
                .await?
            }
            None => {
                let id = deterministic_task_id(user, source, &draft.title, draft.start, draft.end);
                sqlx::query_as("SELECT id FROM reminders WHERE id = ?1 AND user_id = ?2")
                    .bind(&id)
                    .bind(user.as_str())
                    .fetch_optional(self.pool())
                    .await?
            }
        };

        match existing {
            Some((id,)) => {
                sqlx::query(
                    "UPDATE reminders SET title = ?1, description = ?2, start_at = ?3, \
                     end_at = ?4, is_all_day = ?5, raw_payload = ?6, updated_at = ?7 \
                     WHERE id = ?8",
                )
                .bind(&draft.title)
                .bind(&draft.description)
                .bind(fmt_ts(draft.start))
                .bind(fmt_ts(draft.end))
                .bind(i64::from(draft.is_all_day))
                .bind(&payload_json)
                .bind(fmt_ts(now))
                .bind(&id)
                .execute(self.pool())
                .await?;
                Ok(id)
            }
            None => {
                let id = match draft.external_id {
                    Some(_) => Uuid::new_v4().to_string(),
                    None => {
                        deterministic_task_id(user, source, &draft.title, draft.start, draft.end)
                    }
                };
                sqlx::query(
                    "INSERT INTO reminders (id, user_id, source, title, description, start_at, \
                     end_at, is_all_day, external_id, raw_payload, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                )
                .bind(&id)
                .bind(user.as_str())
                .bind(source.as_str())
                .bind(&draft.title)
                .bind(&draft.description)
                .bind(fmt_ts(draft.start))
                .bind(fmt_ts(draft.end))
                .bind(i64::from(draft.is_all_day))
                .bind(&draft.external_id)
                .bind(&payload_json)
                .bind(fmt_ts(now))
                .bind(fmt_ts(now))
                .execute(self.pool())
                .await?;
                Ok(id)
            }
        }
    }

    /// Fetch one reminder scoped to its owner.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn reminder(
        &self,
        user: &UserId,
        reminder_id: &str,
    ) -> Result<Option<Reminder>, CoreError> {
        let row: Option<ReminderRow> =
            sqlx::query_as("SELECT * FROM reminders WHERE id = ?1 AND user_id = ?2")
                .bind(reminder_id)
                .bind(user.as_str())
                .fetch_optional(self.pool())
                .await?;
        row.map(ReminderRow::into_reminder).transpose()
    }

    /// Promote a reminder into a full task and remove the reminder row.
    ///
    /// The new task keeps the reminder's identity fields so a later
    /// re-ingest of the same provider item dedups against it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the reminder does not exist for this user;
    /// `InvalidRequest` if a task with the same external identity already
    /// exists.
    pub async fn promote_reminder(
        &self,
        user: &UserId,
        reminder_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, CoreError> {
        let reminder = self
            .reminder(user, reminder_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("reminder {reminder_id}")))?;

        let task = Task {
            id: Uuid::new_v4().to_string(),
            user: user.clone(),
            source: reminder.source,
            title: reminder.title,
            description: reminder.description,
            start: reminder.start,
            end: reminder.end,
            attendees: vec![],
            location: None,
            recurrence: None,
            priority: Priority::Normal,
            is_critical: false,
            is_urgent: false,
            is_spam: false,
            spam_reason: None,
            spam_score: None,
            is_completed: false,
            completed_at: None,
            raw_payload: reminder.raw_payload,
            external_id: reminder.external_id,
            sync_status: SyncStatus::Synced,
            sync_direction: SyncDirection::Inbound,
            last_synced_at: None,
            external_updated_at: None,
            sync_error: None,
            sync_attempted_at: None,
            sync_attempts: 0,
            created_at: now,
            updated_at: now,
        };
        self.insert_task(&task).await?;

        sqlx::query("DELETE FROM reminders WHERE id = ?1 AND user_id = ?2")
            .bind(reminder_id)
            .bind(user.as_str())
            .execute(self.pool())
            .await?;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().expect("valid")
    }

    fn draft(title: &str, external_id: Option<&str>) -> ReminderDraft {
        ReminderDraft {
            title: title.to_owned(),
            description: None,
            start: t(0),
            end: t(23),
            is_all_day: true,
            raw_payload: serde_json::json!({}),
            external_id: external_id.map(str::to_owned),
        }
    }

    #[tokio::test]
    async fn test_upsert_dedups_by_external_id() {
        let store = Store::open_in_memory().await.expect("store");
        let user = UserId::from("u1");

        let id1 = store
            .upsert_ingested_reminder(&user, TaskSource::Calendar, &draft("Dentist", Some("r1")), t(9))
            .await
            .expect("insert");
        let id2 = store
            .upsert_ingested_reminder(&user, TaskSource::Calendar, &draft("Dentist", Some("r1")), t(10))
            .await
            .expect("update");
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn test_promote_creates_task_and_removes_reminder() {
        let store = Store::open_in_memory().await.expect("store");
        let user = UserId::from("u1");

        let id = store
            .upsert_ingested_reminder(&user, TaskSource::Calendar, &draft("Pay rent", Some("r2")), t(9))
            .await
            .expect("insert");

        let task = store.promote_reminder(&user, &id, t(10)).await.expect("promoted");
        assert_eq!(task.title, "Pay rent");
        assert_eq!(task.external_id.as_deref(), Some("r2"));

        assert!(store.reminder(&user, &id).await.expect("ok").is_none());
        assert!(store.task(&user, &task.id).await.expect("ok").is_some());
    }

    #[tokio::test]
    async fn test_promote_missing_is_not_found() {
        let store = Store::open_in_memory().await.expect("store");
        let err = store
            .promote_reminder(&UserId::from("u1"), "nope", t(9))
            .await
            .expect_err("missing");
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
