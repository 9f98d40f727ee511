//! Append-only feedback rows driving snooze learning.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::{fmt_ts, parse_ts, Store};
use crate::error::CoreError;
use crate::types::{FeedbackAction, TaskFeedback, UserId};

/// Raw feedback row as stored.
#[derive(Debug, FromRow)]
struct FeedbackRow {
    id: String,
    user_id: String,
    task_id: String,
    plan_id: Option<String>,
    action: String,
    snooze_minutes: Option<i64>,
    at: String,
}

impl FeedbackRow {
    fn into_feedback(self) -> Result<TaskFeedback, CoreError> {
        Ok(TaskFeedback {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| CoreError::internal(format!("bad stored uuid: {e}")))?,
            user: UserId(self.user_id),
            task_id: self.task_id,
            plan_id: self
                .plan_id
                .map(|p| {
                    Uuid::parse_str(&p)
                        .map_err(|e| CoreError::internal(format!("bad stored uuid: {e}")))
                })
                .transpose()?,
            action: FeedbackAction::parse(&self.action)?,
            snooze_minutes: self.snooze_minutes.and_then(|m| u32::try_from(m).ok()),
            at: parse_ts(&self.at)?,
        })
    }
}

impl Store {
    /// Append one feedback record.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn record_feedback(&self, feedback: &TaskFeedback) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO feedback (id, user_id, task_id, plan_id, action, snooze_minutes, at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(feedback.id.to_string())
        .bind(feedback.user.as_str())
        .bind(&feedback.task_id)
        .bind(feedback.plan_id.map(|p| p.to_string()))
        .bind(feedback.action.as_str())
        .bind(feedback.snooze_minutes.map(i64::from))
        .bind(fmt_ts(feedback.at))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Feedback recorded at or after `since`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn feedback_since(
        &self,
        user: &UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<TaskFeedback>, CoreError> {
        let rows: Vec<FeedbackRow> = sqlx::query_as(
            "SELECT id, user_id, task_id, plan_id, action, snooze_minutes, at \
             FROM feedback WHERE user_id = ?1 AND at >= ?2 ORDER BY at",
        )
        .bind(user.as_str())
        .bind(fmt_ts(since))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(FeedbackRow::into_feedback).collect()
    }
}
