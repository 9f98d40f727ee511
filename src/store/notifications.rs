//! Notification rows and the at-most-once reservation.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::debug;
use uuid::Uuid;

use super::{fmt_opt_ts, fmt_ts, is_unique_violation, parse_opt_ts, parse_ts, Store};
use crate::error::CoreError;
use crate::types::{Notification, NotificationStatus, UserId};

/// Raw notification row as stored.
#[derive(Debug, FromRow)]
struct NotificationRow {
    id: String,
    user_id: String,
    task_id: String,
    plan_id: Option<String>,
    kind: String,
    message: String,
    scheduled_at: String,
    sent_at: Option<String>,
    status: String,
}

impl NotificationRow {
    fn into_notification(self) -> Result<Notification, CoreError> {
        Ok(Notification {
            id: parse_uuid(&self.id)?,
            user: UserId(self.user_id),
            task_id: self.task_id,
            plan_id: self.plan_id.as_deref().map(parse_uuid).transpose()?,
            kind: self.kind,
            message: self.message,
            scheduled_at: parse_ts(&self.scheduled_at)?,
            sent_at: parse_opt_ts(self.sent_at)?,
            status: NotificationStatus::parse(&self.status)?,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, CoreError> {
    Uuid::parse_str(s).map_err(|e| CoreError::internal(format!("bad stored uuid {s:?}: {e}")))
}

impl Store {
    /// Reserve the notification slot for `(user, task, plan)`.
    ///
    /// This is a conditional insert against the partial unique index over
    /// non-dismissed rows — the at-most-once guard. Under concurrent
    /// callers exactly one insert wins; the rest observe the constraint
    /// violation and get [`CoreError::Busy`].
    ///
    /// # Errors
    ///
    /// Returns `Busy` when a non-dismissed row already exists; `Internal`
    /// on storage failure.
    pub async fn reserve_notification(
        &self,
        user: &UserId,
        task_id: &str,
        plan_id: Option<Uuid>,
        kind: &str,
        message: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Notification, CoreError> {
        let id = Uuid::new_v4();
        let result = sqlx::query(
            "INSERT INTO notifications \
             (id, user_id, task_id, plan_id, kind, message, scheduled_at, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(id.to_string())
        .bind(user.as_str())
        .bind(task_id)
        .bind(plan_id.map(|p| p.to_string()))
        .bind(kind)
        .bind(message)
        .bind(fmt_ts(scheduled_at))
        .bind(NotificationStatus::Pending.as_str())
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(Notification {
                id,
                user: user.clone(),
                task_id: task_id.to_owned(),
                plan_id,
                kind: kind.to_owned(),
                message: message.to_owned(),
                scheduled_at,
                sent_at: None,
                status: NotificationStatus::Pending,
            }),
            Err(e) if is_unique_violation(&e) => {
                debug!(user = %user, task = task_id, "notification slot already reserved");
                Err(CoreError::Busy(format!(
                    "notification already reserved for task {task_id}"
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether an existing notification blocks a new nudge for this task.
    ///
    /// Two rules compose:
    /// - any row for the same plan (dismissed included) — the entry was
    ///   already served within this plan;
    /// - a non-dismissed row from any plan — the user has not dealt with
    ///   the previous nudge yet.
    ///
    /// Only dismissing the old notification AND regenerating the plan
    /// clears both. This is a policy pre-check; the reservation's unique
    /// index remains the race-proof guard.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn has_blocking_notification(
        &self,
        user: &UserId,
        task_id: &str,
        plan_id: Option<Uuid>,
    ) -> Result<bool, CoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM notifications \
             WHERE user_id = ?1 AND task_id = ?2 AND (plan_id = ?3 OR status != ?4) \
             LIMIT 1",
        )
        .bind(user.as_str())
        .bind(task_id)
        .bind(plan_id.map(|p| p.to_string()))
        .bind(NotificationStatus::Dismissed.as_str())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.is_some())
    }

    /// Transition a reservation to `sent`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the row does not exist for this user.
    pub async fn mark_notification_sent(
        &self,
        user: &UserId,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE notifications SET status = ?1, sent_at = ?2 WHERE id = ?3 AND user_id = ?4",
        )
        .bind(NotificationStatus::Sent.as_str())
        .bind(fmt_opt_ts(Some(at)))
        .bind(id.to_string())
        .bind(user.as_str())
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("notification {id}")));
        }
        Ok(())
    }

    /// Dismiss a pending or sent notification.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such non-dismissed notification exists for
    /// this user.
    pub async fn dismiss_notification(&self, user: &UserId, id: Uuid) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE notifications SET status = ?1 \
             WHERE id = ?2 AND user_id = ?3 AND status != ?1",
        )
        .bind(NotificationStatus::Dismissed.as_str())
        .bind(id.to_string())
        .bind(user.as_str())
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("notification {id}")));
        }
        Ok(())
    }

    /// List a user's notifications, newest first, optionally filtered by
    /// status.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn list_notifications(
        &self,
        user: &UserId,
        status: Option<NotificationStatus>,
        limit: usize,
    ) -> Result<Vec<Notification>, CoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<NotificationRow> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT id, user_id, task_id, plan_id, kind, message, scheduled_at, \
                     sent_at, status FROM notifications \
                     WHERE user_id = ?1 AND status = ?2 \
                     ORDER BY scheduled_at DESC LIMIT ?3",
                )
                .bind(user.as_str())
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id, user_id, task_id, plan_id, kind, message, scheduled_at, \
                     sent_at, status FROM notifications \
                     WHERE user_id = ?1 \
                     ORDER BY scheduled_at DESC LIMIT ?2",
                )
                .bind(user.as_str())
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
        };
        rows.into_iter()
            .map(NotificationRow::into_notification)
            .collect()
    }
}
