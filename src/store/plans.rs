//! Daily plan rows and their entries.
//!
//! A plan and its entries form one unit: replacement deletes and inserts
//! inside a single transaction, so readers never observe a half-written
//! plan.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::{fmt_date, fmt_ts, parse_date, parse_ts, Store};
use crate::error::CoreError;
use crate::types::{DailyPlan, EntryStatus, PlanEntry, PlanStatus, UserId};

/// Raw plan row as stored.
#[derive(Debug, FromRow)]
struct PlanRow {
    id: String,
    user_id: String,
    date: String,
    status: String,
    energy_level: Option<i64>,
    generated_at: String,
}

/// Raw entry row as stored.
#[derive(Debug, FromRow)]
struct EntryRow {
    task_id: String,
    title: String,
    predicted_start: String,
    predicted_end: String,
    priority_score: f64,
    is_critical: i64,
    is_urgent: i64,
    action_plan: String,
    status: String,
}

impl EntryRow {
    fn into_entry(self) -> Result<PlanEntry, CoreError> {
        Ok(PlanEntry {
            task_id: self.task_id,
            title: self.title,
            predicted_start: parse_ts(&self.predicted_start)?,
            predicted_end: parse_ts(&self.predicted_end)?,
            priority_score: self.priority_score,
            is_critical: self.is_critical != 0,
            is_urgent: self.is_urgent != 0,
            action_plan: serde_json::from_str(&self.action_plan)?,
            status: EntryStatus::parse(&self.status)?,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, CoreError> {
    Uuid::parse_str(s).map_err(|e| CoreError::internal(format!("bad stored uuid {s:?}: {e}")))
}

impl Store {
    /// Atomically replace the plan for `(user, date)` with `plan`.
    ///
    /// Any prior plan for that date (and its entries) is deleted in the
    /// same transaction. Plans for other dates are untouched.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn replace_plan(&self, plan: &DailyPlan) -> Result<(), CoreError> {
        let mut tx = self.pool().begin().await?;

        let old_ids: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM plans WHERE user_id = ?1 AND date = ?2")
                .bind(plan.user.as_str())
                .bind(fmt_date(plan.date))
                .fetch_all(&mut *tx)
                .await?;
        for (old_id,) in &old_ids {
            sqlx::query("DELETE FROM plan_entries WHERE plan_id = ?1")
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM plans WHERE id = ?1")
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "INSERT INTO plans (id, user_id, date, status, energy_level, generated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(plan.id.to_string())
        .bind(plan.user.as_str())
        .bind(fmt_date(plan.date))
        .bind(plan.status.as_str())
        .bind(plan.energy_level.map(i64::from))
        .bind(fmt_ts(plan.generated_at))
        .execute(&mut *tx)
        .await?;

        for (position, entry) in plan.entries.iter().enumerate() {
            sqlx::query(
                "INSERT INTO plan_entries (id, plan_id, position, task_id, title, \
                 predicted_start, predicted_end, priority_score, is_critical, is_urgent, \
                 action_plan, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(plan.id.to_string())
            .bind(i64::try_from(position).unwrap_or(i64::MAX))
            .bind(&entry.task_id)
            .bind(&entry.title)
            .bind(fmt_ts(entry.predicted_start))
            .bind(fmt_ts(entry.predicted_end))
            .bind(entry.priority_score)
            .bind(i64::from(entry.is_critical))
            .bind(i64::from(entry.is_urgent))
            .bind(serde_json::to_string(&entry.action_plan)?)
            .bind(entry.status.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Load the plan for `(user, date)` with entries in plan order.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn plan(
        &self,
        user: &UserId,
        date: NaiveDate,
    ) -> Result<Option<DailyPlan>, CoreError> {
        let row: Option<PlanRow> =
            sqlx::query_as("SELECT * FROM plans WHERE user_id = ?1 AND date = ?2")
                .bind(user.as_str())
                .bind(fmt_date(date))
                .fetch_optional(self.pool())
                .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate_plan(row).await?)),
            None => Ok(None),
        }
    }

    /// Load a plan by id, scoped to its owner.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn plan_by_id(
        &self,
        user: &UserId,
        plan_id: Uuid,
    ) -> Result<Option<DailyPlan>, CoreError> {
        let row: Option<PlanRow> =
            sqlx::query_as("SELECT * FROM plans WHERE id = ?1 AND user_id = ?2")
                .bind(plan_id.to_string())
                .bind(user.as_str())
                .fetch_optional(self.pool())
                .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate_plan(row).await?)),
            None => Ok(None),
        }
    }

    async fn hydrate_plan(&self, row: PlanRow) -> Result<DailyPlan, CoreError> {
        let entries: Vec<EntryRow> = sqlx::query_as(
            "SELECT task_id, title, predicted_start, predicted_end, priority_score, \
             is_critical, is_urgent, action_plan, status \
             FROM plan_entries WHERE plan_id = ?1 ORDER BY position",
        )
        .bind(&row.id)
        .fetch_all(self.pool())
        .await?;

        Ok(DailyPlan {
            id: parse_uuid(&row.id)?,
            user: UserId(row.user_id),
            date: parse_date(&row.date)?,
            status: PlanStatus::parse(&row.status)?,
            energy_level: row
                .energy_level
                .and_then(|level| u8::try_from(level).ok()),
            entries: entries
                .into_iter()
                .map(EntryRow::into_entry)
                .collect::<Result<_, _>>()?,
            generated_at: parse_ts(&row.generated_at)?,
        })
    }

    /// Change a plan's lifecycle status.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the plan does not exist for this user.
    pub async fn update_plan_status(
        &self,
        user: &UserId,
        plan_id: Uuid,
        status: PlanStatus,
    ) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE plans SET status = ?1 WHERE id = ?2 AND user_id = ?3")
            .bind(status.as_str())
            .bind(plan_id.to_string())
            .bind(user.as_str())
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("plan {plan_id}")));
        }
        Ok(())
    }

    /// All active plans across users (the scheduler filters to each
    /// user's local today).
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn active_plans(&self) -> Result<Vec<DailyPlan>, CoreError> {
        let rows: Vec<PlanRow> =
            sqlx::query_as("SELECT * FROM plans WHERE status = ?1 ORDER BY user_id, date")
                .bind(PlanStatus::Active.as_str())
                .fetch_all(self.pool())
                .await?;
        let mut plans = Vec::with_capacity(rows.len());
        for row in rows {
            plans.push(self.hydrate_plan(row).await?);
        }
        Ok(plans)
    }

    /// Set the denormalized status of one plan entry.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the entry does not exist.
    pub async fn update_entry_status(
        &self,
        plan_id: Uuid,
        task_id: &str,
        status: EntryStatus,
    ) -> Result<(), CoreError> {
        let result =
            sqlx::query("UPDATE plan_entries SET status = ?1 WHERE plan_id = ?2 AND task_id = ?3")
                .bind(status.as_str())
                .bind(plan_id.to_string())
                .bind(task_id)
                .execute(self.pool())
                .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!(
                "entry for task {task_id} in plan {plan_id}"
            )));
        }
        Ok(())
    }

    /// Shift one entry's predicted start (snooze path).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the entry does not exist.
    pub async fn shift_entry_start(
        &self,
        plan_id: Uuid,
        task_id: &str,
        new_start: DateTime<Utc>,
        status: EntryStatus,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE plan_entries SET predicted_start = ?1, status = ?2 \
             WHERE plan_id = ?3 AND task_id = ?4",
        )
        .bind(fmt_ts(new_start))
        .bind(status.as_str())
        .bind(plan_id.to_string())
        .bind(task_id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!(
                "entry for task {task_id} in plan {plan_id}"
            )));
        }
        Ok(())
    }
}
