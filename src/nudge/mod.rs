//! Nudge scheduler: a recurrent background loop that fires at-most-once
//! notifications when planned tasks reach their predicted start.
//!
//! One process-wide loop ticks every `tick_interval`. Ticks never
//! overlap: the loop awaits each tick under an outer budget smaller than
//! the interval. Within a tick each user gets a bounded slice; a user
//! that exceeds it is abandoned until the next tick — safe because
//! abandoned entries never created their notification row.

pub mod deliver;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{EmailConfig, SchedulerConfig};
use crate::error::CoreError;
use crate::planner::resolve_timezone;
use crate::store::Store;
use crate::types::{DailyPlan, EntryStatus, FeedbackAction, PlanEntry, TaskFeedback, UserId};

use self::deliver::{compose_message, Mailer};

/// What one tick did, for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    /// Plans considered (active, dated today in the user's zone).
    pub plans_scanned: u64,
    /// Entries whose window was open.
    pub entries_due: u64,
    /// Notifications delivered this tick.
    pub fired: u64,
    /// Reservations lost to an existing non-dismissed row.
    pub suppressed: u64,
    /// User slices abandoned on budget.
    pub user_slices_aborted: u64,
}

/// The nudge engine.
pub struct Nudger {
    store: Store,
    mailer: Option<Arc<dyn Mailer>>,
    email: EmailConfig,
    scheduler: SchedulerConfig,
    default_tz: Tz,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Nudger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nudger")
            .field("email_enabled", &self.email.email_enabled)
            .finish_non_exhaustive()
    }
}

impl Nudger {
    /// Wire up the nudge engine.
    pub fn new(
        store: Store,
        mailer: Option<Arc<dyn Mailer>>,
        email: EmailConfig,
        scheduler: SchedulerConfig,
        default_tz: Tz,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            mailer,
            email,
            scheduler,
            default_tz,
            clock,
        }
    }

    /// Run one scheduler tick over every user with an active plan for
    /// their local today.
    ///
    /// # Errors
    ///
    /// Returns `Internal` only for storage failures listing plans; all
    /// per-user and per-entry failures are contained.
    pub async fn tick(&self) -> Result<TickStats, CoreError> {
        let mut stats = TickStats::default();
        let now = self.clock.now_utc();
        let plans = self.store.active_plans().await?;

        for plan in plans {
            let settings = match self.store.user_settings(&plan.user).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(user = %plan.user, error = %e, "skipping user, settings unreadable");
                    continue;
                }
            };
            let tz = resolve_timezone(&settings, self.default_tz);
            if now.with_timezone(&tz).date_naive() != plan.date {
                continue;
            }
            stats.plans_scanned = stats.plans_scanned.saturating_add(1);

            let email_to = (self.email.email_enabled && settings.email_enabled)
                .then_some(settings.email)
                .flatten();

            let slice = tokio::time::timeout(
                self.scheduler.user_budget(),
                self.serve_plan(&plan, now, email_to.as_deref(), &mut stats),
            )
            .await;
            if slice.is_err() {
                stats.user_slices_aborted = stats.user_slices_aborted.saturating_add(1);
                warn!(user = %plan.user, "user slice exceeded budget, deferring to next tick");
            }
        }

        debug!(
            plans = stats.plans_scanned,
            due = stats.entries_due,
            fired = stats.fired,
            suppressed = stats.suppressed,
            "tick complete"
        );
        Ok(stats)
    }

    /// Serve one plan's due entries in predicted-start order.
    async fn serve_plan(
        &self,
        plan: &DailyPlan,
        now: DateTime<Utc>,
        email_to: Option<&str>,
        stats: &mut TickStats,
    ) {
        let grace = Duration::seconds(i64::try_from(self.scheduler.nudge_grace_secs).unwrap_or(60));
        let lookahead =
            Duration::seconds(i64::try_from(self.scheduler.nudge_lookahead_secs).unwrap_or(300));
        let window_start = now.checked_sub_signed(grace).unwrap_or(now);
        let window_end = now.checked_add_signed(lookahead).unwrap_or(now);

        let mut due: Vec<&PlanEntry> = plan
            .entries
            .iter()
            .filter(|e| {
                e.status == EntryStatus::Pending
                    && e.predicted_start >= window_start
                    && e.predicted_start <= window_end
            })
            .collect();
        due.sort_by_key(|e| e.predicted_start);

        for entry in due {
            stats.entries_due = stats.entries_due.saturating_add(1);
            // A prior notification for this task suppresses the nudge:
            // within this plan always, across plans until dismissed.
            match self
                .store
                .has_blocking_notification(&plan.user, &entry.task_id, Some(plan.id))
                .await
            {
                Ok(true) => {
                    stats.suppressed = stats.suppressed.saturating_add(1);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(user = %plan.user, task = %entry.task_id, error = %e,
                        "suppression check failed, skipping entry");
                    continue;
                }
            }
            match self.fire_entry(plan, entry, email_to).await {
                Ok(true) => stats.fired = stats.fired.saturating_add(1),
                Ok(false) => stats.suppressed = stats.suppressed.saturating_add(1),
                Err(e) => {
                    warn!(
                        user = %plan.user,
                        task = %entry.task_id,
                        error = %e,
                        "nudge delivery failed"
                    );
                }
            }
        }
    }

    /// Reserve and deliver one entry's notification.
    ///
    /// Returns `Ok(false)` when the slot was already held (the at-most-once
    /// suppression path).
    async fn fire_entry(
        &self,
        plan: &DailyPlan,
        entry: &PlanEntry,
        email_to: Option<&str>,
    ) -> Result<bool, CoreError> {
        let message = compose_message(&entry.title, entry.is_critical, entry.is_urgent);

        let notification = match self
            .store
            .reserve_notification(
                &plan.user,
                &entry.task_id,
                Some(plan.id),
                "task_start",
                &message,
                entry.predicted_start,
            )
            .await
        {
            Ok(n) => n,
            Err(CoreError::Busy(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        // In-app delivery: the row flips to sent.
        self.store
            .mark_notification_sent(&plan.user, notification.id, self.clock.now_utc())
            .await?;
        info!(user = %plan.user, task = %entry.task_id, "nudge delivered");

        // Email is best-effort and never reverts the sent state.
        if let (Some(mailer), Some(to)) = (&self.mailer, email_to) {
            let html = format!("<p>{message}</p>");
            if let Err(e) = mailer
                .send(&self.email.from, to, &message, &html, &message)
                .await
            {
                warn!(user = %plan.user, error = %e, "nudge email failed");
            }
        }
        Ok(true)
    }

    /// Dismiss a notification: `pending|sent → dismissed`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no such non-dismissed notification exists.
    pub async fn dismiss(&self, user: &UserId, notification_id: Uuid) -> Result<(), CoreError> {
        self.store.dismiss_notification(user, notification_id).await
    }

    /// Mark a planned task done: completes the task, appends feedback,
    /// and flips the plan entry.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the task does not exist for this user.
    pub async fn mark_done(
        &self,
        user: &UserId,
        task_id: &str,
        plan_id: Option<Uuid>,
    ) -> Result<(), CoreError> {
        let now = self.clock.now_utc();
        self.store.mark_task_done(user, task_id, now).await?;
        self.store
            .record_feedback(&TaskFeedback {
                id: Uuid::new_v4(),
                user: user.clone(),
                task_id: task_id.to_owned(),
                plan_id,
                action: FeedbackAction::Done,
                snooze_minutes: None,
                at: now,
            })
            .await?;
        if let Some(plan_id) = plan_id {
            if let Err(e) = self
                .store
                .update_entry_status(plan_id, task_id, EntryStatus::Done)
                .await
            {
                debug!(task = task_id, error = %e, "no plan entry to mark done");
            }
        }
        Ok(())
    }

    /// Snooze a planned task: appends feedback and shifts the entry's
    /// predicted start, capped to the end of the user's local day. The
    /// existing notification reservation stays in place, so the shifted
    /// entry cannot re-fire within this plan.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for a zero-minute snooze; `NotFound` when
    /// the plan entry does not exist.
    pub async fn snooze(
        &self,
        user: &UserId,
        task_id: &str,
        minutes: u32,
        plan_id: Option<Uuid>,
    ) -> Result<(), CoreError> {
        if minutes == 0 {
            return Err(CoreError::invalid("snooze must be at least one minute"));
        }
        let now = self.clock.now_utc();
        self.store
            .record_feedback(&TaskFeedback {
                id: Uuid::new_v4(),
                user: user.clone(),
                task_id: task_id.to_owned(),
                plan_id,
                action: FeedbackAction::Snoozed,
                snooze_minutes: Some(minutes),
                at: now,
            })
            .await?;

        let Some(plan_id) = plan_id else {
            return Ok(());
        };
        let plan = self
            .store
            .plan_by_id(user, plan_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("plan {plan_id}")))?;
        let entry = plan
            .entries
            .iter()
            .find(|e| e.task_id == task_id)
            .ok_or_else(|| CoreError::NotFound(format!("entry for task {task_id}")))?;

        let settings = self.store.user_settings(user).await?;
        let tz = resolve_timezone(&settings, self.default_tz);
        let shifted = entry
            .predicted_start
            .checked_add_signed(Duration::minutes(i64::from(minutes)))
            .unwrap_or(entry.predicted_start);
        let capped = end_of_local_day(plan.date, tz).map_or(shifted, |eod| shifted.min(eod));

        self.store
            .shift_entry_start(plan_id, task_id, capped, EntryStatus::Snoozed)
            .await
    }
}

/// Last instant of the local day in UTC.
fn end_of_local_day(date: chrono::NaiveDate, tz: Tz) -> Option<DateTime<Utc>> {
    date.and_hms_opt(23, 59, 59)
        .and_then(|dt| dt.and_local_timezone(tz).latest())
        .map(|t| t.with_timezone(&Utc))
}

/// Run the scheduler loop until shutdown.
///
/// Ticks every `tick_interval`; each tick runs under the outer budget so
/// a slow tick can never overlap the next one.
pub async fn run_scheduler(nudger: Arc<Nudger>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval_duration = nudger.scheduler.tick_interval();
    let tick_budget = nudger.scheduler.tick_budget();
    info!(
        interval_secs = interval_duration.as_secs(),
        "nudge scheduler started"
    );

    let mut interval = tokio::time::interval(interval_duration);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the immediate first tick.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match tokio::time::timeout(tick_budget, nudger.tick()).await {
                    Ok(Ok(stats)) => {
                        if stats.fired > 0 {
                            info!(fired = stats.fired, "nudges delivered this tick");
                        }
                    }
                    Ok(Err(e)) => warn!(error = %e, "scheduler tick failed"),
                    Err(_) => warn!(
                        budget_secs = tick_budget.as_secs(),
                        "scheduler tick exceeded outer budget, aborted"
                    ),
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("nudge scheduler shutting down");
                    break;
                }
            }
        }
    }

    info!("nudge scheduler stopped");
}

/// Convenience for tests and the one-shot CLI: a single bounded tick.
///
/// # Errors
///
/// Propagates [`Nudger::tick`] errors; the timeout maps to `Transient`.
pub async fn tick_once(nudger: &Nudger, budget: StdDuration) -> Result<TickStats, CoreError> {
    tokio::time::timeout(budget, nudger.tick())
        .await
        .unwrap_or_else(|_| Err(CoreError::Transient("tick exceeded budget".to_owned())))
}
