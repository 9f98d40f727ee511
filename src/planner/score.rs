//! Deterministic candidate scoring and learned snooze adjustment.
//!
//! The score never depends on the LLM:
//! `0.45·priority + 0.25·critical + 0.15·urgent + 0.10·energyFit + 0.05·recency`,
//! clamped to `[0, 1]`. Ties break on earlier original start, then stable
//! task id order.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;

use crate::types::{FeedbackAction, Priority, Task, TaskFeedback};

/// Minimum samples before an hour bucket's snooze rate is trusted.
const MIN_BUCKET_SAMPLES: usize = 4;

/// Snooze rate at or above which a bucket shifts entries.
const SHIFT_RATE: f64 = 0.5;

/// A task with its computed score.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub task: Task,
    pub score: f64,
}

/// Energy a task is assumed to demand, derived from its classification.
pub fn required_energy(task: &Task) -> u8 {
    let base: u8 = match task.priority {
        Priority::High => 4,
        Priority::Normal => 3,
        Priority::Low => 2,
    };
    if task.is_critical {
        base.saturating_add(1).min(5)
    } else {
        base
    }
}

/// The deterministic priority score for one candidate.
pub fn priority_score(task: &Task, user_energy: u8, now: DateTime<Utc>) -> f64 {
    let priority_weight = task.priority.weight();
    let critical = if task.is_critical { 1.0 } else { 0.0 };
    let urgent = if task.is_urgent { 1.0 } else { 0.0 };

    let demand = f64::from(required_energy(task));
    let energy = f64::from(user_energy.clamp(1, 5));
    let energy_fit = (1.0 - (demand - energy).abs() / 4.0).clamp(0.0, 1.0);

    // Fresh tasks get a small boost that decays over a week.
    let age_hours = now
        .signed_duration_since(task.created_at)
        .num_hours()
        .max(0);
    let recency = (1.0 - f64::from(u32::try_from(age_hours).unwrap_or(u32::MAX)) / 168.0)
        .clamp(0.0, 1.0);

    let score = 0.45 * priority_weight + 0.25 * critical + 0.15 * urgent + 0.10 * energy_fit
        + 0.05 * recency;
    score.clamp(0.0, 1.0)
}

/// Score and order candidates: score descending, then earlier start, then
/// task id.
pub fn rank_candidates(
    tasks: Vec<Task>,
    user_energy: u8,
    now: DateTime<Utc>,
) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = tasks
        .into_iter()
        .map(|task| {
            let score = priority_score(&task, user_energy, now);
            ScoredCandidate { task, score }
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.task.start.cmp(&b.task.start))
            .then_with(|| a.task.id.cmp(&b.task.id))
    });
    scored
}

/// Per-hour snooze statistics over the feedback window.
#[derive(Debug, Default, Clone)]
pub struct SnoozeProfile {
    /// hour-of-day → (snoozed, total).
    buckets: HashMap<u32, (usize, usize)>,
}

impl SnoozeProfile {
    /// Build the profile from feedback rows, bucketing by the local hour
    /// at which the user acted.
    pub fn from_feedback(feedback: &[TaskFeedback], tz: Tz) -> Self {
        let mut buckets: HashMap<u32, (usize, usize)> = HashMap::new();
        for entry in feedback {
            let hour = entry.at.with_timezone(&tz).hour();
            let slot = buckets.entry(hour).or_default();
            slot.1 = slot.1.saturating_add(1);
            if entry.action == FeedbackAction::Snoozed {
                slot.0 = slot.0.saturating_add(1);
            }
        }
        Self { buckets }
    }

    /// Whether entries starting in this local hour should shift.
    pub fn should_shift(&self, hour: u32) -> bool {
        match self.buckets.get(&hour) {
            Some(&(snoozed, total)) if total >= MIN_BUCKET_SAMPLES => {
                #[allow(clippy::cast_precision_loss)]
                let rate = snoozed as f64 / total as f64;
                rate >= SHIFT_RATE
            }
            _ => false,
        }
    }
}

/// Apply the learned shift: +1 hour when the start falls in a snoozy
/// bucket, capped to the working-window end.
pub fn shifted_start(
    start: DateTime<Utc>,
    profile: &SnoozeProfile,
    tz: Tz,
    window_end: NaiveTime,
) -> DateTime<Utc> {
    let local = start.with_timezone(&tz);
    if !profile.should_shift(local.hour()) {
        return start;
    }
    let shifted = start.checked_add_signed(Duration::hours(1)).unwrap_or(start);
    cap_to_window_end(shifted, tz, window_end).unwrap_or(start)
}

/// Clamp a timestamp so its local time does not pass the window end.
pub fn cap_to_window_end(t: DateTime<Utc>, tz: Tz, window_end: NaiveTime) -> Option<DateTime<Utc>> {
    let local = t.with_timezone(&tz);
    if local.time() <= window_end {
        return Some(t);
    }
    local
        .date_naive()
        .and_time(window_end)
        .and_local_timezone(tz)
        .single()
        .map(|capped| capped.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SyncDirection, SyncStatus, TaskSource, UserId};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().expect("valid")
    }

    fn task(id: &str, priority: Priority, critical: bool, urgent: bool, hour: u32) -> Task {
        Task {
            id: id.to_owned(),
            user: UserId::from("u1"),
            source: TaskSource::Calendar,
            title: format!("task {id}"),
            description: None,
            start: t(hour),
            end: t(hour.saturating_add(1)),
            attendees: vec![],
            location: None,
            recurrence: None,
            priority,
            is_critical: critical,
            is_urgent: urgent,
            is_spam: false,
            spam_reason: None,
            spam_score: None,
            is_completed: false,
            completed_at: None,
            raw_payload: serde_json::Value::Null,
            external_id: None,
            sync_status: SyncStatus::Synced,
            sync_direction: SyncDirection::Inbound,
            last_synced_at: None,
            external_updated_at: None,
            sync_error: None,
            sync_attempted_at: None,
            sync_attempts: 0,
            created_at: t(6),
            updated_at: t(6),
        }
    }

    #[test]
    fn test_ordering_critical_urgent_normal() {
        let critical = task("tc", Priority::High, true, false, 10);
        let urgent = task("tu", Priority::Normal, false, true, 11);
        let normal = task("tn", Priority::Normal, false, false, 14);

        let ranked = rank_candidates(vec![normal, urgent, critical], 2, t(9));
        let ids: Vec<&str> = ranked.iter().map(|c| c.task.id.as_str()).collect();
        assert_eq!(ids, vec!["tc", "tu", "tn"]);
        assert!(ranked[0].score > ranked[1].score);
        assert!(ranked[1].score > ranked[2].score);
    }

    #[test]
    fn test_scores_clamped_to_unit_interval() {
        let maxed = task("max", Priority::High, true, true, 9);
        let score = priority_score(&maxed, 5, t(9));
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn test_tie_breaks_by_start_then_id() {
        let late = task("a", Priority::Normal, false, false, 15);
        let early = task("b", Priority::Normal, false, false, 9);
        let ranked = rank_candidates(vec![late.clone(), early.clone()], 3, t(8));
        assert_eq!(ranked[0].task.id, "b", "earlier start wins the tie");

        let twin_a = task("a", Priority::Normal, false, false, 9);
        let twin_b = task("b", Priority::Normal, false, false, 9);
        let ranked = rank_candidates(vec![twin_b, twin_a], 3, t(8));
        assert_eq!(ranked[0].task.id, "a", "same start falls back to id order");
    }

    #[test]
    fn test_determinism() {
        let tasks = vec![
            task("x", Priority::High, false, true, 10),
            task("y", Priority::Low, false, false, 8),
            task("z", Priority::Normal, true, false, 12),
        ];
        let first = rank_candidates(tasks.clone(), 3, t(9));
        let second = rank_candidates(tasks, 3, t(9));
        let ids1: Vec<_> = first.iter().map(|c| (c.task.id.clone(), c.score)).collect();
        let ids2: Vec<_> = second.iter().map(|c| (c.task.id.clone(), c.score)).collect();
        assert_eq!(ids1, ids2);
    }

    fn feedback(action: FeedbackAction, hour: u32) -> TaskFeedback {
        TaskFeedback {
            id: Uuid::new_v4(),
            user: UserId::from("u1"),
            task_id: "t".to_owned(),
            plan_id: None,
            action,
            snooze_minutes: (action == FeedbackAction::Snoozed).then_some(30),
            at: t(hour),
        }
    }

    #[test]
    fn test_snooze_bucket_needs_min_samples() {
        let rows = vec![
            feedback(FeedbackAction::Snoozed, 9),
            feedback(FeedbackAction::Snoozed, 9),
            feedback(FeedbackAction::Snoozed, 9),
        ];
        let profile = SnoozeProfile::from_feedback(&rows, chrono_tz::UTC);
        assert!(!profile.should_shift(9), "3 samples is below the floor");
    }

    #[test]
    fn test_snoozy_hour_shifts_start() {
        let rows = vec![
            feedback(FeedbackAction::Snoozed, 9),
            feedback(FeedbackAction::Snoozed, 9),
            feedback(FeedbackAction::Snoozed, 9),
            feedback(FeedbackAction::Done, 9),
        ];
        let profile = SnoozeProfile::from_feedback(&rows, chrono_tz::UTC);
        assert!(profile.should_shift(9), "3/4 snoozes crosses the 0.5 rate");

        let window_end = NaiveTime::from_hms_opt(20, 0, 0).expect("valid");
        let shifted = shifted_start(t(9), &profile, chrono_tz::UTC, window_end);
        assert_eq!(shifted, t(10));
    }

    #[test]
    fn test_shift_capped_to_working_window() {
        let rows = vec![
            feedback(FeedbackAction::Snoozed, 19),
            feedback(FeedbackAction::Snoozed, 19),
            feedback(FeedbackAction::Snoozed, 19),
            feedback(FeedbackAction::Snoozed, 19),
        ];
        let profile = SnoozeProfile::from_feedback(&rows, chrono_tz::UTC);
        let window_end = NaiveTime::from_hms_opt(19, 30, 0).expect("valid");
        let shifted = shifted_start(t(19), &profile, chrono_tz::UTC, window_end);
        assert_eq!(
            shifted,
            Utc.with_ymd_and_hms(2026, 3, 2, 19, 30, 0).single().expect("valid"),
            "shift lands on the window end, not past it"
        );
    }

    #[test]
    fn test_quiet_hour_does_not_shift() {
        let rows = vec![
            feedback(FeedbackAction::Done, 9),
            feedback(FeedbackAction::Done, 9),
            feedback(FeedbackAction::Done, 9),
            feedback(FeedbackAction::Snoozed, 9),
        ];
        let profile = SnoozeProfile::from_feedback(&rows, chrono_tz::UTC);
        let window_end = NaiveTime::from_hms_opt(20, 0, 0).expect("valid");
        assert_eq!(shifted_start(t(9), &profile, chrono_tz::UTC, window_end), t(9));
    }
}
