//! Daily plan generation: deterministic ordering, LLM action plans,
//! deterministic fallback.
//!
//! The LLM contributes only the per-entry `action_plan` steps. Entry
//! selection, ordering, scores, and predicted times are computed
//! deterministically, so two runs with identical inputs and identical LLM
//! output produce identical plans — and LLM failure degrades to the same
//! plan without action plans.

pub mod score;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::clock::Clock;
use crate::config::{PlanningConfig, SpamConfig, WorkingWindow};
use crate::error::CoreError;
use crate::llm::{parse_json_response, ChatMessage, ChatRequest, Chatter, RetryingChatter};
use crate::store::Store;
use crate::types::{
    DailyPlan, EntryStatus, PlanEntry, PlanStatus, Task, UserId, UserSettings,
};

use self::score::{
    cap_to_window_end, rank_candidates, shifted_start, ScoredCandidate, SnoozeProfile,
};

/// Bounds on LLM-produced action plans.
const ACTION_PLAN_MIN_STEPS: usize = 1;
/// Upper bound on LLM-produced action-plan steps.
const ACTION_PLAN_MAX_STEPS: usize = 6;

/// Resolve a user's timezone with the configured fallback.
pub fn resolve_timezone(settings: &UserSettings, default_tz: Tz) -> Tz {
    settings
        .timezone
        .as_deref()
        .and_then(|name| name.parse().ok())
        .unwrap_or(default_tz)
}

/// LLM response schema: action plans keyed by task.
#[derive(Debug, Deserialize)]
struct LlmPlan {
    entries: Vec<LlmPlanEntry>,
}

/// One LLM plan entry.
#[derive(Debug, Deserialize)]
struct LlmPlanEntry {
    task_id: String,
    action_plan: Vec<String>,
}

/// The plan generator.
pub struct Planner<C> {
    store: Store,
    chatter: Option<RetryingChatter<C>>,
    config: PlanningConfig,
    default_tz: Tz,
    promo_patterns: Vec<Regex>,
    clock: Arc<dyn Clock>,
}

impl<C> std::fmt::Debug for Planner<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("llm", &self.chatter.is_some())
            .finish_non_exhaustive()
    }
}

impl<C: Chatter> Planner<C> {
    /// Wire up the planner.
    pub fn new(
        store: Store,
        chatter: Option<RetryingChatter<C>>,
        config: PlanningConfig,
        spam: &SpamConfig,
        default_tz: Tz,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let promo_patterns = spam
            .promo_patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self {
            store,
            chatter,
            config,
            default_tz,
            promo_patterns,
            clock,
        }
    }

    /// Generate (or regenerate) the plan for `(user, date)`.
    ///
    /// Replaces any existing plan for that date under a fresh plan id.
    /// Notification rows are untouched: dismissed ones stay dismissed,
    /// and undismissed ones keep suppressing re-nudges for their task.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on cancellation; storage errors as `Internal`.
    pub async fn generate(
        &self,
        user: &UserId,
        date: NaiveDate,
        cancel: &CancelSignal,
    ) -> Result<DailyPlan, CoreError> {
        cancel.check()?;
        let now = self.clock.now_utc();
        let settings = self.store.user_settings(user).await?;
        let tz = resolve_timezone(&settings, self.default_tz);
        let (window_start, window_end) = self.working_window(&settings)?;

        // Candidates: non-spam, open tasks starting on the user's local day.
        let (day_start, day_end) = local_day_bounds(date, tz)?;
        let tasks = self.store.list_tasks(user, Some(day_start), Some(day_end)).await?;
        let candidates: Vec<Task> = tasks
            .into_iter()
            .filter(|t| !t.is_spam && !t.is_completed)
            .collect();

        let energy = self
            .store
            .energy(user, date)
            .await?
            .unwrap_or(self.config.default_energy);

        let feedback_floor = now
            .checked_sub_signed(Duration::days(i64::from(self.config.feedback_window_days)))
            .unwrap_or(now);
        let feedback = self.store.feedback_since(user, feedback_floor).await?;
        let profile = SnoozeProfile::from_feedback(&feedback, tz);

        let candidate_ids: Vec<String> = candidates.iter().map(|t| t.id.clone()).collect();
        let blocked = self.store.tasks_with_open_blockers(user, &candidate_ids).await?;

        // Deterministic ordering.
        let ranked = rank_candidates(candidates, energy, now);

        // Predicted times: start within the working window, learned snooze
        // shift, blocked tasks pushed to the end of the day (or dropped
        // when that would pass their own deadline).
        let mut planned: Vec<(ScoredCandidate, DateTime<Utc>, DateTime<Utc>)> = Vec::new();
        for candidate in ranked {
            cancel.check()?;
            let duration = candidate
                .task
                .end
                .signed_duration_since(candidate.task.start);

            let base = clamp_into_window(candidate.task.start, tz, window_start, window_end);
            let start = if blocked.contains(&candidate.task.id) {
                let end_of_day = day_window_end(date, tz, window_end)?;
                let pushed = end_of_day.checked_sub_signed(duration).unwrap_or(end_of_day);
                if pushed > candidate.task.end {
                    debug!(
                        task = %candidate.task.id,
                        "blocked task cannot fit before its deadline, dropping from plan"
                    );
                    continue;
                }
                pushed.max(base)
            } else {
                shifted_start(base, &profile, tz, window_end)
            };
            let end = start.checked_add_signed(duration).unwrap_or(start);
            planned.push((candidate, start, end));
        }

        // Safety net: promotional titles never reach the plan.
        planned.retain(|(candidate, _, _)| {
            let promo = self
                .promo_patterns
                .iter()
                .any(|p| p.is_match(&candidate.task.title));
            if promo {
                warn!(task = %candidate.task.id, "promotional title dropped from plan");
            }
            !promo
        });

        // LLM action plans; deterministic fallback on double failure.
        let action_plans = self.compose_action_plans(&planned, energy, cancel).await;

        let entries: Vec<PlanEntry> = planned
            .iter()
            .map(|(candidate, start, end)| PlanEntry {
                task_id: candidate.task.id.clone(),
                title: candidate.task.title.clone(),
                predicted_start: *start,
                predicted_end: *end,
                priority_score: candidate.score,
                is_critical: candidate.task.is_critical,
                is_urgent: candidate.task.is_urgent,
                action_plan: action_plans
                    .get(&candidate.task.id)
                    .cloned()
                    .unwrap_or_default(),
                status: EntryStatus::Pending,
            })
            .collect();

        let plan = DailyPlan {
            id: Uuid::new_v4(),
            user: user.clone(),
            date,
            status: PlanStatus::Active,
            energy_level: Some(energy),
            entries,
            generated_at: now,
        };
        self.store.replace_plan(&plan).await?;
        info!(
            user = %user,
            date = %date,
            entries = plan.entries.len(),
            energy,
            "daily plan generated"
        );
        Ok(plan)
    }

    /// Ask the LLM for action plans; one corrective retry, then empty.
    async fn compose_action_plans(
        &self,
        planned: &[(ScoredCandidate, DateTime<Utc>, DateTime<Utc>)],
        energy: u8,
        cancel: &CancelSignal,
    ) -> HashMap<String, Vec<String>> {
        let Some(ref chatter) = self.chatter else {
            return HashMap::new();
        };
        if planned.is_empty() {
            return HashMap::new();
        }

        let candidate_ids: Vec<&str> =
            planned.iter().map(|(c, _, _)| c.task.id.as_str()).collect();

        let strict_hint = "Return ONLY the JSON object, no prose. Every task_id from the \
                           input must appear exactly once.";
        for attempt in 0..2u8 {
            let request = self.build_plan_request(planned, energy, (attempt > 0).then_some(strict_hint));
            let response = match chatter.chat(&request, cancel).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "plan llm call failed, deterministic fallback");
                    return HashMap::new();
                }
            };
            match parse_json_response::<LlmPlan>(&response.text)
                .map_err(|e| e.to_string())
                .and_then(|plan| validate_action_plans(plan, &candidate_ids))
            {
                Ok(map) => return map,
                Err(e) => {
                    warn!(attempt, error = %e, "plan llm output failed validation");
                }
            }
        }
        HashMap::new()
    }

    fn build_plan_request(
        &self,
        planned: &[(ScoredCandidate, DateTime<Utc>, DateTime<Utc>)],
        energy: u8,
        strict_hint: Option<&str>,
    ) -> ChatRequest {
        let tasks: Vec<serde_json::Value> = planned
            .iter()
            .map(|(candidate, start, end)| {
                json!({
                    "task_id": candidate.task.id,
                    "title": candidate.task.title,
                    "score": candidate.score,
                    "start": start.to_rfc3339(),
                    "end": end.to_rfc3339(),
                    "is_critical": candidate.task.is_critical,
                    "is_urgent": candidate.task.is_urgent,
                })
            })
            .collect();

        let mut system = "You break scheduled tasks into concrete action steps. For each \
                          task produce 1-6 short imperative steps."
            .to_owned();
        if let Some(hint) = strict_hint {
            system.push(' ');
            system.push_str(hint);
        }

        ChatRequest {
            messages: vec![
                ChatMessage::system(system),
                ChatMessage::user(
                    json!({
                        "user_energy": energy,
                        "tasks": tasks,
                    })
                    .to_string(),
                ),
            ],
            max_tokens: 1500,
            response_schema: Some(json!({
                "type": "object",
                "required": ["entries"],
                "properties": {
                    "entries": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["task_id", "action_plan"],
                            "properties": {
                                "task_id": {"type": "string"},
                                "action_plan": {
                                    "type": "array",
                                    "minItems": 1,
                                    "maxItems": 6,
                                    "items": {"type": "string"}
                                }
                            }
                        }
                    }
                }
            })),
        }
    }

    fn working_window(&self, settings: &UserSettings) -> Result<(NaiveTime, NaiveTime), CoreError> {
        let overridden = WorkingWindow {
            start: settings
                .work_start
                .clone()
                .unwrap_or_else(|| self.config.working_window.start.clone()),
            end: settings
                .work_end
                .clone()
                .unwrap_or_else(|| self.config.working_window.end.clone()),
        };
        overridden
            .bounds()
            .map_err(|e| CoreError::invalid(e.to_string()))
    }
}

/// Validate the LLM plan: full coverage, no unknown ids, step bounds.
fn validate_action_plans(
    plan: LlmPlan,
    candidate_ids: &[&str],
) -> Result<HashMap<String, Vec<String>>, String> {
    let mut map = HashMap::new();
    for entry in plan.entries {
        if !candidate_ids.contains(&entry.task_id.as_str()) {
            return Err(format!("unknown task_id {:?}", entry.task_id));
        }
        let steps: Vec<String> = entry
            .action_plan
            .iter()
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
        if !(ACTION_PLAN_MIN_STEPS..=ACTION_PLAN_MAX_STEPS).contains(&steps.len()) {
            return Err(format!(
                "action_plan for {:?} has {} steps",
                entry.task_id,
                steps.len()
            ));
        }
        map.insert(entry.task_id, steps);
    }
    for id in candidate_ids {
        if !map.contains_key(*id) {
            return Err(format!("missing action_plan for {id:?}"));
        }
    }
    Ok(map)
}

/// UTC bounds of the user's local calendar day.
fn local_day_bounds(date: NaiveDate, tz: Tz) -> Result<(DateTime<Utc>, DateTime<Utc>), CoreError> {
    let start = date
        .and_hms_opt(0, 0, 0)
        .and_then(|dt| dt.and_local_timezone(tz).earliest())
        .ok_or_else(|| CoreError::internal(format!("no midnight for {date} in {tz}")))?;
    let next = date
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|dt| dt.and_local_timezone(tz).earliest())
        .ok_or_else(|| CoreError::internal(format!("no day end for {date} in {tz}")))?;
    Ok((start.with_timezone(&Utc), next.with_timezone(&Utc)))
}

/// The UTC instant of the working-window end on the given local day.
fn day_window_end(date: NaiveDate, tz: Tz, window_end: NaiveTime) -> Result<DateTime<Utc>, CoreError> {
    date.and_time(window_end)
        .and_local_timezone(tz)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| CoreError::internal(format!("no window end for {date} in {tz}")))
}

/// Clamp a start into `[window_start, window_end]` on its own local day.
fn clamp_into_window(
    start: DateTime<Utc>,
    tz: Tz,
    window_start: NaiveTime,
    window_end: NaiveTime,
) -> DateTime<Utc> {
    let local = start.with_timezone(&tz);
    if local.time() < window_start {
        if let Some(raised) = local
            .date_naive()
            .and_time(window_start)
            .and_local_timezone(tz)
            .earliest()
        {
            return raised.with_timezone(&Utc);
        }
    }
    cap_to_window_end(start, tz, window_end).unwrap_or(start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_unknown_id() {
        let plan = LlmPlan {
            entries: vec![LlmPlanEntry {
                task_id: "ghost".to_owned(),
                action_plan: vec!["step".to_owned()],
            }],
        };
        assert!(validate_action_plans(plan, &["real"]).is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_action_plan() {
        let plan = LlmPlan {
            entries: vec![LlmPlanEntry {
                task_id: "a".to_owned(),
                action_plan: (0..7).map(|i| format!("step {i}")).collect(),
            }],
        };
        assert!(validate_action_plans(plan, &["a"]).is_err());
    }

    #[test]
    fn test_validate_requires_full_coverage() {
        let plan = LlmPlan {
            entries: vec![LlmPlanEntry {
                task_id: "a".to_owned(),
                action_plan: vec!["step".to_owned()],
            }],
        };
        assert!(validate_action_plans(plan, &["a", "b"]).is_err());
    }

    #[test]
    fn test_validate_accepts_complete_plan() {
        let plan = LlmPlan {
            entries: vec![
                LlmPlanEntry {
                    task_id: "a".to_owned(),
                    action_plan: vec!["  padded step  ".to_owned()],
                },
                LlmPlanEntry {
                    task_id: "b".to_owned(),
                    action_plan: vec!["one".to_owned(), "two".to_owned()],
                },
            ],
        };
        let map = validate_action_plans(plan, &["a", "b"]).expect("valid");
        assert_eq!(map["a"], vec!["padded step"]);
        assert_eq!(map["b"].len(), 2);
    }

    #[test]
    fn test_local_day_bounds_cross_timezone() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).expect("valid");
        let (start, end) = local_day_bounds(date, chrono_tz::Europe::Madrid).expect("ok");
        // Madrid is UTC+1 in March (standard time).
        assert_eq!(start.to_rfc3339(), "2026-03-01T23:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2026-03-02T23:00:00+00:00");
    }

    #[test]
    fn test_resolve_timezone_falls_back() {
        let mut settings = UserSettings::default();
        assert_eq!(
            resolve_timezone(&settings, chrono_tz::UTC),
            chrono_tz::UTC
        );
        settings.timezone = Some("America/New_York".to_owned());
        assert_eq!(
            resolve_timezone(&settings, chrono_tz::UTC),
            chrono_tz::America::New_York
        );
        settings.timezone = Some("Not/AZone".to_owned());
        assert_eq!(
            resolve_timezone(&settings, chrono_tz::UTC),
            chrono_tz::UTC
        );
    }
}
