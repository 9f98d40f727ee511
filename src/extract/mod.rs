//! Raw provider items become normalized tasks, reminders, or skips.
//!
//! Connector payloads use a common key vocabulary:
//! - calendar: `title`, `start`, `end`, `all_day`, `status`, `attendees`,
//!   `location`, `recurrence`, `description`
//! - mail: `subject`, `sender`, `body`, `received_at`, `labels`, `deadline`
//! - task manager: `title`, `notes`, `due`, `completed`
//!
//! Per-item failures isolate to `Skip(reason)`; the pipeline keeps going.
//! The LLM refines classification only — structural fields (start/end)
//! always come from provider metadata.

pub mod nlp;
pub mod spam;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::debug;

use crate::cancel::CancelSignal;
use crate::connectors::RawItem;
use crate::llm::{Chatter, RetryingChatter};
use crate::store::reminders::ReminderDraft;
use crate::types::{Priority, TaskDraft, TaskSource};

use self::nlp::FieldExtractor;
use self::spam::SpamClassifier;

/// Default duration assigned to items with a point-in-time anchor only.
fn default_slot() -> Duration {
    Duration::minutes(30)
}

/// The three extraction outcomes.
#[derive(Debug, Clone)]
pub enum NormalizedItem {
    /// A plannable task.
    Task(TaskDraft),
    /// A reminder-class item, kept off the plan unless promoted.
    Reminder(ReminderDraft),
    /// Not persisted; the reason lands in the run report.
    Skip(String),
}

/// Raw-item extractor: source dispatch + spam fusion + field extraction.
pub struct Extractor<C> {
    spam: SpamClassifier,
    fields: FieldExtractor,
    chatter: Option<RetryingChatter<C>>,
}

impl<C> std::fmt::Debug for Extractor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor")
            .field("llm", &self.chatter.is_some())
            .finish_non_exhaustive()
    }
}

impl<C: Chatter> Extractor<C> {
    /// Build an extractor. `chatter` is optional; without it all
    /// classification is rule-based.
    pub fn new(spam_threshold: f64, chatter: Option<RetryingChatter<C>>) -> Self {
        Self {
            spam: SpamClassifier::new(spam_threshold),
            fields: FieldExtractor::new(),
            chatter,
        }
    }

    /// Normalize one raw item.
    ///
    /// Never fails: malformed payloads and downstream errors produce
    /// [`NormalizedItem::Skip`].
    pub async fn extract(
        &self,
        source: TaskSource,
        item: &RawItem,
        now: DateTime<Utc>,
        cancel: &CancelSignal,
    ) -> NormalizedItem {
        match source {
            TaskSource::Calendar => self.extract_calendar(item),
            TaskSource::Mail => self.extract_mail(item, now, cancel).await,
            TaskSource::TaskManager => self.extract_task_manager(item),
            TaskSource::Manual => NormalizedItem::Skip("manual items are not ingested".to_owned()),
        }
    }

    // ── Calendar ────────────────────────────────────────────────

    fn extract_calendar(&self, item: &RawItem) -> NormalizedItem {
        let payload = &item.payload;
        let title = match str_field(payload, "title") {
            Some(t) if !t.trim().is_empty() => t.trim().to_owned(),
            _ => return NormalizedItem::Skip("extraction_failed: missing title".to_owned()),
        };

        if str_field(payload, "status").is_some_and(|s| s.eq_ignore_ascii_case("cancelled")) {
            return NormalizedItem::Skip("cancelled".to_owned());
        }

        let start = ts_field(payload, "start");
        let end = ts_field(payload, "end");
        let recurrence = str_field(payload, "recurrence").map(str::to_owned);

        if bool_field(payload, "all_day") {
            let Some(start) = start else {
                return NormalizedItem::Skip("extraction_failed: all-day item without date".to_owned());
            };
            let end = end.unwrap_or_else(|| {
                start
                    .checked_add_signed(Duration::hours(24))
                    .unwrap_or(start)
            });
            return NormalizedItem::Reminder(ReminderDraft {
                title,
                description: str_field(payload, "description").map(str::to_owned),
                start,
                end,
                is_all_day: true,
                raw_payload: payload.clone(),
                external_id: item.external_id.clone(),
            });
        }

        let (Some(start), Some(end)) = (start, end) else {
            // A bare recurrence rule with no concrete occurrence cannot be
            // scheduled; occurrences arrive as their own items.
            if recurrence.is_some() {
                return NormalizedItem::Skip("series_master_without_occurrence".to_owned());
            }
            return NormalizedItem::Skip("extraction_failed: missing time range".to_owned());
        };
        if end < start {
            return NormalizedItem::Skip("extraction_failed: end before start".to_owned());
        }

        let body = str_field(payload, "description").unwrap_or_default();
        let rule_fields = self.fields.extract_rules(&title, body, start);

        NormalizedItem::Task(TaskDraft {
            title,
            description: str_field(payload, "description").map(str::to_owned),
            start,
            end,
            attendees: string_array(payload, "attendees"),
            location: str_field(payload, "location").map(str::to_owned),
            recurrence,
            priority: rule_fields.priority,
            is_critical: rule_fields.is_critical,
            is_urgent: rule_fields.is_urgent,
            is_spam: false,
            spam_reason: None,
            spam_score: None,
            raw_payload: payload.clone(),
            external_id: item.external_id.clone(),
            external_updated_at: item.external_updated_at,
        })
    }

    // ── Mail ────────────────────────────────────────────────────

    async fn extract_mail(
        &self,
        item: &RawItem,
        now: DateTime<Utc>,
        cancel: &CancelSignal,
    ) -> NormalizedItem {
        let payload = &item.payload;
        let subject = match str_field(payload, "subject") {
            Some(s) if !s.trim().is_empty() => s.trim().to_owned(),
            _ => return NormalizedItem::Skip("extraction_failed: missing subject".to_owned()),
        };
        let sender = str_field(payload, "sender").unwrap_or_default().to_owned();
        let body = str_field(payload, "body").unwrap_or_default().to_owned();
        let labels = string_array(payload, "labels");
        let received_at = ts_field(payload, "received_at").unwrap_or(now);

        let verdict = self
            .spam
            .classify(
                &labels,
                &sender,
                &subject,
                &body,
                self.chatter.as_ref(),
                cancel,
            )
            .await;

        if verdict.is_spam {
            // Spam is persisted (visible to the user) but flagged so
            // planning and nudging exclude it.
            let start = received_at;
            let end = start.checked_add_signed(default_slot()).unwrap_or(start);
            return NormalizedItem::Task(TaskDraft {
                title: subject,
                description: excerpt(&body),
                start,
                end,
                attendees: vec![],
                location: None,
                recurrence: None,
                priority: Priority::Low,
                is_critical: false,
                is_urgent: false,
                is_spam: true,
                spam_reason: verdict.reason,
                spam_score: verdict.score,
                raw_payload: payload.clone(),
                external_id: item.external_id.clone(),
                external_updated_at: item.external_updated_at,
            });
        }

        if !is_actionable(&subject, &body, payload) {
            debug!(subject = %subject, "mail item not actionable");
            return NormalizedItem::Skip("not_actionable".to_owned());
        }

        let fields = self
            .fields
            .extract(&subject, &body, now, self.chatter.as_ref(), cancel)
            .await;

        // The anchor is provider metadata: an explicit deadline when the
        // text carries one, else the received time.
        let start = fields.deadline.unwrap_or(received_at);
        let end = start.checked_add_signed(default_slot()).unwrap_or(start);

        NormalizedItem::Task(TaskDraft {
            title: fields.title,
            description: excerpt(&body),
            start,
            end,
            attendees: vec![],
            location: None,
            recurrence: None,
            priority: fields.priority,
            is_critical: fields.is_critical,
            is_urgent: fields.is_urgent,
            is_spam: false,
            spam_reason: None,
            spam_score: verdict.score,
            raw_payload: payload.clone(),
            external_id: item.external_id.clone(),
            external_updated_at: item.external_updated_at,
        })
    }

    // ── Task manager ────────────────────────────────────────────

    fn extract_task_manager(&self, item: &RawItem) -> NormalizedItem {
        let payload = &item.payload;
        let title = match str_field(payload, "title") {
            Some(t) if !t.trim().is_empty() => t.trim().to_owned(),
            _ => return NormalizedItem::Skip("extraction_failed: missing title".to_owned()),
        };

        let due = ts_field(payload, "due");
        let start = due.unwrap_or_else(|| {
            item.external_updated_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        });
        let end = start.checked_add_signed(default_slot()).unwrap_or(start);
        let notes = str_field(payload, "notes").unwrap_or_default();
        let rule_fields = self.fields.extract_rules(&title, notes, start);

        NormalizedItem::Task(TaskDraft {
            title,
            description: str_field(payload, "notes").map(str::to_owned),
            start,
            end,
            attendees: vec![],
            location: None,
            recurrence: None,
            priority: rule_fields.priority,
            is_critical: rule_fields.is_critical,
            is_urgent: rule_fields.is_urgent,
            is_spam: false,
            spam_reason: None,
            spam_score: None,
            raw_payload: payload.clone(),
            external_id: item.external_id.clone(),
            external_updated_at: item.external_updated_at,
        })
    }
}

/// Actionability heuristic for non-spam mail: an explicit deadline field,
/// a question to answer, or action-verb phrasing.
fn is_actionable(subject: &str, body: &str, payload: &Value) -> bool {
    if payload.get("deadline").is_some() {
        return true;
    }
    let text = format!("{subject}\n{body}").to_lowercase();
    if text.contains('?') {
        return true;
    }
    [
        "please", "can you", "could you", "need", "review", "confirm", "send", "schedule",
        "reply", "by ", "due", "action required", "reminder",
    ]
    .iter()
    .any(|kw| text.contains(kw))
}

fn excerpt(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.chars().take(500).collect())
    }
}

fn str_field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

fn bool_field(payload: &Value, key: &str) -> bool {
    payload.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn ts_field(payload: &Value, key: &str) -> Option<DateTime<Utc>> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn string_array(payload: &Value, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}
