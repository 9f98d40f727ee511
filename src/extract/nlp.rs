//! Task-field extraction from free text: rules first, LLM when available.
//!
//! The LLM may refine the title, deadline hint, and priority flags, but
//! its output is validated against a schema and never produces the
//! structural time range (that comes from provider metadata). On any LLM
//! or schema failure the regex/keyword rules stand alone.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::cancel::CancelSignal;
use crate::llm::{parse_json_response, ChatMessage, ChatRequest, Chatter, RetryingChatter};
use crate::types::Priority;

/// Fields recovered from free text.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFields {
    pub title: String,
    pub priority: Priority,
    pub is_urgent: bool,
    pub is_critical: bool,
    /// Deadline recovered from the text, if any.
    pub deadline: Option<DateTime<Utc>>,
}

/// LLM response schema for field extraction.
#[derive(Debug, Deserialize)]
struct LlmFields {
    title: String,
    #[serde(default)]
    deadline: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    is_urgent: bool,
    #[serde(default)]
    is_critical: bool,
}

/// Rule/LLM text extractor.
pub struct FieldExtractor {
    urgency: Regex,
    low_signal: Regex,
    eod: Regex,
    by_date: Regex,
}

impl std::fmt::Debug for FieldExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldExtractor").finish_non_exhaustive()
    }
}

impl Default for FieldExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldExtractor {
    /// Build the extractor with its keyword rules.
    pub fn new() -> Self {
        Self {
            // Each pattern is fixed and known-good; a failed compile would
            // be a programming error, so fall back to a never-matching
            // pattern rather than panic.
            urgency: compile(r"(?i)\b(urgent|asap|critical|immediately|right away)\b"),
            low_signal: compile(r"(?i)\b(fyi|optional|no rush|whenever|low priority)\b"),
            eod: compile(r"(?i)\b(eod|end of day|by tonight)\b"),
            by_date: compile(r"(?i)\bby\s+(\d{4}-\d{2}-\d{2})\b"),
        }
    }

    /// Rules-only extraction.
    pub fn extract_rules(&self, title: &str, body: &str, now: DateTime<Utc>) -> ExtractedFields {
        let text = format!("{title}\n{body}");
        let urgent = self.urgency.is_match(&text);
        let low = self.low_signal.is_match(&text);
        let deadline = self.rule_deadline(&text, now);

        ExtractedFields {
            title: title.trim().to_owned(),
            priority: map_priority(urgent, low, deadline, now),
            is_urgent: urgent,
            is_critical: self.urgency.is_match(&text)
                && text.to_lowercase().contains("critical"),
            deadline,
        }
    }

    /// Full extraction: LLM refinement over the rule baseline.
    pub async fn extract<C: Chatter>(
        &self,
        title: &str,
        body: &str,
        now: DateTime<Utc>,
        chatter: Option<&RetryingChatter<C>>,
        cancel: &CancelSignal,
    ) -> ExtractedFields {
        let baseline = self.extract_rules(title, body, now);
        let Some(chatter) = chatter else {
            return baseline;
        };

        let body_excerpt: String = body.chars().take(2000).collect();
        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(
                    "Extract the actionable task from the text. Keep the title short. \
                     deadline is ISO-8601 or null. priority is low|normal|high.",
                ),
                ChatMessage::user(format!("Title: {title}\nText:\n{body_excerpt}")),
            ],
            max_tokens: 300,
            response_schema: Some(json!({
                "type": "object",
                "required": ["title"],
                "properties": {
                    "title": {"type": "string"},
                    "deadline": {"type": ["string", "null"]},
                    "priority": {"type": "string", "enum": ["low", "normal", "high"]},
                    "is_urgent": {"type": "boolean"},
                    "is_critical": {"type": "boolean"}
                }
            })),
        };

        match chatter.chat(&request, cancel).await {
            Ok(response) => match parse_json_response::<LlmFields>(&response.text) {
                Ok(fields) => self.merge(baseline, fields, now),
                Err(e) => {
                    warn!(error = %e, "field extraction llm output failed schema, using rules");
                    baseline
                }
            },
            Err(e) => {
                warn!(error = %e, "field extraction llm call failed, using rules");
                baseline
            }
        }
    }

    /// Merge LLM refinements over the rule baseline. Urgency found by the
    /// rules is never downgraded by the LLM.
    fn merge(
        &self,
        baseline: ExtractedFields,
        llm: LlmFields,
        now: DateTime<Utc>,
    ) -> ExtractedFields {
        let title = if llm.title.trim().is_empty() {
            baseline.title
        } else {
            llm.title.trim().to_owned()
        };
        let deadline = llm
            .deadline
            .as_deref()
            .and_then(parse_llm_deadline)
            .or(baseline.deadline);
        let is_urgent = baseline.is_urgent || llm.is_urgent;
        let is_critical = baseline.is_critical || llm.is_critical;

        let llm_priority = llm.priority.as_deref().and_then(|p| Priority::parse(p).ok());
        let priority = match llm_priority {
            Some(p) => p.max_with(map_priority(is_urgent, false, deadline, now)),
            None => map_priority(is_urgent, baseline.priority == Priority::Low, deadline, now),
        };

        ExtractedFields {
            title,
            priority,
            is_urgent,
            is_critical,
            deadline,
        }
    }

    fn rule_deadline(&self, text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(captures) = self.by_date.captures(text) {
            if let Some(date) = captures
                .get(1)
                .and_then(|m| NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d").ok())
            {
                return date.and_hms_opt(17, 0, 0).map(|dt| dt.and_utc());
            }
        }
        if self.eod.is_match(text) {
            return now.date_naive().and_hms_opt(17, 0, 0).map(|dt| dt.and_utc());
        }
        None
    }
}

/// Deterministic priority mapping: explicit urgency or a deadline within
/// 24 hours is high; explicit low-signal wording is low; else normal.
pub fn map_priority(
    urgent: bool,
    low: bool,
    deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Priority {
    let horizon = now.checked_add_signed(Duration::hours(24)).unwrap_or(now);
    let due_soon = deadline
        .map(|d| d >= now && d <= horizon)
        .unwrap_or(false);
    if urgent || due_soon {
        Priority::High
    } else if low {
        Priority::Low
    } else {
        Priority::Normal
    }
}

fn parse_llm_deadline(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(17, 0, 0))
        .map(|dt| dt.and_utc())
}

fn compile(pattern: &str) -> Regex {
    // The patterns are fixed and known-good; fall back to a never-matching
    // expression rather than panic.
    Regex::new(pattern).unwrap_or_else(|_| Regex::new("a^").expect("fallback pattern compiles"))
}
