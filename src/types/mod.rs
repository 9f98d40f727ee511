//! Core domain types shared across every component.
//!
//! Enum types that persist to SQLite carry `as_str`/`parse` pairs so the
//! store layer round-trips them as TEXT without serde overhead.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Opaque user identifier. Authentication happens upstream; the core only
/// scopes rows by it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Sources and providers
// ---------------------------------------------------------------------------

/// Where a task originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    /// Calendar provider event.
    Calendar,
    /// Mail provider message.
    Mail,
    /// External task manager item.
    TaskManager,
    /// Created directly by the user.
    Manual,
}

impl TaskSource {
    /// String stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calendar => "calendar",
            Self::Mail => "mail",
            Self::TaskManager => "task_manager",
            Self::Manual => "manual",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the value is not a recognised source.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "calendar" => Ok(Self::Calendar),
            "mail" => Ok(Self::Mail),
            "task_manager" => Ok(Self::TaskManager),
            "manual" => Ok(Self::Manual),
            other => Err(CoreError::invalid(format!("unknown task source: {other}"))),
        }
    }
}

/// External provider requiring a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Calendar provider.
    Calendar,
    /// Mail provider.
    Mail,
    /// Task manager provider.
    TaskManager,
}

impl Provider {
    /// String stored in SQLite and used in rate-limit config keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calendar => "calendar",
            Self::Mail => "mail",
            Self::TaskManager => "task_manager",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the value is not a recognised provider.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "calendar" => Ok(Self::Calendar),
            "mail" => Ok(Self::Mail),
            "task_manager" => Ok(Self::TaskManager),
            other => Err(CoreError::invalid(format!("unknown provider: {other}"))),
        }
    }

    /// The task source produced by items from this provider.
    pub fn task_source(&self) -> TaskSource {
        match self {
            Self::Calendar => TaskSource::Calendar,
            Self::Mail => TaskSource::Mail,
            Self::TaskManager => TaskSource::TaskManager,
        }
    }
}

impl TryFrom<TaskSource> for Provider {
    type Error = CoreError;

    fn try_from(source: TaskSource) -> Result<Self, CoreError> {
        match source {
            TaskSource::Calendar => Ok(Self::Calendar),
            TaskSource::Mail => Ok(Self::Mail),
            TaskSource::TaskManager => Ok(Self::TaskManager),
            TaskSource::Manual => Err(CoreError::invalid("manual tasks have no provider")),
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Stored OAuth-style credential for one (user, provider) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCredential {
    pub id: Uuid,
    pub user: UserId,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Access-token expiry; `None` means non-expiring.
    pub expires_at: Option<DateTime<Utc>>,
    /// Space-separated granted scopes.
    pub scopes: String,
    /// Set when a refresh fails; every dependent workflow fails fast.
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Display for ProviderCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Tokens never appear in logs.
        write!(
            f,
            "credential({}, {}, revoked={})",
            self.user,
            self.provider.as_str(),
            self.revoked
        )
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Task priority classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// String stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the value is not a recognised priority.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(CoreError::invalid(format!("unknown priority: {other}"))),
        }
    }

    /// Deterministic weight used by the planner score.
    pub fn weight(&self) -> f64 {
        match self {
            Self::High => 1.0,
            Self::Normal => 0.5,
            Self::Low => 0.2,
        }
    }

    /// The higher of two priorities.
    pub fn max_with(self, other: Priority) -> Priority {
        if self.weight() >= other.weight() {
            self
        } else {
            other
        }
    }
}

/// Synchronization state of a task relative to the external task manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local and remote agree as of `last_synced_at`.
    Synced,
    /// Local changes are waiting to be pushed outbound.
    Pending,
    /// Both sides changed since the last sync; user must resolve.
    Conflict,
    /// The last outbound push failed; retried on a floor schedule.
    Error,
}

impl SyncStatus {
    /// String stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "conflict" => Ok(Self::Conflict),
            "error" => Ok(Self::Error),
            other => Err(CoreError::invalid(format!("unknown sync status: {other}"))),
        }
    }
}

/// Which directions a task participates in during sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Inbound,
    Outbound,
    Bidirectional,
}

impl SyncDirection {
    /// String stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Bidirectional => "bidirectional",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the value is not a recognised direction.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            "bidirectional" => Ok(Self::Bidirectional),
            other => Err(CoreError::invalid(format!(
                "unknown sync direction: {other}"
            ))),
        }
    }
}

/// The normalized, persistent unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user: UserId,
    pub source: TaskSource,
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: Vec<String>,
    pub location: Option<String>,
    /// Provider recurrence string, passed through unexpanded.
    pub recurrence: Option<String>,
    pub priority: Priority,
    /// User-settable flag, preserved across re-ingest.
    pub is_critical: bool,
    /// User-settable flag, preserved across re-ingest.
    pub is_urgent: bool,
    pub is_spam: bool,
    pub spam_reason: Option<String>,
    pub spam_score: Option<f64>,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub raw_payload: serde_json::Value,
    pub external_id: Option<String>,
    pub sync_status: SyncStatus,
    pub sync_direction: SyncDirection,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub external_updated_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
    /// When the last outbound push was attempted (errored tasks only).
    pub sync_attempted_at: Option<DateTime<Utc>>,
    /// Consecutive failed push attempts, reset on success.
    pub sync_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Content fields for a task as produced by extraction, before the store
/// assigns identity and timestamps. User-settable flags here are initial
/// values only; re-ingest never overwrites them on existing rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDraft {
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: Vec<String>,
    pub location: Option<String>,
    pub recurrence: Option<String>,
    pub priority: Priority,
    pub is_critical: bool,
    pub is_urgent: bool,
    pub is_spam: bool,
    pub spam_reason: Option<String>,
    pub spam_score: Option<f64>,
    pub raw_payload: serde_json::Value,
    pub external_id: Option<String>,
    pub external_updated_at: Option<DateTime<Utc>>,
}

/// User-settable flags on a task, editable through the facade.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskFlags {
    /// New critical flag, if changing.
    pub is_critical: Option<bool>,
    /// New urgent flag, if changing.
    pub is_urgent: Option<bool>,
    /// New completion state, if changing.
    pub is_completed: Option<bool>,
}

// ---------------------------------------------------------------------------
// Reminders
// ---------------------------------------------------------------------------

/// A time-anchored item kept off the daily plan unless promoted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub user: UserId,
    pub source: TaskSource,
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub is_all_day: bool,
    pub external_id: Option<String>,
    pub raw_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// Lifecycle status of a daily plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Active,
    Completed,
    Cancelled,
}

impl PlanStatus {
    /// String stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CoreError::invalid(format!("unknown plan status: {other}"))),
        }
    }
}

/// Denormalized status of one scheduled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Done,
    Snoozed,
}

impl EntryStatus {
    /// String stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Snoozed => "snoozed",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "done" => Ok(Self::Done),
            "snoozed" => Ok(Self::Snoozed),
            other => Err(CoreError::invalid(format!("unknown entry status: {other}"))),
        }
    }
}

/// One scheduled task within a daily plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub task_id: String,
    pub title: String,
    pub predicted_start: DateTime<Utc>,
    pub predicted_end: DateTime<Utc>,
    /// Deterministic priority score in `[0, 1]`.
    pub priority_score: f64,
    pub is_critical: bool,
    pub is_urgent: bool,
    /// 1–6 short steps from the LLM; empty on deterministic fallback.
    pub action_plan: Vec<String>,
    pub status: EntryStatus,
}

/// The ordered schedule for one user on one date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyPlan {
    pub id: Uuid,
    pub user: UserId,
    pub date: NaiveDate,
    pub status: PlanStatus,
    /// Energy level snapshot at generation time.
    pub energy_level: Option<u8>,
    pub entries: Vec<PlanEntry>,
    pub generated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

/// What the user did with a planned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackAction {
    Done,
    Snoozed,
}

impl FeedbackAction {
    /// String stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Snoozed => "snoozed",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the value is not a recognised action.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "done" => Ok(Self::Done),
            "snoozed" => Ok(Self::Snoozed),
            other => Err(CoreError::invalid(format!(
                "unknown feedback action: {other}"
            ))),
        }
    }
}

/// Append-only record of a done/snooze action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFeedback {
    pub id: Uuid,
    pub user: UserId,
    pub task_id: String,
    pub plan_id: Option<Uuid>,
    pub action: FeedbackAction,
    pub snooze_minutes: Option<u32>,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Delivery state of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Dismissed,
}

impl NotificationStatus {
    /// String stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Dismissed => "dismissed",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "dismissed" => Ok(Self::Dismissed),
            other => Err(CoreError::invalid(format!(
                "unknown notification status: {other}"
            ))),
        }
    }
}

/// A nudge tied to a plan entry's predicted start.
///
/// At most one notification per `(user, task, plan)` exists in a
/// non-dismissed state; the store's partial unique index enforces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user: UserId,
    pub task_id: String,
    pub plan_id: Option<Uuid>,
    pub kind: String,
    pub message: String,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub status: NotificationStatus,
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// Kind of edge between two tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Blocks,
    DependsOn,
    RelatedTo,
}

impl DependencyKind {
    /// String stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::DependsOn => "depends_on",
            Self::RelatedTo => "related_to",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the value is not a recognised kind.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "blocks" => Ok(Self::Blocks),
            "depends_on" => Ok(Self::DependsOn),
            "related_to" => Ok(Self::RelatedTo),
            other => Err(CoreError::invalid(format!(
                "unknown dependency kind: {other}"
            ))),
        }
    }
}

/// A directed dependency edge. The graph stays acyclic; inserts that
/// would close a cycle are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDependency {
    pub task_id: String,
    pub blocked_by_task_id: String,
    pub kind: DependencyKind,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Per-user settings
// ---------------------------------------------------------------------------

/// Optional per-user overrides for timezone, email and working window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSettings {
    pub user: UserId,
    /// IANA timezone name; falls back to the configured default.
    pub timezone: Option<String>,
    /// Email address for nudge delivery.
    pub email: Option<String>,
    pub email_enabled: bool,
    /// Earliest allowed plan time, `HH:MM`.
    pub work_start: Option<String>,
    /// Latest allowed plan time, `HH:MM`.
    pub work_end: Option<String>,
}
