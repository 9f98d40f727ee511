//! Configuration loading and management.
//!
//! Loads from `./dayflow.toml` (or `$DAYFLOW_CONFIG_PATH`); environment
//! variables override file values; file values override defaults.
//! Unknown keys anywhere in the file are a load error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration loaded from TOML.
///
/// Precedence: env vars > config file > defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DayflowConfig {
    /// Core process settings.
    pub core: CoreConfig,
    /// Nudge scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Ingestion fetch windows.
    pub ingest: IngestConfig,
    /// LLM provider settings.
    pub llm: LlmConfig,
    /// Embedding provider settings.
    pub embedding: EmbeddingConfig,
    /// Vector store settings.
    pub vector: VectorConfig,
    /// Rate limits and timeouts.
    pub limits: LimitsConfig,
    /// Email delivery settings.
    pub email: EmailConfig,
    /// Spam classification settings.
    pub spam: SpamConfig,
    /// Planning settings.
    pub planning: PlanningConfig,
}

impl DayflowConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$DAYFLOW_CONFIG_PATH` or `./dayflow.toml`.
    /// A missing file falls back to defaults; a malformed file or an
    /// unknown key is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string into config (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error on malformed TOML or unknown keys.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: DayflowConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: DayflowConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(DayflowConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    fn config_path() -> PathBuf {
        std::env::var("DAYFLOW_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("dayflow.toml"))
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function for testability.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("DAYFLOW_DB_PATH") {
            self.core.db_path = v;
        }
        if let Some(v) = env("DAYFLOW_LOG_LEVEL") {
            self.core.log_level = v;
        }
        if let Some(v) = env("DAYFLOW_TICK_INTERVAL_SECS") {
            match v.parse() {
                Ok(n) => self.scheduler.tick_interval_secs = n,
                Err(_) => tracing::warn!(
                    var = "DAYFLOW_TICK_INTERVAL_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("DAYFLOW_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = env("DAYFLOW_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = env("DAYFLOW_EMBEDDING_BASE_URL") {
            self.embedding.base_url = v;
        }
        if let Some(v) = env("DAYFLOW_VECTOR_BASE_URL") {
            self.vector.base_url = v;
        }
        if let Some(v) = env("DAYFLOW_EMAIL_ENABLED") {
            match v.parse() {
                Ok(b) => self.email.email_enabled = b,
                Err(_) => tracing::warn!(
                    var = "DAYFLOW_EMAIL_ENABLED",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Reject values that parse but cannot work.
    fn validate(&self) -> Result<()> {
        if self.scheduler.tick_interval_secs < 30 {
            anyhow::bail!(
                "scheduler.tick_interval_secs must be >= 30, got {}",
                self.scheduler.tick_interval_secs
            );
        }
        if !(0.0..=1.0).contains(&self.spam.spam_llm_threshold) {
            anyhow::bail!(
                "spam.spam_llm_threshold must be in [0, 1], got {}",
                self.spam.spam_llm_threshold
            );
        }
        if let Some(ref cadence) = self.scheduler.sync_cadence {
            use std::str::FromStr;
            cron::Schedule::from_str(cadence)
                .with_context(|| format!("invalid scheduler.sync_cadence: {cadence:?}"))?;
        }
        self.planning.working_window.validate()?;
        Ok(())
    }
}

// ── Core ────────────────────────────────────────────────────────

/// Core process settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// SQLite database path.
    pub db_path: String,
    /// Tracing log level filter.
    pub log_level: String,
    /// Logs directory for file output.
    pub logs_dir: String,
    /// Fallback IANA timezone when a user has none configured.
    pub timezone: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            db_path: "dayflow.db".to_owned(),
            log_level: "info".to_owned(),
            logs_dir: "logs".to_owned(),
            timezone: "UTC".to_owned(),
        }
    }
}

// ── Scheduler ───────────────────────────────────────────────────

/// Nudge scheduler settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks.
    pub tick_interval_secs: u64,
    /// How far ahead of `predicted_start` a nudge may fire, in seconds.
    pub nudge_lookahead_secs: u64,
    /// How far behind `predicted_start` a nudge may still fire, in seconds.
    pub nudge_grace_secs: u64,
    /// Per-user slice budget within one tick, in seconds.
    pub user_budget_secs: u64,
    /// Optional cron expression for background task-manager sync.
    pub sync_cadence: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 120,
            nudge_lookahead_secs: 300,
            nudge_grace_secs: 60,
            user_budget_secs: 10,
            sync_cadence: None,
        }
    }
}

impl SchedulerConfig {
    /// Tick period as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Outer tick budget guaranteeing non-overlapping ticks.
    pub fn tick_budget(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.saturating_sub(15).max(15))
    }

    /// Per-user slice budget.
    pub fn user_budget(&self) -> Duration {
        Duration::from_secs(self.user_budget_secs)
    }
}

// ── Ingest ──────────────────────────────────────────────────────

/// Fetch windows per source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    /// Days of calendar history to fetch.
    pub calendar_days_back: u32,
    /// Days of calendar future to fetch.
    pub calendar_days_forward: u32,
    /// Days of mail history to fetch.
    pub mail_days_back: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            calendar_days_back: 30,
            calendar_days_forward: 90,
            mail_days_back: 7,
        }
    }
}

// ── LLM / Embedding / Vector ────────────────────────────────────

/// LLM provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    /// API base URL.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Retries applied to rate-limited/transient LLM failures.
    pub llm_retry_budget: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_owned(),
            model: "claude-sonnet-4-20250514".to_owned(),
            api_key_env: "DAYFLOW_LLM_API_KEY".to_owned(),
            llm_retry_budget: 3,
        }
    }
}

/// Embedding provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingConfig {
    /// API base URL.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Embedding dimensionality.
    pub dims: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_owned(),
            model: "nomic-embed-text".to_owned(),
            dims: 768,
        }
    }
}

/// Vector store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VectorConfig {
    /// API base URL.
    pub base_url: String,
    /// Collection name for task vectors.
    pub collection: String,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:6333".to_owned(),
            collection: "tasks".to_owned(),
        }
    }
}

// ── Limits ──────────────────────────────────────────────────────

/// One provider's token-bucket parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Maximum burst size.
    pub capacity: u32,
    /// Tokens restored per second.
    pub refill_per_sec: f64,
}

/// Rate limits and timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Per-provider token buckets, keyed by provider name.
    pub provider_rate_limits: HashMap<String, RateLimitConfig>,
    /// Timeout for one external call, in seconds.
    pub call_timeout_secs: u64,
    /// Timeout for one pipeline stage, in seconds.
    pub stage_timeout_secs: u64,
    /// Timeout for one full workflow run, in seconds.
    pub run_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let mut provider_rate_limits = HashMap::new();
        provider_rate_limits.insert(
            "calendar".to_owned(),
            RateLimitConfig {
                capacity: 10,
                refill_per_sec: 2.0,
            },
        );
        provider_rate_limits.insert(
            "mail".to_owned(),
            RateLimitConfig {
                capacity: 10,
                refill_per_sec: 2.0,
            },
        );
        provider_rate_limits.insert(
            "task_manager".to_owned(),
            RateLimitConfig {
                capacity: 5,
                refill_per_sec: 1.0,
            },
        );
        Self {
            provider_rate_limits,
            call_timeout_secs: 30,
            stage_timeout_secs: 120,
            run_timeout_secs: 600,
        }
    }
}

impl LimitsConfig {
    /// Per-call timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Per-stage timeout.
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Per-run timeout.
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

// ── Email ───────────────────────────────────────────────────────

/// Email delivery settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmailConfig {
    /// Gate for SMTP dispatch; in-app delivery is unaffected.
    pub email_enabled: bool,
    /// SMTP relay host.
    pub smtp_host: String,
    /// SMTP relay port.
    pub smtp_port: u16,
    /// From address for nudge mail.
    pub from: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            email_enabled: false,
            smtp_host: "localhost".to_owned(),
            smtp_port: 587,
            from: "nudges@dayflow.local".to_owned(),
        }
    }
}

// ── Spam ────────────────────────────────────────────────────────

/// Spam classification settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpamConfig {
    /// LLM spam score at or above which an item is flagged.
    pub spam_llm_threshold: f64,
    /// Title patterns that drop plan entries post-LLM.
    pub promo_patterns: Vec<String>,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            spam_llm_threshold: 0.7,
            promo_patterns: vec![
                r"(?i)\b\d{1,3}% off\b".to_owned(),
                r"(?i)\bunsubscribe\b".to_owned(),
                r"(?i)\bflash sale\b".to_owned(),
                r"(?i)\blimited time offer\b".to_owned(),
            ],
        }
    }
}

// ── Planning ────────────────────────────────────────────────────

/// Earliest/latest allowed plan times.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkingWindow {
    /// Earliest plan time, `HH:MM`.
    pub start: String,
    /// Latest plan time, `HH:MM`.
    pub end: String,
}

impl Default for WorkingWindow {
    fn default() -> Self {
        Self {
            start: "08:00".to_owned(),
            end: "20:00".to_owned(),
        }
    }
}

impl WorkingWindow {
    /// Parse both bounds as naive times.
    ///
    /// # Errors
    ///
    /// Returns an error when either bound is not `HH:MM` or the window is
    /// inverted.
    pub fn validate(&self) -> Result<()> {
        let (start, end) = self.bounds()?;
        if end <= start {
            anyhow::bail!(
                "planning.working_window end {:?} must be after start {:?}",
                self.end,
                self.start
            );
        }
        Ok(())
    }

    /// The window bounds as naive times.
    ///
    /// # Errors
    ///
    /// Returns an error when either bound is not `HH:MM`.
    pub fn bounds(&self) -> Result<(chrono::NaiveTime, chrono::NaiveTime)> {
        let start = chrono::NaiveTime::parse_from_str(&self.start, "%H:%M")
            .with_context(|| format!("invalid working_window.start: {:?}", self.start))?;
        let end = chrono::NaiveTime::parse_from_str(&self.end, "%H:%M")
            .with_context(|| format!("invalid working_window.end: {:?}", self.end))?;
        Ok((start, end))
    }
}

/// Planning settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlanningConfig {
    /// Working window applied when a user has no per-user override.
    pub working_window: WorkingWindow,
    /// Energy level assumed when the user has not set one (1..=5).
    pub default_energy: u8,
    /// Days of feedback history consulted for snooze learning.
    pub feedback_window_days: u32,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            working_window: WorkingWindow::default(),
            default_energy: 3,
            feedback_window_days: 14,
        }
    }
}
