use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str) -> Option<T> {
    profiled_env_opt(profile, key).and_then(|v| v.parse().ok())
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `HISTPLAY_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, CoreError> {
        let profile = env::var("HISTPLAY_PROFILE").unwrap_or_default().to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Result<Self, CoreError> {
        let mut config = Self {
            profile: profile.to_uppercase(),
            ..Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string, then apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, CoreError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.profile = config.profile.to_uppercase();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `HISTPLAY_SECTION_KEY` overrides `section.key`, e.g.
    /// `HISTPLAY_TIMER_MAX_WAIT_MS` -> `timer.max_wait_ms`.
    fn apply_env_overrides(&mut self) {
        let p = self.profile.clone();
        let p = p.as_str();

        if let Some(v) = profiled_env_parse(p, "HISTPLAY_TIMER_MAX_WAIT_MS") {
            self.timer.max_wait_ms = v;
        }
        if let Some(v) = profiled_env_parse(p, "HISTPLAY_TIMER_ON_SCHEDULE_THRESHOLD_MS") {
            self.timer.on_schedule_threshold_ms = v;
        }
        if let Some(v) = profiled_env_opt(p, "HISTPLAY_TIMER_THREAD_NAME_PREFIX") {
            self.timer.thread_name_prefix = v;
        }
        if let Some(v) = profiled_env_opt(p, "HISTPLAY_DRIFT_ENABLED") {
            self.drift.enabled = v == "true" || v == "1";
        }
        if let Some(v) = profiled_env_parse(p, "HISTPLAY_DRIFT_MAX_PAUSE_MS") {
            self.drift.max_pause_ms = v;
        }
        if let Some(v) = profiled_env_parse(p, "HISTPLAY_REPLAY_BEHIND_SCHEDULE_THRESHOLD_MS") {
            self.replay.behind_schedule_threshold_ms = v;
        }
        if let Some(v) = profiled_env_opt(p, "HISTPLAY_REPLAY_INVALID_REASON") {
            self.replay.invalid_reason = v;
        }
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.timer.max_wait_ms < 1 {
            return Err(CoreError::Config("timer.max_wait_ms must be at least 1".into()));
        }
        if self.timer.thread_name_prefix.trim().is_empty() {
            return Err(CoreError::Config("timer.thread_name_prefix must not be empty".into()));
        }
        if self.replay.behind_schedule_threshold_ms <= self.timer.on_schedule_threshold_ms {
            return Err(CoreError::Config(format!(
                "replay.behind_schedule_threshold_ms ({}) must exceed timer.on_schedule_threshold_ms ({})",
                self.replay.behind_schedule_threshold_ms, self.timer.on_schedule_threshold_ms
            )));
        }
        if self.drift.max_pause_ms < 1 {
            return Err(CoreError::Config("drift.max_pause_ms must be at least 1".into()));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  timer:   max_wait_ms={}, on_schedule_threshold_ms={}, thread_prefix={}",
            self.timer.max_wait_ms,
            self.timer.on_schedule_threshold_ms,
            self.timer.thread_name_prefix
        );
        tracing::info!(
            "  drift:   enabled={}, max_pause_ms={}",
            self.drift.enabled,
            self.drift.max_pause_ms
        );
        tracing::info!(
            "  replay:  behind_schedule_threshold_ms={}",
            self.replay.behind_schedule_threshold_ms
        );
    }
}

// ── Timer ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Upper bound on a single worker wait, in real milliseconds. A speed
    /// change during a wait is noticed within this window.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Lag (virtual ms) under which a lagging timer counts as caught up again.
    #[serde(default = "default_on_schedule_threshold_ms")]
    pub on_schedule_threshold_ms: i64,
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

fn default_max_wait_ms() -> u64 { 300 }
fn default_on_schedule_threshold_ms() -> i64 { 20 }
fn default_thread_name_prefix() -> String { "history-timer".into() }

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: default_max_wait_ms(),
            on_schedule_threshold_ms: default_on_schedule_threshold_ms(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

// ── Drift guard ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    #[serde(default = "default_drift_enabled")]
    pub enabled: bool,
    /// Cap on a single backpressure pause, in real milliseconds.
    #[serde(default = "default_max_pause_ms")]
    pub max_pause_ms: u64,
}

fn default_drift_enabled() -> bool { true }
fn default_max_pause_ms() -> u64 { 10_000 }

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            enabled: default_drift_enabled(),
            max_pause_ms: default_max_pause_ms(),
        }
    }
}

// ── Replay ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Tolerated lag in real milliseconds; scaled by playback speed before use.
    #[serde(default = "default_behind_schedule_threshold_ms")]
    pub behind_schedule_threshold_ms: i64,
    /// Reason attached to the placeholder published for ids without a value.
    #[serde(default = "default_invalid_reason")]
    pub invalid_reason: String,
}

fn default_behind_schedule_threshold_ms() -> i64 { 200 }
fn default_invalid_reason() -> String {
    "No history records was found at the specified time".into()
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            behind_schedule_threshold_ms: default_behind_schedule_threshold_ms(),
            invalid_reason: default_invalid_reason(),
        }
    }
}
