use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
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

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_f64(profile: &str, key: &str, default: f64) -> f64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_f64_opt(profile: &str, key: &str) -> Option<f64> {
    profiled_env_opt(profile, key).and_then(|v| v.parse().ok())
}

fn override_usize(key: &str, target: &mut usize) {
    if let Some(v) = env_opt(key).and_then(|v| v.parse().ok()) {
        *target = v;
    }
}

fn override_f64(key: &str, target: &mut f64) {
    if let Some(v) = env_opt(key).and_then(|v| v.parse().ok()) {
        *target = v;
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub prefs: Preferences,
    #[serde(default)]
    pub host: HostConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `CRUNCH_PROFILE`. When set (e.g. `LAPTOP`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let profile = env_or("CRUNCH_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Result<Self, ConfigError> {
        let p = profile.to_uppercase();
        let p = p.as_str();
        let config = Self {
            profile: p.to_string(),
            prefs: Preferences::from_env_profiled(p),
            host: HostConfig::from_env_profiled(p),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string, then apply `CRUNCH_*` overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Number of processor slots the scheduler may fill.
    pub fn effective_cpus(&self) -> usize {
        self.prefs.max_cpus.min(self.host.processor_count)
    }

    /// Total wall time available across all slots in one scheduling period.
    pub fn epoch_wall_secs(&self) -> f64 {
        self.prefs.period_secs() * self.effective_cpus() as f64
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `CRUNCH_SECTION_KEY` overrides `section.key`, e.g.
    /// `CRUNCH_PREFS_MAX_CPUS` → `prefs.max_cpus`,
    /// `CRUNCH_HOST_SPEED_FACTOR` → `host.speed_factor`.
    fn apply_env_overrides(&mut self) {
        override_usize("CRUNCH_PREFS_MAX_CPUS", &mut self.prefs.max_cpus);
        override_f64(
            "CRUNCH_PREFS_CPU_SCHEDULING_PERIOD_MINUTES",
            &mut self.prefs.cpu_scheduling_period_minutes,
        );
        override_f64("CRUNCH_PREFS_WORK_BUF_MIN_DAYS", &mut self.prefs.work_buf_min_days);
        override_f64("CRUNCH_PREFS_UP_FRAC", &mut self.prefs.up_frac);
        override_usize("CRUNCH_HOST_PROCESSOR_COUNT", &mut self.host.processor_count);
        override_f64("CRUNCH_HOST_SPEED_FACTOR", &mut self.host.speed_factor);
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Reject values the scheduler cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.prefs.validate()?;
        self.host.validate()?;
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  cpus:        max_cpus={}, processors={}, effective={}",
            self.prefs.max_cpus,
            self.host.processor_count,
            self.effective_cpus()
        );
        tracing::info!(
            "  scheduling:  period={}min, up_frac={}",
            self.prefs.cpu_scheduling_period_minutes,
            self.prefs.up_frac
        );
        tracing::info!(
            "  work fetch:  buffer={}d, backoff={}s..{}s",
            self.prefs.work_buf_min_days,
            self.prefs.backoff_min_secs,
            self.prefs.backoff_max_secs
        );
        tracing::info!("  host:        speed_factor={}", self.host.speed_factor);
    }

    /// Return a JSON view of the effective settings.
    pub fn summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "effective_cpus": self.effective_cpus(),
            "prefs": self.prefs,
            "host": self.host,
        })
    }
}

// ── Preferences ───────────────────────────────────────────────

/// User scheduling preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preferences {
    /// Upper bound on concurrently running tasks.
    #[serde(default = "available_cpus")]
    pub max_cpus: usize,
    /// Scheduling period (epoch length) in minutes.
    #[serde(default = "default_period_minutes")]
    pub cpu_scheduling_period_minutes: f64,
    /// Target queue depth in days.
    #[serde(default = "default_work_buf_min_days")]
    pub work_buf_min_days: f64,
    /// Fraction of time-to-deadline the queue may commit before panic mode.
    #[serde(default = "default_up_frac")]
    pub up_frac: f64,
    /// First backoff interval after an unreachable project.
    #[serde(default = "default_backoff_min")]
    pub backoff_min_secs: f64,
    /// Ceiling for the doubling backoff.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: f64,
    /// Optional exponential decay of short-term debt. Off unless set.
    #[serde(default)]
    pub short_term_debt_half_life_hours: Option<f64>,
}

/// One week. Longer periods leave the epoch timer meaningless.
const MAX_PERIOD_MINUTES: f64 = 10_080.0;

fn default_period_minutes() -> f64 { 60.0 }
fn default_work_buf_min_days() -> f64 { 0.1 }
fn default_up_frac() -> f64 { 0.8 }
fn default_backoff_min() -> f64 { 60.0 }
fn default_backoff_max() -> f64 { 86_400.0 }

impl Default for Preferences {
    fn default() -> Self {
        Self {
            max_cpus: available_cpus(),
            cpu_scheduling_period_minutes: default_period_minutes(),
            work_buf_min_days: default_work_buf_min_days(),
            up_frac: default_up_frac(),
            backoff_min_secs: default_backoff_min(),
            backoff_max_secs: default_backoff_max(),
            short_term_debt_half_life_hours: None,
        }
    }
}

impl Preferences {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            max_cpus: profiled_env_usize(p, "MAX_CPUS", available_cpus()),
            cpu_scheduling_period_minutes: profiled_env_f64(
                p,
                "CPU_SCHEDULING_PERIOD_MINUTES",
                default_period_minutes(),
            ),
            work_buf_min_days: profiled_env_f64(p, "WORK_BUF_MIN_DAYS", default_work_buf_min_days()),
            up_frac: profiled_env_f64(p, "UP_FRAC", default_up_frac()),
            backoff_min_secs: profiled_env_f64(p, "BACKOFF_MIN_SECS", default_backoff_min()),
            backoff_max_secs: profiled_env_f64(p, "BACKOFF_MAX_SECS", default_backoff_max()),
            short_term_debt_half_life_hours: profiled_env_f64_opt(
                p,
                "SHORT_TERM_DEBT_HALF_LIFE_HOURS",
            ),
        }
    }

    /// Epoch length in seconds.
    pub fn period_secs(&self) -> f64 {
        self.cpu_scheduling_period_minutes * 60.0
    }

    /// Target queue depth in seconds.
    pub fn min_queue_secs(&self) -> f64 {
        self.work_buf_min_days * 86_400.0
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cpus == 0 {
            return Err(ConfigError::invalid("max_cpus", "must be at least 1"));
        }
        let period = self.cpu_scheduling_period_minutes;
        if !(period > 0.0 && period <= MAX_PERIOD_MINUTES) {
            return Err(ConfigError::invalid(
                "cpu_scheduling_period_minutes",
                format!("must be in (0, {}], got {}", MAX_PERIOD_MINUTES, period),
            ));
        }
        if !(self.work_buf_min_days >= 0.0 && self.work_buf_min_days.is_finite()) {
            return Err(ConfigError::invalid(
                "work_buf_min_days",
                format!("must be finite and >= 0, got {}", self.work_buf_min_days),
            ));
        }
        if !(self.up_frac > 0.0 && self.up_frac <= 1.0) {
            return Err(ConfigError::invalid(
                "up_frac",
                format!("must be in (0, 1], got {}", self.up_frac),
            ));
        }
        if !(self.backoff_max_secs.is_finite() && self.backoff_min_secs > 0.0)
            || self.backoff_min_secs > self.backoff_max_secs
        {
            return Err(ConfigError::invalid(
                "backoff_min_secs",
                format!(
                    "need finite 0 < min <= max, got {}..{}",
                    self.backoff_min_secs, self.backoff_max_secs
                ),
            ));
        }
        if let Some(h) = self.short_term_debt_half_life_hours {
            if !(h > 0.0 && h.is_finite()) {
                return Err(ConfigError::invalid(
                    "short_term_debt_half_life_hours",
                    format!("must be finite and > 0 when set, got {}", h),
                ));
            }
        }
        Ok(())
    }
}

// ── Host ──────────────────────────────────────────────────────

/// Host capability as reported by the platform and benchmark collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "available_cpus")]
    pub processor_count: usize,
    /// Benchmark-derived speed relative to the reference host.
    #[serde(default = "default_speed_factor")]
    pub speed_factor: f64,
}

fn default_speed_factor() -> f64 { 1.0 }

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            processor_count: available_cpus(),
            speed_factor: default_speed_factor(),
        }
    }
}

impl HostConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            processor_count: profiled_env_usize(p, "PROCESSOR_COUNT", available_cpus()),
            speed_factor: profiled_env_f64(p, "SPEED_FACTOR", default_speed_factor()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.processor_count == 0 {
            return Err(ConfigError::invalid("processor_count", "must be at least 1"));
        }
        if !(self.speed_factor > 0.0 && self.speed_factor.is_finite()) {
            return Err(ConfigError::invalid(
                "speed_factor",
                format!("must be finite and > 0, got {}", self.speed_factor),
            ));
        }
        Ok(())
    }
}
