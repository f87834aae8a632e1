//! Ally configuration system.
//!
//! Every numeric planning policy (chunk size, daily cap, breaks, overflow
//! tolerance) is configuration with a default rather than a constant.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AllyError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllyConfig {
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub reminders: ReminderConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AllyConfig {
    /// Load config from the default path (~/.ally/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AllyError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| AllyError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AllyError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Ally home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ally")
    }

    /// Reject policies the planner cannot honour.
    pub fn validate(&self) -> Result<()> {
        let p = &self.planner;
        check_range("planner.max_chunk_minutes", p.max_chunk_minutes, 1, MAX_MINUTES)?;
        check_range("planner.min_chunk_minutes", p.min_chunk_minutes, 1, MAX_MINUTES)?;
        if p.min_chunk_minutes > p.max_chunk_minutes {
            return Err(AllyError::Config(format!(
                "min_chunk_minutes ({}) exceeds max_chunk_minutes ({})",
                p.min_chunk_minutes, p.max_chunk_minutes
            )));
        }
        check_range("planner.daily_cap_minutes", p.daily_cap_minutes, 1, MINUTES_PER_DAY)?;
        check_range("planner.min_gap_minutes", p.min_gap_minutes, 0, MINUTES_PER_DAY)?;
        if !(p.overflow_tolerance.is_finite() && p.overflow_tolerance >= 0.0) {
            return Err(AllyError::Config("overflow_tolerance must be >= 0".into()));
        }
        if !(p.missed_weight_boost.is_finite() && p.missed_weight_boost >= 0.0) {
            return Err(AllyError::Config("missed_weight_boost must be >= 0".into()));
        }
        check_range("planner.urgency_horizon_hours", p.urgency_horizon_hours, 1, MAX_HOURS)?;
        check_range("planner.urgency_epsilon_minutes", p.urgency_epsilon_minutes, 1, MAX_MINUTES)?;
        check_range("planner.near_deadline_hours", p.near_deadline_hours, 0, MAX_HOURS)?;

        let r = &self.reminders;
        if r.tick_secs == 0 {
            return Err(AllyError::Config("reminders.tick_secs must be > 0".into()));
        }
        check_range("reminders.session_lead_minutes", r.session_lead_minutes, 0, MAX_MINUTES)?;
        check_range("reminders.break_window_minutes", r.break_window_minutes, 0, MAX_MINUTES)?;
        check_range("reminders.exam_warning_hours", r.exam_warning_hours, 0, MAX_HOURS)?;
        check_range("reminders.default_snooze_minutes", r.default_snooze_minutes, 1, MAX_MINUTES)?;
        if r.daily_motivation_hour > 23 {
            return Err(AllyError::Config("daily_motivation_hour must be 0-23".into()));
        }
        Ok(())
    }
}

/// Upper bound for any minute-valued setting: one year.
pub const MAX_MINUTES: i64 = 525_600;
/// Upper bound for any hour-valued setting: one year.
pub const MAX_HOURS: i64 = 8_760;
const MINUTES_PER_DAY: i64 = 1_440;

fn check_range(name: &str, value: i64, min: i64, max: i64) -> Result<()> {
    if value < min || value > max {
        return Err(AllyError::Config(format!("{name} must be within {min}..={max}, got {value}")));
    }
    Ok(())
}

/// Allocation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Upper bound for a single study chunk.
    #[serde(default = "default_max_chunk")]
    pub max_chunk_minutes: i64,
    /// Floor for chunks shrunk near a deadline.
    #[serde(default = "default_min_chunk")]
    pub min_chunk_minutes: i64,
    /// Maximum study time per UTC calendar day.
    #[serde(default = "default_daily_cap")]
    pub daily_cap_minutes: i64,
    /// Minimum break between consecutive sessions.
    #[serde(default = "default_min_gap")]
    pub min_gap_minutes: i64,
    /// Fraction by which effort may exceed capacity before planning fails.
    #[serde(default = "default_overflow_tolerance")]
    pub overflow_tolerance: f64,
    /// Deadline distance that counts as "one unit" of urgency.
    #[serde(default = "default_urgency_horizon")]
    pub urgency_horizon_hours: i64,
    /// Lower bound on time-to-deadline when scoring urgency.
    #[serde(default = "default_urgency_epsilon")]
    pub urgency_epsilon_minutes: i64,
    /// Chunks start shrinking when the deadline is closer than this.
    #[serde(default = "default_near_deadline")]
    pub near_deadline_hours: i64,
    /// Extra weight per missed session of a topic.
    #[serde(default = "default_missed_boost")]
    pub missed_weight_boost: f64,
}

fn default_max_chunk() -> i64 { 50 }
fn default_min_chunk() -> i64 { 25 }
fn default_daily_cap() -> i64 { 240 }
fn default_min_gap() -> i64 { 10 }
fn default_overflow_tolerance() -> f64 { 0.1 }
fn default_urgency_horizon() -> i64 { 168 }
fn default_urgency_epsilon() -> i64 { 30 }
fn default_near_deadline() -> i64 { 48 }
fn default_missed_boost() -> f64 { 0.25 }

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_chunk_minutes: default_max_chunk(),
            min_chunk_minutes: default_min_chunk(),
            daily_cap_minutes: default_daily_cap(),
            min_gap_minutes: default_min_gap(),
            overflow_tolerance: default_overflow_tolerance(),
            urgency_horizon_hours: default_urgency_horizon(),
            urgency_epsilon_minutes: default_urgency_epsilon(),
            near_deadline_hours: default_near_deadline(),
            missed_weight_boost: default_missed_boost(),
        }
    }
}

/// Reminder timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderConfig {
    /// How often the reminder loop ticks.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Lead time before a session starts.
    #[serde(default = "default_session_lead")]
    pub session_lead_minutes: i64,
    /// A break reminder is sent when the next session starts within this window.
    #[serde(default = "default_break_window")]
    pub break_window_minutes: i64,
    #[serde(default = "default_exam_warning")]
    pub exam_warning_hours: i64,
    #[serde(default = "bool_true")]
    pub daily_motivation: bool,
    /// UTC hour of the daily motivation message.
    #[serde(default = "default_motivation_hour")]
    pub daily_motivation_hour: u32,
    #[serde(default = "default_snooze")]
    pub default_snooze_minutes: i64,
}

fn bool_true() -> bool { true }
fn default_tick_secs() -> u64 { 60 }
fn default_session_lead() -> i64 { 10 }
fn default_break_window() -> i64 { 60 }
fn default_exam_warning() -> i64 { 24 }
fn default_motivation_hour() -> u32 { 8 }
fn default_snooze() -> i64 { 10 }

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            session_lead_minutes: default_session_lead(),
            break_window_minutes: default_break_window(),
            exam_warning_hours: default_exam_warning(),
            daily_motivation: true,
            daily_motivation_hour: default_motivation_hour(),
            default_snooze_minutes: default_snooze(),
        }
    }
}

/// Notification delivery targets. The log target is always active.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
}

/// Snapshot storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String { "~/.ally/ally.db".into() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}
