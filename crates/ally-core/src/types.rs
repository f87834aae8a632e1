//! Study plan data model: topics, chunks, availability, sessions and
//! reminder events.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AllyError, Result};

/// A subject area to study, e.g. "Operating Systems: scheduling".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    /// Unique topic ID.
    pub id: String,
    /// Subject name shown in reminders ("OS", "DBMS").
    pub subject: String,
    /// Optional finer-grained title within the subject.
    #[serde(default)]
    pub title: String,
    /// Total estimated effort in minutes.
    pub effort_minutes: i64,
    /// Effort not yet completed, in minutes.
    pub remaining_minutes: i64,
    /// Priority weight, higher = more urgent.
    pub weight: f64,
    /// Exam or hand-in date.
    pub deadline: Option<DateTime<Utc>>,
    /// Fixed chunk size in minutes, overriding the planner default.
    pub chunk_minutes: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// Creation order within a planner, assigned by the plan store.
    #[serde(default)]
    pub seq: u64,
    pub status: TopicStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TopicStatus {
    Active,
    Completed,
    Removed,
}

impl Topic {
    /// Create an active topic with the full effort remaining.
    pub fn new(subject: &str, effort_minutes: i64, weight: f64, created_at: DateTime<Utc>) -> Self {
        Self {
            id: new_id("topic"),
            subject: subject.to_string(),
            title: String::new(),
            effort_minutes,
            remaining_minutes: effort_minutes,
            weight,
            deadline: None,
            chunk_minutes: None,
            created_at,
            seq: 0,
            status: TopicStatus::Active,
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_chunk_minutes(mut self, minutes: i64) -> Self {
        self.chunk_minutes = Some(minutes);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == TopicStatus::Active
    }

    /// Check the topic invariants.
    pub fn validate(&self) -> Result<()> {
        if self.effort_minutes <= 0 {
            return Err(AllyError::InvalidInput(format!(
                "topic '{}' needs a positive effort, got {} min",
                self.subject, self.effort_minutes
            )));
        }
        if self.remaining_minutes < 0 || self.remaining_minutes > self.effort_minutes {
            return Err(AllyError::InvalidInput(format!(
                "topic '{}' has remaining effort {} outside 0..={}",
                self.subject, self.remaining_minutes, self.effort_minutes
            )));
        }
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(AllyError::InvalidInput(format!(
                "topic '{}' needs a positive weight",
                self.subject
            )));
        }
        if let Some(deadline) = self.deadline {
            if deadline < self.created_at {
                return Err(AllyError::InvalidInput(format!(
                    "topic '{}' deadline {} is before its creation time",
                    self.subject, deadline
                )));
            }
        }
        if let Some(chunk) = self.chunk_minutes {
            if chunk <= 0 {
                return Err(AllyError::InvalidInput(format!(
                    "topic '{}' chunk size must be positive",
                    self.subject
                )));
            }
        }
        Ok(())
    }
}

/// A schedulable slice of a topic's remaining effort.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub topic_id: String,
    pub index: u32,
    pub minutes: i64,
}

/// A window in which study sessions may be placed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvailabilitySlot {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AvailabilitySlot {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            id: new_id("slot"),
            start,
            end,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.start >= self.end {
            return Err(AllyError::InvalidInput(format!(
                "slot {} starts at {} but ends at {}",
                self.id, self.start, self.end
            )));
        }
        Ok(())
    }

    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    /// Whether `[start, end)` lies fully inside this slot.
    pub fn contains(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start <= start && end <= self.end
    }

    pub fn overlaps(&self, other: &AvailabilitySlot) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A scheduled study occurrence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub topic_id: String,
    /// Denormalized subject name for display and reminders.
    pub subject: String,
    pub chunk_index: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Planned,
    Completed,
    Missed,
    /// Planned, but moved by the user from its allocated time.
    Shifted,
}

impl Session {
    pub fn new(topic: &Topic, chunk: &Chunk, start: DateTime<Utc>) -> Self {
        Self {
            id: new_id("session"),
            topic_id: topic.id.clone(),
            subject: topic.subject.clone(),
            chunk_index: chunk.index,
            start,
            end: start + Duration::minutes(chunk.minutes),
            status: SessionStatus::Planned,
        }
    }

    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    /// Planned or Shifted, i.e. still expected to happen.
    pub fn is_pending(&self) -> bool {
        matches!(self.status, SessionStatus::Planned | SessionStatus::Shifted)
    }

    /// Whether the session holds its time range (missed sessions free it).
    pub fn occupies_time(&self) -> bool {
        self.status != SessionStatus::Missed
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && start < self.end
    }
}

/// Kind of reminder sent to the user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    SessionStart,
    BreakStart,
    ExamApproaching,
    DailyMotivation,
}

impl std::fmt::Display for ReminderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReminderKind::SessionStart => write!(f, "session_start"),
            ReminderKind::BreakStart => write!(f, "break_start"),
            ReminderKind::ExamApproaching => write!(f, "exam_approaching"),
            ReminderKind::DailyMotivation => write!(f, "daily_motivation"),
        }
    }
}

/// Identity of one logical reminder occurrence. Emitted at most once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReminderKey {
    SessionStart { session_id: String },
    BreakStart { session_id: String },
    ExamApproaching { topic_id: String },
    DailyMotivation { date: NaiveDate },
}

impl ReminderKey {
    pub fn kind(&self) -> ReminderKind {
        match self {
            ReminderKey::SessionStart { .. } => ReminderKind::SessionStart,
            ReminderKey::BreakStart { .. } => ReminderKind::BreakStart,
            ReminderKey::ExamApproaching { .. } => ReminderKind::ExamApproaching,
            ReminderKey::DailyMotivation { .. } => ReminderKind::DailyMotivation,
        }
    }
}

impl std::fmt::Display for ReminderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReminderKey::SessionStart { session_id } => write!(f, "session_start:{session_id}"),
            ReminderKey::BreakStart { session_id } => write!(f, "break_start:{session_id}"),
            ReminderKey::ExamApproaching { topic_id } => write!(f, "exam_approaching:{topic_id}"),
            ReminderKey::DailyMotivation { date } => write!(f, "daily_motivation:{date}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReminderState {
    Pending,
    Fired,
    Cancelled,
}

/// A timed reminder derived from the plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReminderEvent {
    pub id: String,
    pub key: ReminderKey,
    /// When the reminder should go out.
    pub trigger_at: DateTime<Utc>,
    /// The moment the reminder is about (session start, exam date, ...).
    pub scheduled_time: DateTime<Utc>,
    pub subject_name: String,
    pub session_id: Option<String>,
    pub topic_id: Option<String>,
    pub state: ReminderState,
}

impl ReminderEvent {
    pub fn kind(&self) -> ReminderKind {
        self.key.kind()
    }

    /// Outbound payload for the notification collaborator.
    pub fn payload(&self) -> ReminderPayload {
        ReminderPayload {
            kind: self.kind(),
            subject_name: self.subject_name.clone(),
            scheduled_time: self.scheduled_time,
            session_id: self.session_id.clone(),
        }
    }
}

/// What the notification collaborator receives when a reminder fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReminderPayload {
    pub kind: ReminderKind,
    pub subject_name: String,
    pub scheduled_time: DateTime<Utc>,
    pub session_id: Option<String>,
}

/// Generate a prefixed random identifier, e.g. `session-3f2a...`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}
