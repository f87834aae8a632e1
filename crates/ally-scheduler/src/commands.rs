//! Structured command surface. Commands arrive as JSON (`{"command": ...}`)
//! and are mapped onto planner operations.

use ally_core::error::Result;
use ally_core::types::{AvailabilitySlot, ReminderEvent, Session, Topic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::StudyPlanner;
use crate::replan::ReplanReport;

fn default_weight() -> f64 { 1.0 }

/// A topic as the user describes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicSpec {
    pub subject: String,
    #[serde(default)]
    pub title: String,
    pub effort_minutes: i64,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub chunk_minutes: Option<i64>,
}

impl TopicSpec {
    pub fn into_topic(self, now: DateTime<Utc>) -> Topic {
        let mut topic = Topic::new(&self.subject, self.effort_minutes, self.weight, now)
            .with_title(&self.title);
        topic.deadline = self.deadline;
        topic.chunk_minutes = self.chunk_minutes;
        topic
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotSpec {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SlotSpec {
    pub fn into_slot(self) -> AvailabilitySlot {
        AvailabilitySlot::new(self.start, self.end)
    }
}

/// What happened to a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Missed,
}

/// Inbound command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    CreatePlan {
        topics: Vec<TopicSpec>,
        #[serde(default)]
        horizon_days: Option<i64>,
    },
    RecordOutcome {
        session_id: String,
        outcome: Outcome,
    },
    SetAvailability {
        slots: Vec<SlotSpec>,
    },
    AddAvailability {
        slot: SlotSpec,
    },
    RemoveAvailability {
        slot_id: String,
    },
    ShiftSession {
        session_id: String,
        new_start: DateTime<Utc>,
    },
    RemoveTopic {
        topic_id: String,
    },
    QueryToday,
    CurrentPlan {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    TopicsAtRisk,
    ListReminders,
    SnoozeReminder {
        reminder_id: String,
        #[serde(default)]
        minutes: Option<i64>,
    },
    DismissReminder {
        reminder_id: String,
    },
}

/// Reply to a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum CommandResponse {
    PlanCreated {
        sessions: Vec<Session>,
        at_risk: Vec<Topic>,
    },
    OutcomeRecorded {
        session: Session,
        replan: ReplanReport,
    },
    AvailabilityUpdated {
        slots: Vec<AvailabilitySlot>,
        replan: ReplanReport,
    },
    SessionShifted {
        session: Session,
    },
    TopicRemoved {
        topic: Topic,
        replan: ReplanReport,
    },
    Sessions {
        sessions: Vec<Session>,
    },
    TopicsAtRisk {
        topics: Vec<Topic>,
    },
    Reminders {
        reminders: Vec<ReminderEvent>,
    },
    Reminder {
        reminder: ReminderEvent,
    },
}

impl StudyPlanner {
    /// Execute one command.
    pub async fn handle(&self, command: Command) -> Result<CommandResponse> {
        match command {
            Command::CreatePlan { topics, horizon_days } => {
                let now = self.now();
                let topics = topics.into_iter().map(|t| t.into_topic(now)).collect();
                let sessions = self.create_plan(topics, horizon_days).await?;
                Ok(CommandResponse::PlanCreated {
                    sessions,
                    at_risk: self.topics_at_risk().await,
                })
            }
            Command::RecordOutcome { session_id, outcome } => {
                let (session, replan) = self.record_outcome(&session_id, outcome).await?;
                Ok(CommandResponse::OutcomeRecorded { session, replan })
            }
            Command::SetAvailability { slots } => {
                let replan = self
                    .set_availability(slots.into_iter().map(SlotSpec::into_slot).collect())
                    .await?;
                Ok(self.availability_updated(replan).await)
            }
            Command::AddAvailability { slot } => {
                let (_, replan) = self.add_availability(slot.into_slot()).await?;
                Ok(self.availability_updated(replan).await)
            }
            Command::RemoveAvailability { slot_id } => {
                let replan = self.remove_availability(&slot_id).await?;
                Ok(self.availability_updated(replan).await)
            }
            Command::ShiftSession { session_id, new_start } => {
                let session = self.shift_session(&session_id, new_start).await?;
                Ok(CommandResponse::SessionShifted { session })
            }
            Command::RemoveTopic { topic_id } => {
                let (topic, replan) = self.remove_topic(&topic_id).await?;
                Ok(CommandResponse::TopicRemoved { topic, replan })
            }
            Command::QueryToday => Ok(CommandResponse::Sessions {
                sessions: self.query_today().await,
            }),
            Command::CurrentPlan { from, to } => Ok(CommandResponse::Sessions {
                sessions: self.current_plan(from, to).await?,
            }),
            Command::TopicsAtRisk => Ok(CommandResponse::TopicsAtRisk {
                topics: self.topics_at_risk().await,
            }),
            Command::ListReminders => Ok(CommandResponse::Reminders {
                reminders: self.reminders().await,
            }),
            Command::SnoozeReminder { reminder_id, minutes } => Ok(CommandResponse::Reminder {
                reminder: self.snooze_reminder(&reminder_id, minutes).await?,
            }),
            Command::DismissReminder { reminder_id } => Ok(CommandResponse::Reminder {
                reminder: self.dismiss_reminder(&reminder_id).await?,
            }),
        }
    }

    async fn availability_updated(&self, replan: ReplanReport) -> CommandResponse {
        CommandResponse::AvailabilityUpdated {
            slots: self.snapshot().await.slots,
            replan,
        }
    }
}
