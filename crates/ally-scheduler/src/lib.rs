//! # Ally Scheduler
//!
//! Study plan allocation, incremental re-planning and reminders.
//!
//! ## Design Principles
//! - Allocator is a pure function: same inputs, same timetable
//! - One writer, many readers: plan store behind a versioned `RwLock`
//! - Re-plans run off-lock and are discarded if the plan moved underneath
//! - Reminders are a cache of the plan, each occurrence sent at most once
//! - SQLite persistence: survives restarts without re-sending reminders
//!
//! ## Architecture
//! ```text
//! Command ──► StudyPlanner
//!               ├── PlanStore (RwLock + version)
//!               │     └── mutation → dirty scope
//!               ├── Replanner: snapshot → allocate → swap if version unchanged
//!               └── ReminderScheduler (tokio interval)
//!                     ├── SessionStart / BreakStart
//!                     ├── ExamApproaching / DailyMotivation
//!                     └── on fire → NotifyRouter → Dispatch
//!                                      ├── Telegram (sendMessage)
//!                                      ├── Webhook (HTTP POST)
//!                                      └── Log
//! ```

pub mod allocator;
pub mod commands;
pub mod dispatch;
pub mod engine;
pub mod notify;
pub mod persistence;
pub mod reminders;
pub mod replan;
pub mod store;

pub use allocator::{Allocation, AllocationRequest, allocate};
pub use commands::{Command, CommandResponse, Outcome, SlotSpec, TopicSpec};
pub use engine::{StudyPlanner, spawn_reminder_loop};
pub use notify::{Notification, NotifyPriority, NotifyRouter};
pub use persistence::{PlanDb, ReminderOverrides};
pub use reminders::{ReminderScheduler, ReminderStats};
pub use replan::{DirtyScope, ReplanOutcome, ReplanReport, ReplanStats, Replanner};
pub use store::{CommitOutcome, PlanSnapshot, PlanStore};
