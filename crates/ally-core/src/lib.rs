//! # Ally Core
//!
//! Domain model, time source, error taxonomy and configuration shared by
//! the Ally study planner crates.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AllyConfig, NotifyConfig, PlannerConfig, ReminderConfig, StorageConfig};
pub use error::{AllyError, Result};
pub use types::{
    AvailabilitySlot, Chunk, ReminderEvent, ReminderKey, ReminderKind, ReminderPayload,
    ReminderState, Session, SessionStatus, Topic, TopicStatus,
};
