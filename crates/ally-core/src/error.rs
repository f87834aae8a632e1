//! Error types for the Ally planner.
//!
//! Every planner command either succeeds or returns one of these kinds.
//! None of them is fatal to the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllyError {
    /// Unknown session, topic, slot or reminder reference.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation is not valid for the entity's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Time overlap with another session or slot, or outside availability.
    #[error("Conflicting slot: {0}")]
    ConflictingSlot(String),

    /// The change would orphan already-placed future sessions.
    #[error("Capacity violation: {0}")]
    CapacityViolation(String),

    /// Remaining effort exceeds remaining availability beyond tolerance.
    #[error("Infeasible: {required_minutes} min needed, {available_minutes} min available")]
    InfeasibleConstraints {
        required_minutes: i64,
        available_minutes: i64,
    },

    /// Malformed input (non-positive effort, inverted time window, ...).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AllyError {
    /// Short machine-readable name of the error kind, used in command responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::ConflictingSlot(_) => "conflicting_slot",
            Self::CapacityViolation(_) => "capacity_violation",
            Self::InfeasibleConstraints { .. } => "infeasible_constraints",
            Self::InvalidInput(_) => "invalid_input",
            Self::Config(_) => "config",
            Self::Storage(_) => "storage",
            Self::Notify(_) => "notify",
            Self::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, AllyError>;
