use thiserror::Error;

use crate::hardware::{ActuatorOutcome, NetworkDriverError};
use crate::ledger::LedgerError;
use crate::state_machine::AbortReason;

#[derive(Debug, Error)]
pub enum TracelineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("No ledger entries found. Run `traceline run` first.")]
    EmptyLedger,

    #[error("Product not found: {0}")]
    ProductNotFound(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Hardware error: {0}")]
    Hardware(#[from] NetworkDriverError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Classifies a failure for retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorClass {
    /// Timeouts, device faults, lost position. Retried.
    Transient,
    /// A retry budget ran out.
    Exhausted,
    /// The physical state of a product cannot be confirmed.
    Safety,
    /// A write would contradict the ledger.
    Integrity,
}

impl ErrorClass {
    pub fn of_outcome(outcome: &ActuatorOutcome) -> Option<Self> {
        match outcome {
            ActuatorOutcome::Completed => None,
            ActuatorOutcome::HomingExhausted => Some(ErrorClass::Exhausted),
            _ => Some(ErrorClass::Transient),
        }
    }

    pub fn of_abort(reason: AbortReason) -> Self {
        match reason {
            AbortReason::RejectUnconfirmed => ErrorClass::Safety,
            AbortReason::InspectionUnavailable | AbortReason::ActuatorUnavailable => {
                ErrorClass::Exhausted
            }
        }
    }

    pub fn of_ledger(error: &LedgerError) -> Self {
        match error {
            LedgerError::Duplicate(_) | LedgerError::Corrupt { .. } => ErrorClass::Integrity,
            LedgerError::Io(_) | LedgerError::Json(_) => ErrorClass::Transient,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "Transient"),
            ErrorClass::Exhausted => write!(f, "Exhausted"),
            ErrorClass::Safety => write!(f, "Safety"),
            ErrorClass::Integrity => write!(f, "Integrity"),
        }
    }
}
