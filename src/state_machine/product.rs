use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::DispositionState;
use crate::hardware::{ActuatorResult, CommandKind};
use crate::inspection::InspectionVerdict;
use crate::labeling::LabelArtifact;

/// Why a product ended without a confirmed disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbortReason {
    /// Inspection retries exhausted.
    InspectionUnavailable,
    /// Conveyor homing exhausted, or accept retries exhausted.
    ActuatorUnavailable,
    /// The reject mechanism never confirmed. The product must not be
    /// treated as accepted.
    RejectUnconfirmed,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::InspectionUnavailable => write!(f, "INSPECTION_UNAVAILABLE"),
            AbortReason::ActuatorUnavailable => write!(f, "ACTUATOR_UNAVAILABLE"),
            AbortReason::RejectUnconfirmed => write!(f, "REJECT_UNCONFIRMED"),
        }
    }
}

/// Terminal outcome recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "disposition", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    Accepted,
    Rejected,
    Aborted(AbortReason),
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Accepted => write!(f, "ACCEPTED"),
            Disposition::Rejected => write!(f, "REJECTED"),
            Disposition::Aborted(reason) => write!(f, "ABORTED ({reason})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Reject,
}

impl Decision {
    pub fn command_kind(&self) -> CommandKind {
        match self {
            Decision::Accept => CommandKind::Accept,
            Decision::Reject => CommandKind::Reject,
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            Decision::Accept => Disposition::Accepted,
            Decision::Reject => Disposition::Rejected,
        }
    }

    pub fn actuation_state(&self) -> DispositionState {
        match self {
            Decision::Accept => DispositionState::Accepting,
            Decision::Reject => DispositionState::Rejecting,
        }
    }
}

/// The phases that can fail and be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Inspection,
    Labeling,
    Actuation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Inspection => write!(f, "inspection"),
            Phase::Labeling => write!(f, "labeling"),
            Phase::Actuation => write!(f, "actuation"),
        }
    }
}

/// One failed attempt at a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub phase: Phase,
    /// One-based attempt number within the phase.
    pub attempt: u32,
    pub error: String,
    /// Whether the failure was followed by a retry.
    pub retried: bool,
    pub at: DateTime<Utc>,
}

/// A product moving through the line. Owned by exactly one controller run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductInstance {
    pub product_id: String,
    pub batch_id: String,
    pub manufactured_at: DateTime<Utc>,
    pub state: DispositionState,
    pub state_history: Vec<DispositionState>,
    pub verdict: Option<InspectionVerdict>,
    pub decision: Option<Decision>,
    pub label: Option<LabelArtifact>,
    pub commands: Vec<ActuatorResult>,
    pub attempts: Vec<AttemptRecord>,
    pub warnings: Vec<String>,
}

impl ProductInstance {
    pub fn new(product_id: String, batch_id: String) -> Self {
        Self {
            product_id,
            batch_id,
            manufactured_at: Utc::now(),
            state: DispositionState::Capturing,
            state_history: Vec::new(),
            verdict: None,
            decision: None,
            label: None,
            commands: Vec::new(),
            attempts: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Retries performed across all phases.
    pub fn retry_count(&self) -> u32 {
        self.attempts.iter().filter(|a| a.retried).count() as u32
    }

    pub fn failures_in(&self, phase: Phase) -> u32 {
        self.attempts.iter().filter(|a| a.phase == phase).count() as u32
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// The durable record of one product. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub product_id: String,
    pub batch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,
    pub disposition: Disposition,
    pub verdict: Option<InspectionVerdict>,
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<LabelArtifact>,
    pub commands: Vec<ActuatorResult>,
    pub attempts: Vec<AttemptRecord>,
    pub state_transitions: Vec<DispositionState>,
    pub warnings: Vec<String>,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl LedgerEntry {
    /// Consumes a finished product into its ledger entry.
    pub fn from_product(product: ProductInstance, disposition: Disposition) -> Self {
        let now = Utc::now();
        let duration = now - product.manufactured_at;
        let retry_count = product.retry_count();
        let mut transitions = product.state_history;
        transitions.push(product.state);

        Self {
            product_type: product
                .verdict
                .as_ref()
                .and_then(|v| v.product_type.clone()),
            product_id: product.product_id,
            batch_id: product.batch_id,
            disposition,
            verdict: product.verdict,
            decision: product.decision,
            label: product.label,
            commands: product.commands,
            attempts: product.attempts,
            state_transitions: transitions,
            warnings: product.warnings,
            retry_count,
            started_at: product.manufactured_at,
            completed_at: now,
            duration_ms: duration.num_milliseconds(),
        }
    }
}
