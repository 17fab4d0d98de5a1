use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::product::{AbortReason, AttemptRecord, Decision, Disposition, Phase, ProductInstance};
use crate::hardware::{ActuatorOutcome, ActuatorResult};
use crate::inspection::{InspectionError, InspectionVerdict};
use crate::labeling::LabelArtifact;

/// States of the inspection-to-disposition loop.
///
/// CAPTURING → CLASSIFIED → LABELING → ACCEPTING | REJECTING → LOGGED,
/// with ABORTED reachable from CAPTURING and the actuation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispositionState {
    Capturing,
    Classified,
    Labeling,
    Accepting,
    Rejecting,
    Logged,
    Aborted,
}

impl DispositionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DispositionState::Logged | DispositionState::Aborted)
    }
}

impl fmt::Display for DispositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispositionState::Capturing => write!(f, "CAPTURING"),
            DispositionState::Classified => write!(f, "CLASSIFIED"),
            DispositionState::Labeling => write!(f, "LABELING"),
            DispositionState::Accepting => write!(f, "ACCEPTING"),
            DispositionState::Rejecting => write!(f, "REJECTING"),
            DispositionState::Logged => write!(f, "LOGGED"),
            DispositionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// What happened when the controller ran the current state's step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Inspected(InspectionVerdict),
    /// `exhausted` is set when the retry policy has no attempts left.
    InspectionFailed { error: InspectionError, exhausted: bool },
    Decided(Decision),
    LabelIssued(LabelArtifact),
    LabelFailed(String),
    Actuated { result: ActuatorResult, exhausted: bool },
}

/// The result of evaluating a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Advance to the next state.
    Next(DispositionState),
    /// Stay in `state` and try again; `attempt` is the one that failed.
    Retry {
        state: DispositionState,
        attempt: u32,
        reason: String,
    },
    /// Give up on the product.
    Abort(AbortReason),
    /// The physical disposition is confirmed; the product goes to the ledger.
    Complete(Disposition),
    /// The outcome does not apply to the current state.
    Ignored,
}

/// Drives a [`ProductInstance`] through the disposition states.
pub struct StateMachine;

impl StateMachine {
    /// Compute and apply the next transition for the product given the
    /// outcome of its current step.
    ///
    /// - `Capturing`: a verdict advances; a failure retries until exhausted,
    ///   then aborts with `INSPECTION_UNAVAILABLE`.
    /// - `Classified`: the decision picks the path.
    /// - `Labeling`: success or failure both advance to the actuation state;
    ///   a failure becomes a warning.
    /// - `Accepting`/`Rejecting`: completion finishes the product. Transient
    ///   failures retry. Exhaustion aborts, and on the reject path the
    ///   reason is `REJECT_UNCONFIRMED`.
    /// - `Logged` and `Aborted` are terminal and ignore everything.
    pub fn next(product: &mut ProductInstance, outcome: StepOutcome) -> Transition {
        if product.state.is_terminal() {
            return Transition::Ignored;
        }
        let transition = match (product.state, outcome) {
            (DispositionState::Capturing, StepOutcome::Inspected(verdict)) => {
                product.verdict = Some(verdict);
                Transition::Next(DispositionState::Classified)
            }
            (DispositionState::Capturing, StepOutcome::InspectionFailed { error, exhausted }) => {
                Self::handle_failure(product, Phase::Inspection, error.to_string(), exhausted)
                    .unwrap_or(Transition::Abort(AbortReason::InspectionUnavailable))
            }
            (DispositionState::Classified, StepOutcome::Decided(decision)) => {
                product.decision = Some(decision);
                Transition::Next(DispositionState::Labeling)
            }
            (DispositionState::Labeling, StepOutcome::LabelIssued(artifact)) => {
                product.label = Some(artifact);
                Self::after_label(product)
            }
            (DispositionState::Labeling, StepOutcome::LabelFailed(reason)) => {
                let attempt = product.failures_in(Phase::Labeling) + 1;
                product.attempts.push(AttemptRecord {
                    phase: Phase::Labeling,
                    attempt,
                    error: reason.clone(),
                    retried: false,
                    at: Utc::now(),
                });
                product.warnings.push(format!("label not issued: {reason}"));
                Self::after_label(product)
            }
            (
                state @ (DispositionState::Accepting | DispositionState::Rejecting),
                StepOutcome::Actuated { result, exhausted },
            ) => {
                let outcome = result.outcome.clone();
                product.commands.push(result);
                let on_reject_path = state == DispositionState::Rejecting;
                let path = if on_reject_path {
                    Decision::Reject
                } else {
                    Decision::Accept
                };
                match outcome {
                    ActuatorOutcome::Completed => Transition::Complete(path.disposition()),
                    ActuatorOutcome::HomingExhausted => {
                        Self::record_final_failure(product, &outcome);
                        Transition::Abort(AbortReason::ActuatorUnavailable)
                    }
                    transient => Self::handle_failure(
                        product,
                        Phase::Actuation,
                        transient.to_string(),
                        exhausted,
                    )
                    .unwrap_or(Transition::Abort(if on_reject_path {
                        AbortReason::RejectUnconfirmed
                    } else {
                        AbortReason::ActuatorUnavailable
                    })),
                }
            }
            _ => Transition::Ignored,
        };

        // Apply the transition to the product.
        match &transition {
            Transition::Next(next_state) => {
                product.state_history.push(product.state);
                product.state = *next_state;
            }
            Transition::Retry { state, .. } => {
                // State stays the same; the attempt was recorded in
                // handle_failure.
                product.state_history.push(*state);
            }
            Transition::Complete(_) => {
                product.state_history.push(product.state);
                product.state = DispositionState::Logged;
            }
            Transition::Abort(_) => {
                product.state_history.push(product.state);
                product.state = DispositionState::Aborted;
            }
            Transition::Ignored => {}
        }

        transition
    }

    fn after_label(product: &ProductInstance) -> Transition {
        match product.decision {
            Some(decision) => Transition::Next(decision.actuation_state()),
            // Unreachable through `next`: Labeling is only entered after a decision.
            None => Transition::Next(DispositionState::Rejecting),
        }
    }

    /// Records the failed attempt; `None` means the policy is exhausted.
    fn handle_failure(
        product: &mut ProductInstance,
        phase: Phase,
        error: String,
        exhausted: bool,
    ) -> Option<Transition> {
        let attempt = product.failures_in(phase) + 1;
        product.attempts.push(AttemptRecord {
            phase,
            attempt,
            error: error.clone(),
            retried: !exhausted,
            at: Utc::now(),
        });
        (!exhausted).then(|| Transition::Retry {
            state: product.state,
            attempt,
            reason: error,
        })
    }

    fn record_final_failure(product: &mut ProductInstance, outcome: &ActuatorOutcome) {
        let attempt = product.failures_in(Phase::Actuation) + 1;
        product.attempts.push(AttemptRecord {
            phase: Phase::Actuation,
            attempt,
            error: outcome.to_string(),
            retried: false,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{ActuatorCommand, CommandKind};
    use std::time::Duration;

    fn product() -> ProductInstance {
        ProductInstance::new("DEV001-1".into(), "BATCH-DEV001-20260309".into())
    }

    fn actuated(kind: CommandKind, outcome: ActuatorOutcome, exhausted: bool) -> StepOutcome {
        let cmd = ActuatorCommand::for_product(kind, "DEV001-1", Duration::from_secs(1));
        StepOutcome::Actuated {
            result: ActuatorResult::new(&cmd, outcome),
            exhausted,
        }
    }

    fn walk_to(product: &mut ProductInstance, decision: Decision) {
        StateMachine::next(product, StepOutcome::Inspected(InspectionVerdict::scored(true, 0.9)));
        StateMachine::next(product, StepOutcome::Decided(decision));
        StateMachine::next(product, StepOutcome::LabelFailed("ribbon out".into()));
    }

    #[test]
    fn happy_path_walks_all_states() {
        let mut p = product();

        let t = StateMachine::next(&mut p, StepOutcome::Inspected(InspectionVerdict::scored(true, 0.95)));
        assert_eq!(t, Transition::Next(DispositionState::Classified));

        let t = StateMachine::next(&mut p, StepOutcome::Decided(Decision::Accept));
        assert_eq!(t, Transition::Next(DispositionState::Labeling));

        let cmd = ActuatorCommand::for_product(CommandKind::Accept, "DEV001-1", Duration::from_secs(1));
        let label = crate::labeling::LabelArtifact::new(
            "DEV001-1",
            "b",
            &crate::labeling::LabelFields {
                product_type: None,
                manufacturing_date: Utc::now().date_naive(),
                rohs_compliant: true,
                status: crate::labeling::LabelStatus::Passed,
            },
        );
        let t = StateMachine::next(&mut p, StepOutcome::LabelIssued(label));
        assert_eq!(t, Transition::Next(DispositionState::Accepting));

        let t = StateMachine::next(
            &mut p,
            StepOutcome::Actuated {
                result: ActuatorResult::new(&cmd, ActuatorOutcome::Completed),
                exhausted: false,
            },
        );
        assert_eq!(t, Transition::Complete(Disposition::Accepted));
        assert_eq!(p.state, DispositionState::Logged);
        assert_eq!(
            p.state_history,
            vec![
                DispositionState::Capturing,
                DispositionState::Classified,
                DispositionState::Labeling,
                DispositionState::Accepting,
            ]
        );

        // Logged is terminal.
        let t = StateMachine::next(&mut p, StepOutcome::Decided(Decision::Reject));
        assert_eq!(t, Transition::Ignored);
    }

    #[test]
    fn inspection_retries_then_aborts() {
        let mut p = product();

        let t = StateMachine::next(
            &mut p,
            StepOutcome::InspectionFailed {
                error: InspectionError::CaptureTimeout,
                exhausted: false,
            },
        );
        assert_eq!(
            t,
            Transition::Retry {
                state: DispositionState::Capturing,
                attempt: 1,
                reason: "capture timed out".into()
            }
        );
        assert_eq!(p.state, DispositionState::Capturing);

        let t = StateMachine::next(
            &mut p,
            StepOutcome::InspectionFailed {
                error: InspectionError::CaptureTimeout,
                exhausted: true,
            },
        );
        assert_eq!(t, Transition::Abort(AbortReason::InspectionUnavailable));
        assert_eq!(p.state, DispositionState::Aborted);
        assert_eq!(p.retry_count(), 1);
        assert_eq!(p.attempts.len(), 2);
    }

    #[test]
    fn label_failure_is_a_warning() {
        let mut p = product();
        walk_to(&mut p, Decision::Reject);
        assert_eq!(p.state, DispositionState::Rejecting);
        assert_eq!(p.warnings, vec!["label not issued: ribbon out"]);
        assert_eq!(p.retry_count(), 0);
    }

    #[test]
    fn reject_exhaustion_is_never_accepted() {
        let mut p = product();
        walk_to(&mut p, Decision::Reject);

        let t = StateMachine::next(
            &mut p,
            actuated(CommandKind::Reject, ActuatorOutcome::Fault("stuck".into()), false),
        );
        assert!(matches!(t, Transition::Retry { attempt: 1, .. }));

        let t = StateMachine::next(&mut p, actuated(CommandKind::Reject, ActuatorOutcome::Timeout, true));
        assert_eq!(t, Transition::Abort(AbortReason::RejectUnconfirmed));
        assert_eq!(p.state, DispositionState::Aborted);
        assert_eq!(p.commands.len(), 2);
    }

    #[test]
    fn accept_exhaustion_means_actuator_unavailable() {
        let mut p = product();
        walk_to(&mut p, Decision::Accept);

        let t = StateMachine::next(&mut p, actuated(CommandKind::Accept, ActuatorOutcome::NotHomed, true));
        assert_eq!(t, Transition::Abort(AbortReason::ActuatorUnavailable));
    }

    #[test]
    fn homing_exhausted_aborts_immediately() {
        let mut p = product();
        walk_to(&mut p, Decision::Reject);

        let t = StateMachine::next(
            &mut p,
            actuated(CommandKind::Reject, ActuatorOutcome::HomingExhausted, false),
        );
        assert_eq!(t, Transition::Abort(AbortReason::ActuatorUnavailable));
        assert_eq!(p.attempts.last().unwrap().phase, Phase::Actuation);
    }

    #[test]
    fn retries_are_recorded_in_history() {
        let mut p = product();
        StateMachine::next(
            &mut p,
            StepOutcome::InspectionFailed {
                error: InspectionError::InferenceFailure("blur".into()),
                exhausted: false,
            },
        );
        StateMachine::next(&mut p, StepOutcome::Inspected(InspectionVerdict::scored(false, 0.1)));
        assert_eq!(
            p.state_history,
            vec![DispositionState::Capturing, DispositionState::Capturing]
        );
        assert_eq!(p.state, DispositionState::Classified);
    }

    #[test]
    fn state_display() {
        assert_eq!(DispositionState::Capturing.to_string(), "CAPTURING");
        assert_eq!(DispositionState::Rejecting.to_string(), "REJECTING");
        assert_eq!(DispositionState::Logged.to_string(), "LOGGED");
        assert!(DispositionState::Aborted.is_terminal());
    }
}
