//! Runs one product from capture to its ledger entry.
//!
//! The controller owns the retry loops. [`StateMachine::next`] decides what a
//! step outcome means; the controller performs the step, sleeps out the
//! backoff between attempts, and commits the entry once the product reaches
//! a terminal state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{sleep, timeout};
use tracing::Instrument;

use crate::config::TracelineConfig;
use crate::error::{ErrorClass, TracelineError};
use crate::hardware::{ActuatorCommand, ActuatorGateway, HardwareDriver};
use crate::inspection::{InspectionSource, InspectionVerdict, VisionProvider, catalog};
use crate::labeling::{LabelError, LabelFields, LabelIssuer, LabelStatus};
use crate::ledger::Ledger;
use crate::retry::{Backoff, OperationClass, RetryPolicy};
use crate::state_machine::{
    AbortReason, Decision, Disposition, DispositionState, LedgerEntry, ProductInstance,
    StateMachine, StepOutcome, Transition,
};

/// Accept only a passing verdict whose confidence reaches the threshold.
/// The boundary is inclusive.
pub fn decide(verdict: &InspectionVerdict, threshold: f64) -> Decision {
    if verdict.passed && verdict.confidence >= threshold {
        Decision::Accept
    } else {
        Decision::Reject
    }
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub threshold: f64,
    pub inspection: RetryPolicy,
    pub actuation: RetryPolicy,
    pub actuation_deadline: Duration,
    pub label_deadline: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &TracelineConfig) -> Self {
        Self {
            threshold: config.line.decision_threshold,
            inspection: config.retry.policy(OperationClass::Inspection).clone(),
            actuation: config.retry.policy(OperationClass::Actuation).clone(),
            actuation_deadline: config.deadlines.actuation(),
            label_deadline: config.deadlines.label(),
        }
    }
}

pub struct DispositionController<V, D, L> {
    inspection: InspectionSource<V>,
    gateway: ActuatorGateway<D>,
    printer: Arc<L>,
    ledger: Arc<dyn Ledger>,
    settings: ControllerSettings,
}

impl<V, D, L> DispositionController<V, D, L>
where
    V: VisionProvider,
    D: HardwareDriver,
    L: LabelIssuer,
{
    pub fn new(
        inspection: InspectionSource<V>,
        gateway: ActuatorGateway<D>,
        printer: Arc<L>,
        ledger: Arc<dyn Ledger>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            inspection,
            gateway,
            printer,
            ledger,
            settings,
        }
    }

    /// Drives the product to a terminal state and commits its ledger entry.
    /// The product is consumed; the committed entry is returned.
    pub async fn process(&self, product: ProductInstance) -> Result<LedgerEntry, TracelineError> {
        let span = tracing::info_span!(
            "product",
            product_id = %product.product_id,
            batch_id = %product.batch_id
        );
        async move {
            let mut product = product;
            let disposition = self.drive(&mut product).await;
            self.commit(LedgerEntry::from_product(product, disposition)).await
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, product: &mut ProductInstance) -> Disposition {
        let mut inspection_backoff = self.settings.inspection.backoff();
        let mut actuation_backoff: Option<Backoff> = None;
        let mut command: Option<ActuatorCommand> = None;

        loop {
            let mut delay = None;
            let outcome = match product.state {
                DispositionState::Capturing => {
                    match self.inspection.inspect(&product.product_id).await {
                        Ok(verdict) => StepOutcome::Inspected(verdict),
                        Err(error) => {
                            delay = inspection_backoff.next_delay();
                            StepOutcome::InspectionFailed {
                                error,
                                exhausted: delay.is_none(),
                            }
                        }
                    }
                }
                DispositionState::Classified => {
                    // A missing verdict cannot justify an accept.
                    let decision = product
                        .verdict
                        .as_ref()
                        .map_or(Decision::Reject, |v| decide(v, self.settings.threshold));
                    StepOutcome::Decided(decision)
                }
                DispositionState::Labeling => self.label(product).await,
                state @ (DispositionState::Accepting | DispositionState::Rejecting) => {
                    // The state, not the stored decision, picks the motion.
                    let path = if state == DispositionState::Accepting {
                        Decision::Accept
                    } else {
                        Decision::Reject
                    };
                    // Retries reuse the same command so the gateway can dedup them.
                    let cmd = command
                        .get_or_insert_with(|| {
                            ActuatorCommand::for_product(
                                path.command_kind(),
                                &product.product_id,
                                self.settings.actuation_deadline,
                            )
                        })
                        .clone();
                    let result = self.gateway.execute(cmd).await;
                    if let Some(class) = ErrorClass::of_outcome(&result.outcome) {
                        tracing::debug!(outcome = %result.outcome, class = %class, "actuation failed");
                    }
                    let exhausted = if result.outcome.is_transient() {
                        delay = actuation_backoff
                            .get_or_insert_with(|| self.settings.actuation.backoff())
                            .next_delay();
                        delay.is_none()
                    } else {
                        false
                    };
                    StepOutcome::Actuated { result, exhausted }
                }
                DispositionState::Logged | DispositionState::Aborted => {
                    return stalled(product);
                }
            };

            let from = product.state;
            match StateMachine::next(product, outcome) {
                Transition::Next(to) => {
                    tracing::debug!(from = %from, to = %to, "transition");
                    if to == DispositionState::Labeling
                        && let Some(decision) = product.decision
                    {
                        tracing::info!(decision = ?decision, "classified");
                    }
                }
                Transition::Retry {
                    state,
                    attempt,
                    reason,
                } => {
                    let delay = delay.unwrap_or_default();
                    tracing::warn!(
                        state = %state,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "retrying"
                    );
                    sleep(delay).await;
                }
                Transition::Abort(reason) => {
                    tracing::error!(
                        state = %from,
                        reason = %reason,
                        class = %ErrorClass::of_abort(reason),
                        attempts = product.attempts.len(),
                        "product aborted"
                    );
                    return Disposition::Aborted(reason);
                }
                Transition::Complete(disposition) => {
                    tracing::info!(
                        disposition = %disposition,
                        retries = product.retry_count(),
                        "disposition confirmed"
                    );
                    return disposition;
                }
                Transition::Ignored => return stalled(product),
            }
        }
    }

    async fn label(&self, product: &ProductInstance) -> StepOutcome {
        let fields = label_fields(product);
        let deadline = self.settings.label_deadline;
        let issued = timeout(
            deadline,
            self.printer
                .issue_label(&product.product_id, &product.batch_id, &fields),
        )
        .await
        .unwrap_or(Err(LabelError::Timeout(deadline.as_millis() as u64)));

        match issued {
            Ok(artifact) => {
                tracing::debug!(label_id = %artifact.label_id, "label issued");
                StepOutcome::LabelIssued(artifact)
            }
            Err(e) => {
                tracing::warn!(error = %e, "label not issued, continuing without it");
                StepOutcome::LabelFailed(e.to_string())
            }
        }
    }

    /// File ledgers fsync on append, so the write runs on the blocking pool.
    async fn commit(&self, entry: LedgerEntry) -> Result<LedgerEntry, TracelineError> {
        let ledger = Arc::clone(&self.ledger);
        let record = entry.clone();
        match tokio::task::spawn_blocking(move || ledger.append(record)).await? {
            Ok(committed) => {
                tracing::info!(
                    disposition = %entry.disposition,
                    sequence = committed.sequence,
                    duration_ms = entry.duration_ms,
                    "ledger entry committed"
                );
                Ok(entry)
            }
            Err(e) => {
                tracing::error!(error = %e, class = %ErrorClass::of_ledger(&e), "ledger commit refused");
                Err(e.into())
            }
        }
    }
}

/// Label contents follow the decision, not the final disposition: the label
/// is printed before the actuator moves.
fn label_fields(product: &ProductInstance) -> LabelFields {
    let verdict = product.verdict.as_ref();
    let product_type = verdict
        .and_then(|v| v.product_type.clone())
        .or_else(|| catalog::product_type_of(&product.product_id).map(|s| s.code.to_string()));
    let status = match product.decision {
        Some(Decision::Accept) => LabelStatus::Passed,
        _ => LabelStatus::Rejected,
    };
    LabelFields {
        product_type,
        manufacturing_date: product.manufactured_at.date_naive(),
        rohs_compliant: verdict.is_some_and(|v| v.rohs_compliant),
        status,
    }
}

/// The loop reached a state with no step to run. Never resolve that as an
/// accept.
fn stalled(product: &mut ProductInstance) -> Disposition {
    tracing::error!(
        state = %product.state,
        terminal = product.is_terminal(),
        "disposition loop stalled"
    );
    product
        .warnings
        .push(format!("loop stalled in {} at {}", product.state, Utc::now().to_rfc3339()));
    Disposition::Aborted(AbortReason::RejectUnconfirmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{ActuatorOutcome, CommandKind, Device, SimStep, SimulatedDriver};
    use crate::homing::HomingSupervisor;
    use crate::inspection::{InspectionError, SimulatedVision, VisionStep};
    use crate::labeling::SimulatedPrinter;
    use crate::ledger::{JsonlLedger, LedgerError, MemoryLedger};
    use crate::state_machine::Phase;

    struct Rig {
        vision: Arc<SimulatedVision>,
        driver: Arc<SimulatedDriver>,
        printer: Arc<SimulatedPrinter>,
        ledger: Arc<dyn Ledger>,
        controller: Arc<DispositionController<SimulatedVision, SimulatedDriver, SimulatedPrinter>>,
    }

    fn policy(max_attempts: u32, base_delay_ms: u64, multiplier: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms,
            backoff_multiplier: multiplier,
            jitter_fraction: 0.0,
            max_delay_ms: 10_000,
            max_elapsed_ms: 0,
        }
    }

    fn rig() -> Rig {
        rig_on(Arc::new(MemoryLedger::new()))
    }

    fn rig_on(ledger: Arc<dyn Ledger>) -> Rig {
        let vision = Arc::new(SimulatedVision::new(Duration::from_millis(20), 0.0, 0.0));
        let driver = Arc::new(SimulatedDriver::new(Duration::from_millis(10), 0.0));
        let printer = Arc::new(SimulatedPrinter::new(Duration::ZERO, 0.0));

        let homing = Arc::new(HomingSupervisor::new(
            Arc::clone(&driver),
            policy(2, 100, 2.0),
            Duration::from_secs(1),
            None,
        ));
        tokio::spawn(Arc::clone(&homing).run());
        let gateway = ActuatorGateway::new(Arc::clone(&driver), homing, Duration::from_secs(30));

        let settings = ControllerSettings {
            threshold: 0.7,
            inspection: policy(3, 1000, 1.5),
            actuation: policy(3, 1000, 1.5),
            actuation_deadline: Duration::from_secs(1),
            label_deadline: Duration::from_millis(500),
        };
        let controller = Arc::new(DispositionController::new(
            InspectionSource::new(Arc::clone(&vision), Duration::from_secs(2)),
            gateway,
            Arc::clone(&printer),
            Arc::clone(&ledger),
            settings,
        ));
        Rig {
            vision,
            driver,
            printer,
            ledger,
            controller,
        }
    }

    fn product(id: &str) -> ProductInstance {
        ProductInstance::new(id.into(), "BATCH-DEV001-20260309".into())
    }

    #[test]
    fn threshold_is_inclusive() {
        let at = InspectionVerdict::scored(true, 0.7);
        assert_eq!(decide(&at, 0.7), Decision::Accept);

        let below = InspectionVerdict::scored(true, 0.7 - f64::EPSILON);
        assert_eq!(decide(&below, 0.7), Decision::Reject);

        // A failed verdict is rejected whatever its confidence.
        let failed = InspectionVerdict::scored(false, 0.99);
        assert_eq!(decide(&failed, 0.7), Decision::Reject);
    }

    #[tokio::test(start_paused = true)]
    async fn passing_product_is_accepted_and_labelled() {
        let rig = rig();
        rig.vision
            .script([VisionStep::verdict(InspectionVerdict::scored(true, 0.7))]);

        let entry = rig.controller.process(product("DEV001-1")).await.unwrap();
        assert_eq!(entry.disposition, Disposition::Accepted);
        assert_eq!(entry.decision, Some(Decision::Accept));
        assert_eq!(entry.commands.len(), 1);
        assert_eq!(entry.commands[0].kind, CommandKind::Accept);
        assert_eq!(
            entry.state_transitions,
            vec![
                DispositionState::Capturing,
                DispositionState::Classified,
                DispositionState::Labeling,
                DispositionState::Accepting,
                DispositionState::Logged,
            ]
        );

        let label = entry.label.as_ref().unwrap();
        assert_eq!(label.fields.status, LabelStatus::Passed);
        assert_eq!(label.fields.product_type.as_deref(), Some("DEV001"));
        assert_eq!(rig.printer.issued().len(), 1);
        assert_eq!(rig.ledger.get("DEV001-1").unwrap(), entry);
    }

    #[tokio::test(start_paused = true)]
    async fn below_threshold_is_rejected() {
        let rig = rig();
        rig.vision.script([VisionStep::verdict(InspectionVerdict::scored(
            true,
            0.7 - f64::EPSILON,
        ))]);

        let entry = rig.controller.process(product("DEV001-2")).await.unwrap();
        assert_eq!(entry.disposition, Disposition::Rejected);
        assert_eq!(entry.commands[0].kind, CommandKind::Reject);
        assert_eq!(rig.driver.completed(CommandKind::Reject), 1);
        assert_eq!(rig.driver.completed(CommandKind::Accept), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_products_each_get_one_entry() {
        let rig = rig();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let controller = Arc::clone(&rig.controller);
                tokio::spawn(async move { controller.process(product(&format!("DEV002-{i}"))).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(rig.ledger.len(), 8);
        for i in 0..8 {
            assert!(rig.ledger.get(&format!("DEV002-{i}")).is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn file_ledger_commits_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("line.jsonl");
        let rig = rig_on(Arc::new(JsonlLedger::open(&path).unwrap()));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let controller = Arc::clone(&rig.controller);
                tokio::spawn(async move { controller.process(product(&format!("DEV001-{i}"))).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(rig.ledger.len(), 4);
        let reopened = JsonlLedger::open(&path).unwrap();
        assert_eq!(reopened.len(), 4);
        assert!(reopened.get("DEV001-3").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn inspection_exhaustion_aborts() {
        let rig = rig();
        rig.vision
            .script((0..4).map(|_| VisionStep::fail(InspectionError::CaptureTimeout)));

        let started = tokio::time::Instant::now();
        let entry = rig.controller.process(product("DEV003-1")).await.unwrap();
        assert_eq!(
            entry.disposition,
            Disposition::Aborted(AbortReason::InspectionUnavailable)
        );
        assert_eq!(entry.retry_count, 3);
        assert_eq!(entry.attempts.len(), 4);
        assert!(entry.commands.is_empty());
        assert_eq!(rig.vision.calls(), 4);
        // 1000 + 1500 + 2250 ms of backoff between the four captures.
        assert_eq!(started.elapsed(), Duration::from_millis(4750));
    }

    #[tokio::test(start_paused = true)]
    async fn inspection_recovers_after_retry() {
        let rig = rig();
        rig.vision.script([
            VisionStep::fail(InspectionError::InferenceFailure("blur".into())),
            VisionStep::verdict(InspectionVerdict::scored(true, 0.95)),
        ]);

        let entry = rig.controller.process(product("DEV001-3")).await.unwrap();
        assert_eq!(entry.disposition, Disposition::Accepted);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.attempts[0].phase, Phase::Inspection);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_reject_is_never_accepted() {
        let rig = rig();
        rig.vision
            .script([VisionStep::verdict(InspectionVerdict::scored(false, 0.2))]);
        rig.driver.script(
            Device::RejectMechanism,
            (0..4).map(|_| SimStep::fault("solenoid stuck")),
        );

        let entry = rig.controller.process(product("DEV002-9")).await.unwrap();
        assert_eq!(
            entry.disposition,
            Disposition::Aborted(AbortReason::RejectUnconfirmed)
        );
        assert_eq!(entry.commands.len(), 4);
        assert!(entry
            .commands
            .iter()
            .all(|c| c.kind == CommandKind::Reject && !c.outcome.is_completed()));
        assert_eq!(rig.driver.completed(CommandKind::Accept), 0);
        // All four tries reused one command id.
        assert!(entry.commands.windows(2).all(|w| w[0].command_id == w[1].command_id));
    }

    #[tokio::test(start_paused = true)]
    async fn actuation_retry_recovers() {
        let rig = rig();
        rig.vision
            .script([VisionStep::verdict(InspectionVerdict::scored(false, 0.1))]);
        rig.driver
            .script(Device::RejectMechanism, [SimStep::fault("solenoid stuck")]);

        let entry = rig.controller.process(product("DEV002-4")).await.unwrap();
        assert_eq!(entry.disposition, Disposition::Rejected);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.commands.len(), 2);
        assert_eq!(
            entry.commands[0].outcome,
            ActuatorOutcome::Fault("solenoid stuck".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn homing_exhaustion_aborts_as_actuator_unavailable() {
        let rig = rig();
        rig.driver.script(
            Device::Conveyor,
            (0..3).map(|_| SimStep::fault("limit switch")),
        );

        let entry = rig.controller.process(product("DEV001-5")).await.unwrap();
        assert_eq!(
            entry.disposition,
            Disposition::Aborted(AbortReason::ActuatorUnavailable)
        );
        assert_eq!(entry.commands.len(), 1);
        assert_eq!(entry.commands[0].outcome, ActuatorOutcome::HomingExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn label_failure_is_recorded_but_not_fatal() {
        let rig = rig();
        rig.vision
            .script([VisionStep::verdict(InspectionVerdict::scored(false, 0.3))]);
        rig.printer.fail_next("ribbon out");

        let entry = rig.controller.process(product("DEV003-2")).await.unwrap();
        assert_eq!(entry.disposition, Disposition::Rejected);
        assert!(entry.label.is_none());
        assert_eq!(entry.warnings, vec!["label not issued: printer error: ribbon out"]);
        assert_eq!(entry.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_product_is_refused() {
        let rig = rig();
        let first = rig.controller.process(product("DEV001-7")).await.unwrap();

        let err = rig.controller.process(product("DEV001-7")).await.unwrap_err();
        assert!(matches!(
            err,
            TracelineError::Ledger(LedgerError::Duplicate(ref id)) if id == "DEV001-7"
        ));
        assert_eq!(rig.ledger.len(), 1);
        assert_eq!(rig.ledger.get("DEV001-7").unwrap(), first);
    }

    #[test]
    fn label_fields_follow_decision() {
        let mut p = product("DEV003-4");
        p.verdict = Some(InspectionVerdict::scored(true, 0.9));
        p.decision = Some(Decision::Reject);
        let fields = label_fields(&p);
        assert_eq!(fields.status, LabelStatus::Rejected);
        // Falls back to the type encoded in the id.
        assert_eq!(fields.product_type.as_deref(), Some("DEV003"));
        assert!(fields.rohs_compliant);
    }
}
