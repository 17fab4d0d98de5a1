//! Uniform command/result interface over every actuator.
//!
//! The gateway owns one FIFO lane per [`Device`]. A command holds its lane for
//! the whole physical operation, including past the caller's deadline, so two
//! motions on the same device never overlap. Motions on different devices are
//! further serialized by the belt lock in [`HomingSupervisor`]. Commands are deduplicated by
//! [`CommandId`]: a completed id is served from cache within the dedup
//! window, and an id still in flight is joined rather than re-sent.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, timeout};

use super::{ActuatorCommand, ActuatorOutcome, ActuatorResult, CommandId, Device, HardwareDriver};
use crate::homing::HomingSupervisor;

type ResultTx = watch::Sender<Option<ActuatorResult>>;
type ResultRx = watch::Receiver<Option<ActuatorResult>>;

enum Slot {
    /// Dispatched and not finished. `lingering` means the original caller
    /// already got a `Timeout` and the device call is still running.
    InFlight { rx: ResultRx, lingering: bool },
    Done { result: ActuatorResult, at: Instant },
}

enum Claim {
    Cached(ActuatorResult),
    Join { rx: ResultRx, lingering: bool },
    Dispatch(ResultTx, ResultRx),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub dispatched: u64,
    pub dedup_hits: u64,
    pub stale_results: u64,
}

struct GatewayInner<D> {
    driver: Arc<D>,
    homing: Arc<HomingSupervisor<D>>,
    lanes: HashMap<Device, Arc<tokio::sync::Mutex<()>>>,
    registry: Mutex<HashMap<CommandId, Slot>>,
    dedup_window: Duration,
    dispatched: AtomicU64,
    dedup_hits: AtomicU64,
    stale_results: AtomicU64,
}

pub struct ActuatorGateway<D> {
    inner: Arc<GatewayInner<D>>,
}

impl<D> Clone for ActuatorGateway<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: HardwareDriver> ActuatorGateway<D> {
    pub fn new(driver: Arc<D>, homing: Arc<HomingSupervisor<D>>, dedup_window: Duration) -> Self {
        let lanes = Device::ALL
            .into_iter()
            .map(|device| (device, Arc::new(tokio::sync::Mutex::new(()))))
            .collect();
        Self {
            inner: Arc::new(GatewayInner {
                driver,
                homing,
                lanes,
                registry: Mutex::new(HashMap::new()),
                dedup_window,
                dispatched: AtomicU64::new(0),
                dedup_hits: AtomicU64::new(0),
                stale_results: AtomicU64::new(0),
            }),
        }
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            dispatched: self.inner.dispatched.load(Ordering::Relaxed),
            dedup_hits: self.inner.dedup_hits.load(Ordering::Relaxed),
            stale_results: self.inner.stale_results.load(Ordering::Relaxed),
        }
    }

    /// Executes a command and always returns a result for it.
    ///
    /// The device call is bounded by the command's deadline. Waiting for the
    /// lane or for the conveyor to be homed is not.
    pub async fn execute(&self, command: ActuatorCommand) -> ActuatorResult {
        match self.inner.claim(&command) {
            Claim::Cached(result) => {
                self.inner.dedup_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(command_id = %command.id, "dedup hit, returning cached result");
                result
            }
            Claim::Join { rx, lingering } => {
                self.inner.dedup_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(command_id = %command.id, lingering, "joining in-flight command");
                if lingering {
                    timeout(command.deadline(), await_result(rx, &command))
                        .await
                        .unwrap_or_else(|_| ActuatorResult::new(&command, ActuatorOutcome::Timeout))
                } else {
                    await_result(rx, &command).await
                }
            }
            Claim::Dispatch(tx, rx) => {
                self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(Arc::clone(&self.inner).dispatch(command.clone(), tx));
                await_result(rx, &command).await
            }
        }
    }
}

impl<D: HardwareDriver> GatewayInner<D> {
    fn registry(&self) -> MutexGuard<'_, HashMap<CommandId, Slot>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, command: &ActuatorCommand) -> Claim {
        let mut registry = self.registry();
        let now = Instant::now();
        let window = self.dedup_window;
        registry.retain(|_, slot| match slot {
            Slot::Done { at, .. } => now.duration_since(*at) <= window,
            Slot::InFlight { .. } => true,
        });

        match registry.get(&command.id) {
            Some(Slot::Done { result, .. }) => Claim::Cached(result.clone()),
            Some(Slot::InFlight { rx, lingering }) => Claim::Join {
                rx: rx.clone(),
                lingering: *lingering,
            },
            None => {
                let (tx, rx) = watch::channel(None);
                registry.insert(
                    command.id,
                    Slot::InFlight {
                        rx: rx.clone(),
                        lingering: false,
                    },
                );
                Claim::Dispatch(tx, rx)
            }
        }
    }

    async fn dispatch(self: Arc<Self>, command: ActuatorCommand, tx: ResultTx) {
        let lane = Arc::clone(&self.lanes[&command.device]);
        let _lane = lane.lock_owned().await;

        let _motion = if command.kind.is_motion() {
            match self.homing.acquire_motion().await {
                Ok(guard) => Some(guard),
                Err(_) => {
                    self.finish(&command, ActuatorOutcome::HomingExhausted, &tx);
                    return;
                }
            }
        } else {
            None
        };

        let deadline = command.deadline();
        let mut call = pin!(self.driver.send(&command, deadline));
        let outcome = match timeout(deadline, &mut call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    device = %command.device,
                    command_id = %command.id,
                    deadline_ms = command.deadline_ms,
                    "actuator deadline elapsed, device still running"
                );
                let late_tx = self.linger(&command);
                tx.send_replace(Some(ActuatorResult::new(&command, ActuatorOutcome::Timeout)));

                let late = call.await;
                self.stale_results.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    device = %command.device,
                    command_id = %command.id,
                    outcome = %late,
                    "stale late result, not delivered to the original caller"
                );
                self.finish(&command, late, &late_tx);
                return;
            }
        };

        self.finish(&command, outcome, &tx);
    }

    /// Swaps the slot for a fresh channel that only retries of the same id
    /// listen to.
    fn linger(&self, command: &ActuatorCommand) -> ResultTx {
        let (late_tx, late_rx) = watch::channel(None);
        self.registry().insert(
            command.id,
            Slot::InFlight {
                rx: late_rx,
                lingering: true,
            },
        );
        late_tx
    }

    fn finish(&self, command: &ActuatorCommand, outcome: ActuatorOutcome, tx: &ResultTx) {
        match &outcome {
            ActuatorOutcome::NotHomed => self.homing.report_fault(command.device, "not homed"),
            ActuatorOutcome::Fault(reason) if command.device == Device::Conveyor => {
                self.homing.report_fault(command.device, reason)
            }
            _ => {}
        }

        let result = ActuatorResult::new(command, outcome);
        {
            let mut registry = self.registry();
            if result.outcome.is_completed() {
                registry.insert(
                    command.id,
                    Slot::Done {
                        result: result.clone(),
                        at: Instant::now(),
                    },
                );
            } else {
                registry.remove(&command.id);
            }
        }
        tx.send_replace(Some(result));
    }
}

async fn await_result(mut rx: ResultRx, command: &ActuatorCommand) -> ActuatorResult {
    match rx.wait_for(Option::is_some).await.ok().and_then(|r| (*r).clone()) {
        Some(result) => result,
        None => ActuatorResult::new(command, ActuatorOutcome::Fault("dispatch aborted".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{CommandKind, SignalEdge, SignalEvent, SimStep, SimulatedDriver};
    use crate::homing::HomingExhausted;
    use crate::retry::RetryPolicy;

    struct Rig {
        driver: Arc<SimulatedDriver>,
        homing: Arc<HomingSupervisor<SimulatedDriver>>,
        gateway: ActuatorGateway<SimulatedDriver>,
    }

    fn rig(latency_ms: u64, homing_attempts: u32) -> Rig {
        let driver = Arc::new(SimulatedDriver::new(Duration::from_millis(latency_ms), 0.0));
        let policy = RetryPolicy {
            max_attempts: homing_attempts,
            base_delay_ms: 100,
            backoff_multiplier: 1.5,
            jitter_fraction: 0.0,
            max_delay_ms: 1000,
            max_elapsed_ms: 0,
        };
        let homing = Arc::new(HomingSupervisor::new(
            Arc::clone(&driver),
            policy,
            Duration::from_secs(2),
            None,
        ));
        tokio::spawn(Arc::clone(&homing).run());
        let gateway = ActuatorGateway::new(
            Arc::clone(&driver),
            Arc::clone(&homing),
            Duration::from_secs(30),
        );
        Rig {
            driver,
            homing,
            gateway,
        }
    }

    async fn homed_rig(latency_ms: u64) -> Rig {
        let rig = rig(latency_ms, 3);
        rig.homing.wait_until_homed().await.unwrap();
        rig
    }

    fn accept(product: &str, deadline_ms: u64) -> ActuatorCommand {
        ActuatorCommand::for_product(
            CommandKind::Accept,
            product,
            Duration::from_millis(deadline_ms),
        )
    }

    fn device_signals(signals: &[SignalEvent], device: Device) -> Vec<SignalEvent> {
        signals.iter().filter(|s| s.device == device).cloned().collect()
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_id_actuates_once() {
        let rig = homed_rig(50).await;
        let cmd = accept("DEV001-1", 1000);

        let (a, b) = tokio::join!(
            rig.gateway.execute(cmd.clone()),
            rig.gateway.execute(cmd.clone())
        );
        assert_eq!(a, b);
        assert!(a.outcome.is_completed());

        // Sequential duplicate inside the window is served from cache.
        let c = rig.gateway.execute(cmd.clone()).await;
        assert_eq!(c, a);

        assert_eq!(rig.driver.actuation_count(&cmd.id), 1);
        let stats = rig.gateway.stats();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.dedup_hits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_needs_no_homing() {
        let rig = rig(0, 3);
        let stop = rig
            .gateway
            .execute(ActuatorCommand::stop(Duration::from_secs(1)))
            .await;
        assert!(stop.outcome.is_completed());
        assert_eq!(stop.device, Device::Conveyor);
        assert_eq!(rig.driver.completed(CommandKind::Stop), 1);
        assert_eq!(rig.driver.completed(CommandKind::Home), 0);
        assert_eq!(rig.homing.state(), crate::homing::HomingState::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_expires_after_window() {
        let rig = homed_rig(0).await;
        let cmd = accept("DEV001-2", 1000);

        rig.gateway.execute(cmd.clone()).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        rig.gateway.execute(cmd.clone()).await;
        assert_eq!(rig.driver.actuation_count(&cmd.id), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn faulted_command_actuates_again_on_retry() {
        let rig = homed_rig(0).await;
        rig.driver
            .script(Device::RejectMechanism, [SimStep::fault("solenoid stuck")]);
        let cmd = ActuatorCommand::for_product(CommandKind::Reject, "DEV002-1", Duration::from_secs(1));

        let first = rig.gateway.execute(cmd.clone()).await;
        assert_eq!(first.outcome, ActuatorOutcome::Fault("solenoid stuck".into()));
        let second = rig.gateway.execute(cmd.clone()).await;
        assert!(second.outcome.is_completed());

        let begins = rig
            .driver
            .signals()
            .iter()
            .filter(|s| s.command_id == cmd.id && s.edge == SignalEdge::Begin)
            .count();
        assert_eq!(begins, 2);
        assert_eq!(rig.driver.actuation_count(&cmd.id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn accept_and_reject_never_interleave() {
        let rig = homed_rig(20).await;
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let gateway = rig.gateway.clone();
                let kind = if i % 2 == 0 {
                    CommandKind::Accept
                } else {
                    CommandKind::Reject
                };
                let cmd = ActuatorCommand::for_product(kind, &format!("p-{i}"), Duration::from_secs(1));
                tokio::spawn(async move { gateway.execute(cmd).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().outcome.is_completed());
        }

        // Every Begin is followed by the End of the same command, across both devices.
        let motions: Vec<_> = rig
            .driver
            .signals()
            .into_iter()
            .filter(|s| s.kind.is_motion())
            .collect();
        assert_eq!(motions.len(), 12);
        for pair in motions.chunks(2) {
            assert_eq!(pair[0].edge, SignalEdge::Begin);
            assert_eq!(pair[1].edge, SignalEdge::End);
            assert_eq!(pair[0].command_id, pair[1].command_id);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_holds_lane_and_records_late_completion() {
        let rig = homed_rig(500).await;
        let slow = accept("DEV003-1", 100);

        let started = Instant::now();
        let first = rig.gateway.execute(slow.clone()).await;
        assert_eq!(first.outcome, ActuatorOutcome::Timeout);
        assert_eq!(started.elapsed(), Duration::from_millis(100));

        // A retry while the device is still moving joins, bounded by its deadline.
        let retry = rig.gateway.execute(slow.clone()).await;
        assert_eq!(retry.outcome, ActuatorOutcome::Timeout);

        // Another command on the same device waits for the lane.
        let next = accept("DEV003-2", 1000);
        let next_result = rig.gateway.execute(next.clone()).await;
        assert!(next_result.outcome.is_completed());
        assert_eq!(started.elapsed(), Duration::from_millis(1000));

        // The late completion counts: retrying the original id does not move again.
        let again = rig.gateway.execute(slow.clone()).await;
        assert!(again.outcome.is_completed());
        assert_eq!(rig.driver.actuation_count(&slow.id), 1);
        assert_eq!(rig.gateway.stats().stale_results, 1);

        let conveyor = device_signals(&rig.driver.signals(), Device::Conveyor);
        let ids: Vec<_> = conveyor
            .iter()
            .filter(|s| s.kind == CommandKind::Accept)
            .map(|s| s.command_id)
            .collect();
        assert_eq!(ids, vec![slow.id, slow.id, next.id, next.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn motion_waits_for_homing_in_arrival_order() {
        let rig = rig(10, 3);
        assert_eq!(rig.homing.state(), crate::homing::HomingState::Unknown);

        let cmds: Vec<_> = (0..4).map(|i| accept(&format!("p-{i}"), 1000)).collect();
        let mut handles = Vec::new();
        for cmd in &cmds {
            let gateway = rig.gateway.clone();
            let cmd = cmd.clone();
            handles.push(tokio::spawn(async move { gateway.execute(cmd).await }));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for handle in handles {
            assert!(handle.await.unwrap().outcome.is_completed());
        }

        let conveyor = device_signals(&rig.driver.signals(), Device::Conveyor);
        assert_eq!(conveyor[0].kind, CommandKind::Home);
        let order: Vec<_> = conveyor
            .iter()
            .filter(|s| s.kind == CommandKind::Accept && s.edge == SignalEdge::Begin)
            .map(|s| s.command_id)
            .collect();
        let expected: Vec<_> = cmds.iter().map(|c| c.id).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_homing_fails_motion() {
        let rig = rig(0, 1);
        rig.driver.script(
            Device::Conveyor,
            [SimStep::fault("jam"), SimStep::fault("jam")],
        );

        let result = rig.gateway.execute(accept("p-1", 1000)).await;
        assert_eq!(result.outcome, ActuatorOutcome::HomingExhausted);
        assert_eq!(rig.homing.wait_until_homed().await, Err(HomingExhausted));
        assert_eq!(rig.driver.completed(CommandKind::Accept), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn not_homed_triggers_rehome() {
        let rig = homed_rig(0).await;
        rig.driver.script(
            Device::RejectMechanism,
            [SimStep::new(ActuatorOutcome::NotHomed, Duration::ZERO)],
        );
        let cmd = ActuatorCommand::for_product(CommandKind::Reject, "p-9", Duration::from_secs(1));

        let result = rig.gateway.execute(cmd.clone()).await;
        assert_eq!(result.outcome, ActuatorOutcome::NotHomed);

        let retried = rig.gateway.execute(cmd).await;
        assert!(retried.outcome.is_completed());
        assert_eq!(rig.driver.completed(CommandKind::Home), 2);
    }
}
