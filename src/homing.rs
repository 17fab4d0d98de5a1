//! Conveyor homing and recovery.
//!
//! The [`HomingSupervisor`] is the only writer of the conveyor's position
//! state. Motion commands pass through [`HomingSupervisor::acquire_motion`],
//! which blocks while the position is unknown or being re-established and
//! fails fast once homing has exhausted its retry budget.
//!
//! The conveyor and the reject solenoid act on the same belt, so every motion
//! and every homing run holds the belt lock for its whole duration. Waiters
//! are released in arrival order.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, Notify, watch};
use tokio::time::{Instant, Interval, interval_at, sleep, timeout};

use crate::hardware::{ActuatorCommand, ActuatorOutcome, Device, HardwareDriver};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingState {
    /// Position never established since startup.
    Unknown,
    /// A homing run is in progress; `attempt` is zero-based.
    Homing { attempt: u32 },
    Homed,
    /// A device reported a fault that invalidates the position.
    Faulted,
    /// Homing gave up. Motion commands fail until the line re-homes.
    Exhausted,
}

impl fmt::Display for HomingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HomingState::Unknown => write!(f, "UNKNOWN"),
            HomingState::Homing { attempt } => write!(f, "HOMING (attempt {})", attempt + 1),
            HomingState::Homed => write!(f, "HOMED"),
            HomingState::Faulted => write!(f, "FAULTED"),
            HomingState::Exhausted => write!(f, "EXHAUSTED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("conveyor homing exhausted its retry budget")]
pub struct HomingExhausted;

/// Read-only view of the homing state.
#[derive(Debug, Clone)]
pub struct HomingStatus(watch::Receiver<HomingState>);

impl HomingStatus {
    pub fn current(&self) -> HomingState {
        *self.0.borrow()
    }

    /// Waits until the state satisfies `f` and returns it.
    #[cfg(test)]
    pub async fn wait_for(&mut self, f: impl FnMut(&HomingState) -> bool) -> HomingState {
        if let Ok(state) = self.0.wait_for(f).await {
            return *state;
        }
        *self.0.borrow()
    }
}

pub struct HomingSupervisor<D> {
    driver: Arc<D>,
    policy: RetryPolicy,
    deadline: Duration,
    rehome_interval: Option<Duration>,
    state: watch::Sender<HomingState>,
    belt: Mutex<()>,
    wake: Notify,
    shutdown: Notify,
}

impl<D: HardwareDriver> HomingSupervisor<D> {
    pub fn new(
        driver: Arc<D>,
        policy: RetryPolicy,
        deadline: Duration,
        rehome_interval: Option<Duration>,
    ) -> Self {
        let (state, _) = watch::channel(HomingState::Unknown);
        Self {
            driver,
            policy,
            deadline,
            rehome_interval,
            state,
            belt: Mutex::new(()),
            wake: Notify::new(),
            shutdown: Notify::new(),
        }
    }

    pub fn state(&self) -> HomingState {
        *self.state.borrow()
    }

    pub fn status(&self) -> HomingStatus {
        HomingStatus(self.state.subscribe())
    }

    /// Asks the loop to home the conveyor unless a run is already going.
    /// Also the way out of `Exhausted`.
    pub fn request_homing(&self) {
        let started = self.state.send_if_modified(|state| {
            if matches!(state, HomingState::Homing { .. }) {
                return false;
            }
            *state = HomingState::Homing { attempt: 0 };
            true
        });
        if started {
            self.wake.notify_one();
        }
    }

    /// Marks the position as lost and requests homing. Ignored while a run
    /// is in progress or after homing gave up.
    pub fn report_fault(&self, device: Device, reason: &str) {
        let faulted = self.state.send_if_modified(|state| match state {
            HomingState::Homing { .. } | HomingState::Exhausted => false,
            _ => {
                *state = HomingState::Faulted;
                true
            }
        });
        if faulted {
            tracing::warn!(device = %device, reason, "conveyor position invalidated");
            self.request_homing();
        }
    }

    /// Resolves once the conveyor is homed, requesting homing when nobody
    /// has yet.
    pub async fn wait_until_homed(&self) -> Result<(), HomingExhausted> {
        let mut rx = self.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                HomingState::Homed => return Ok(()),
                HomingState::Exhausted => return Err(HomingExhausted),
                HomingState::Unknown | HomingState::Faulted => self.request_homing(),
                HomingState::Homing { .. } => {}
            }
            if rx.changed().await.is_err() {
                return Err(HomingExhausted);
            }
        }
    }

    /// Gate for a motion command. The returned guard must be held for the
    /// whole physical operation.
    pub async fn acquire_motion(&self) -> Result<MutexGuard<'_, ()>, HomingExhausted> {
        loop {
            self.wait_until_homed().await?;
            let guard = self.belt.lock().await;
            if self.state() == HomingState::Homed {
                return Ok(guard);
            }
            // A homing run slipped in between the gate and the lock.
            drop(guard);
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Background loop. Runs until [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>) {
        let mut periodic = self
            .rehome_interval
            .filter(|period| !period.is_zero())
            .map(|period| interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::debug!("homing supervisor stopped");
                    break;
                }
                _ = self.wake.notified() => self.home_with_backoff().await,
                _ = next_tick(&mut periodic) => {
                    // Also the unattended way out of `Exhausted`.
                    let mut previous = None;
                    self.state.send_if_modified(|state| {
                        if !matches!(state, HomingState::Homed | HomingState::Exhausted) {
                            return false;
                        }
                        previous = Some(*state);
                        *state = HomingState::Homing { attempt: 0 };
                        true
                    });
                    if let Some(previous) = previous {
                        tracing::info!(from = %previous, "periodic re-home");
                        self.home_with_backoff().await;
                    }
                }
            }
        }
    }

    async fn home_with_backoff(&self) {
        let _belt = self.belt.lock().await;
        let mut backoff = self.policy.backoff();

        loop {
            let attempt = backoff.retries();
            self.state.send_replace(HomingState::Homing { attempt });
            let outcome = self.send_home(&ActuatorCommand::home(self.deadline)).await;

            if outcome.is_completed() {
                tracing::info!(attempt = attempt + 1, "conveyor homed");
                self.state.send_replace(HomingState::Homed);
                return;
            }

            match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        outcome = %outcome,
                        delay_ms = delay.as_millis() as u64,
                        "homing failed, backing off"
                    );
                    sleep(delay).await;
                }
                None => {
                    tracing::error!(
                        attempts = backoff.retries() + 1,
                        elapsed_ms = backoff.elapsed().as_millis() as u64,
                        outcome = %outcome,
                        "homing exhausted"
                    );
                    self.state.send_replace(HomingState::Exhausted);
                    return;
                }
            }
        }
    }

    /// One HOME run. An overrun still counts as a timeout, but the conveyor
    /// gets one more deadline to come to rest before the next attempt so two
    /// HOME motions never overlap.
    async fn send_home(&self, command: &ActuatorCommand) -> ActuatorOutcome {
        let send = self.driver.send(command, self.deadline);
        tokio::pin!(send);
        if let Ok(outcome) = timeout(self.deadline, &mut send).await {
            return outcome;
        }

        tracing::warn!(
            command_id = %command.id,
            deadline_ms = self.deadline.as_millis() as u64,
            "HOME overran its deadline, waiting for the conveyor to settle"
        );
        match timeout(self.deadline, send).await {
            Ok(late) => tracing::debug!(outcome = %late, "late HOME result discarded"),
            Err(_) => tracing::error!("conveyor did not report after HOME, retrying anyway"),
        }
        ActuatorOutcome::Timeout
    }
}

async fn next_tick(periodic: &mut Option<Interval>) {
    match periodic {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
