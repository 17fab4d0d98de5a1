//! Simulated bench hardware.
//!
//! Stands in for GPIO/serial/network devices. Each command produces a
//! `Begin` and an `End` signal edge around the simulated motion, so tests can
//! check that commands on one device never overlap. Outcomes can be scripted
//! per device; unscripted commands complete after the configured latency, or
//! fault at random when a fault rate is set.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::{ActuatorCommand, ActuatorOutcome, CommandId, CommandKind, Device, HardwareDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEdge {
    Begin,
    End,
}

/// One edge of a physical actuator signal, in the order the bench saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEvent {
    pub device: Device,
    pub command_id: CommandId,
    pub kind: CommandKind,
    pub edge: SignalEdge,
}

/// A scripted response for the next command on a device.
#[derive(Debug, Clone)]
pub struct SimStep {
    pub outcome: ActuatorOutcome,
    pub latency: Duration,
}

impl SimStep {
    pub fn new(outcome: ActuatorOutcome, latency: Duration) -> Self {
        Self { outcome, latency }
    }

    pub fn completed(latency: Duration) -> Self {
        Self::new(ActuatorOutcome::Completed, latency)
    }

    #[cfg(test)]
    pub fn fault(reason: &str) -> Self {
        Self::new(ActuatorOutcome::Fault(reason.to_string()), Duration::ZERO)
    }
}

#[derive(Default)]
struct BenchState {
    script: HashMap<Device, VecDeque<SimStep>>,
    signals: Vec<SignalEvent>,
    actuations: HashMap<CommandId, (CommandKind, u32)>,
}

pub struct SimulatedDriver {
    latency: Duration,
    fault_rate: f64,
    state: Mutex<BenchState>,
}

impl SimulatedDriver {
    pub fn new(latency: Duration, fault_rate: f64) -> Self {
        Self {
            latency,
            fault_rate: fault_rate.clamp(0.0, 1.0),
            state: Mutex::new(BenchState::default()),
        }
    }

    /// Queue scripted outcomes for the next commands sent to `device`.
    #[cfg(test)]
    pub fn script(&self, device: Device, steps: impl IntoIterator<Item = SimStep>) {
        let mut state = self.lock();
        state.script.entry(device).or_default().extend(steps);
    }

    #[cfg(test)]
    pub fn signals(&self) -> Vec<SignalEvent> {
        self.lock().signals.clone()
    }

    /// How many times the device physically completed this command.
    #[cfg(test)]
    pub fn actuation_count(&self, id: &CommandId) -> u32 {
        self.lock().actuations.get(id).map_or(0, |(_, count)| *count)
    }

    /// Completed actuations of a given kind across all commands.
    #[cfg(test)]
    pub fn completed(&self, kind: CommandKind) -> u32 {
        self.lock()
            .actuations
            .values()
            .filter(|(k, _)| *k == kind)
            .map(|(_, count)| count)
            .sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BenchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_step(&self, device: Device) -> SimStep {
        if let Some(step) = self.lock().script.get_mut(&device).and_then(VecDeque::pop_front) {
            return step;
        }
        if self.fault_rate > 0.0 && rand::random::<f64>() < self.fault_rate {
            return SimStep::new(
                ActuatorOutcome::Fault(format!("simulated {device} fault")),
                self.latency,
            );
        }
        SimStep::completed(self.latency)
    }

    fn edge(&self, command: &ActuatorCommand, edge: SignalEdge) {
        let event = SignalEvent {
            device: command.device,
            command_id: command.id,
            kind: command.kind,
            edge,
        };
        tracing::trace!(
            device = ?event.device,
            command_id = ?event.command_id,
            kind = ?event.kind,
            edge = ?event.edge,
            "bench signal"
        );
        self.lock().signals.push(event);
    }
}

impl HardwareDriver for SimulatedDriver {
    async fn send(&self, command: &ActuatorCommand, _deadline: Duration) -> ActuatorOutcome {
        let step = self.next_step(command.device);

        self.edge(command, SignalEdge::Begin);
        if !step.latency.is_zero() {
            tokio::time::sleep(step.latency).await;
        }
        self.edge(command, SignalEdge::End);

        if step.outcome.is_completed() {
            self.lock()
                .actuations
                .entry(command.id)
                .or_insert((command.kind, 0))
                .1 += 1;
        }
        tracing::debug!(
            device = %command.device,
            command_id = %command.id,
            kind = %command.kind,
            outcome = %step.outcome,
            "simulated actuation"
        );
        step.outcome
    }
}
