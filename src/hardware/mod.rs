//! Actuator commands, results and the hardware driver seam.
//!
//! Every physical backend (simulated bench, networked I/O controller) sits
//! behind [`HardwareDriver::send`]. The [`Driver`] enum is what the line
//! selects at startup from configuration; everything above the gateway only
//! sees the trait.

pub mod gateway;
pub mod network;
pub mod simulated;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use gateway::{ActuatorGateway, GatewayStats};
pub use network::{NetworkDriver, NetworkDriverError};
pub use simulated::SimulatedDriver;
#[cfg(test)]
pub use simulated::{SignalEdge, SignalEvent, SimStep};

/// Identity of one logical actuator command. Retries reuse the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(Uuid);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical devices on the line. Each one is a single serialized resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Conveyor,
    RejectMechanism,
}

impl Device {
    pub const ALL: [Device; 2] = [Device::Conveyor, Device::RejectMechanism];
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Conveyor => write!(f, "conveyor"),
            Device::RejectMechanism => write!(f, "reject_mechanism"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    /// Advance the conveyor, carrying the product off the inspection station.
    Accept,
    /// Pulse the reject solenoid, pushing the product into the reject bin.
    Reject,
    /// Drive the conveyor to its reference position.
    Home,
    /// Halt the conveyor. Sent when the line shuts down.
    Stop,
}

impl CommandKind {
    pub fn device(&self) -> Device {
        match self {
            CommandKind::Accept | CommandKind::Home | CommandKind::Stop => Device::Conveyor,
            CommandKind::Reject => Device::RejectMechanism,
        }
    }

    /// Motion commands need an established conveyor position.
    pub fn is_motion(&self) -> bool {
        matches!(self, CommandKind::Accept | CommandKind::Reject)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Accept => write!(f, "ACCEPT"),
            CommandKind::Reject => write!(f, "REJECT"),
            CommandKind::Home => write!(f, "HOME"),
            CommandKind::Stop => write!(f, "STOP"),
        }
    }
}

/// A typed request for one device, carrying its own deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorCommand {
    pub id: CommandId,
    pub kind: CommandKind,
    pub device: Device,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    pub deadline_ms: u64,
    pub issued_at: DateTime<Utc>,
}

impl ActuatorCommand {
    pub fn for_product(kind: CommandKind, product_id: &str, deadline: Duration) -> Self {
        Self::build(kind, Some(product_id.to_string()), deadline)
    }

    pub fn home(deadline: Duration) -> Self {
        Self::build(CommandKind::Home, None, deadline)
    }

    pub fn stop(deadline: Duration) -> Self {
        Self::build(CommandKind::Stop, None, deadline)
    }

    fn build(kind: CommandKind, product_id: Option<String>, deadline: Duration) -> Self {
        Self {
            id: CommandId::new(),
            kind,
            device: kind.device(),
            product_id,
            deadline_ms: deadline.as_millis() as u64,
            issued_at: Utc::now(),
        }
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// What the device (or the gateway on its behalf) reports for a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ActuatorOutcome {
    Completed,
    Timeout,
    Fault(String),
    NotHomed,
    HomingExhausted,
}

impl ActuatorOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ActuatorOutcome::Completed)
    }

    /// Failures that a retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ActuatorOutcome::Timeout | ActuatorOutcome::Fault(_) | ActuatorOutcome::NotHomed
        )
    }
}

impl fmt::Display for ActuatorOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorOutcome::Completed => write!(f, "completed"),
            ActuatorOutcome::Timeout => write!(f, "timeout"),
            ActuatorOutcome::Fault(reason) => write!(f, "device fault: {reason}"),
            ActuatorOutcome::NotHomed => write!(f, "not homed"),
            ActuatorOutcome::HomingExhausted => write!(f, "homing exhausted"),
        }
    }
}

/// The result handed back to whoever issued the command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorResult {
    pub command_id: CommandId,
    pub kind: CommandKind,
    pub device: Device,
    pub outcome: ActuatorOutcome,
    pub finished_at: DateTime<Utc>,
}

impl ActuatorResult {
    pub fn new(command: &ActuatorCommand, outcome: ActuatorOutcome) -> Self {
        Self {
            command_id: command.id,
            kind: command.kind,
            device: command.device,
            outcome,
            finished_at: Utc::now(),
        }
    }
}

/// A physical backend. Implementations must not retry; that is the caller's job.
pub trait HardwareDriver: Send + Sync + 'static {
    fn send(
        &self,
        command: &ActuatorCommand,
        deadline: Duration,
    ) -> impl Future<Output = ActuatorOutcome> + Send;
}

/// Backend selected from configuration at startup.
pub enum Driver {
    Simulated(SimulatedDriver),
    Network(NetworkDriver),
}

impl HardwareDriver for Driver {
    async fn send(&self, command: &ActuatorCommand, deadline: Duration) -> ActuatorOutcome {
        match self {
            Driver::Simulated(driver) => driver.send(command, deadline).await,
            Driver::Network(driver) => driver.send(command, deadline).await,
        }
    }
}
