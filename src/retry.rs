//! Retry policy shared by every hardware-facing operation class.
//!
//! One [`RetryPolicy`] shape covers inspection, actuation and homing. The
//! [`Backoff`] iterator hands out the delays for a single operation and stops
//! once either the attempt budget or the elapsed-time budget is spent.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// The operation classes that carry their own retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Inspection,
    Actuation,
    Homing,
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationClass::Inspection => write!(f, "inspection"),
            OperationClass::Actuation => write!(f, "actuation"),
            OperationClass::Homing => write!(f, "homing"),
        }
    }
}

/// Exponential backoff with jitter.
///
/// `max_attempts` counts the retries allowed after the initial try, so a
/// policy with `max_attempts = 3` produces three delays before giving up.
/// A `max_elapsed_ms` of zero disables the elapsed-time budget.
///
/// The older per-device spellings (`max_retries`, `retry_delay_ms`,
/// `backoff_factor`) are accepted as aliases and mean the same thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(alias = "max_retries")]
    pub max_attempts: u32,
    #[serde(alias = "retry_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(alias = "backoff_factor")]
    pub backoff_multiplier: f64,
    pub jitter_fraction: f64,
    pub max_delay_ms: u64,
    pub max_elapsed_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            backoff_multiplier: 1.5,
            jitter_fraction: 0.1,
            max_delay_ms: 10_000,
            max_elapsed_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// `min(base_delay × multiplier^attempt, max_delay)`, without jitter.
    /// `attempt` is zero-based.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.round() as u64)
    }

    /// Nominal delay perturbed by up to `± jitter_fraction` of itself.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter_fraction <= 0.0 {
            return nominal;
        }

        let nominal_ms = nominal.as_millis() as f64;
        let spread = nominal_ms * self.jitter_fraction;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((nominal_ms + offset).max(0.0).round() as u64)
    }

    pub fn max_elapsed(&self) -> Option<Duration> {
        (self.max_elapsed_ms > 0).then(|| Duration::from_millis(self.max_elapsed_ms))
    }

    /// Starts a fresh backoff sequence; the elapsed budget counts from now.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
            started: Instant::now(),
        }
    }

    pub fn validate(&self, class: OperationClass) -> Result<(), String> {
        if self.backoff_multiplier < 1.0 {
            return Err(format!(
                "retry.{class}.backoff_multiplier must be >= 1.0 (got {})",
                self.backoff_multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(format!(
                "retry.{class}.jitter_fraction must be within [0, 1] (got {})",
                self.jitter_fraction
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(format!(
                "retry.{class}.max_delay_ms ({}) is below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            ));
        }
        Ok(())
    }
}

/// Delay sequence for one operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
    started: Instant,
}

impl Backoff {
    /// Number of delays handed out so far, i.e. retries performed.
    pub fn retries(&self) -> u32 {
        self.attempt
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The delay to wait before the next retry, or `None` once exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }

        let delay = self.policy.delay_for_attempt(self.attempt);
        if let Some(budget) = self.policy.max_elapsed()
            && self.started.elapsed() + delay > budget
        {
            return None;
        }

        self.attempt += 1;
        Some(delay)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.next_delay()
    }
}
