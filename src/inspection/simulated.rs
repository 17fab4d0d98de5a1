//! Simulated camera and model.
//!
//! Unscripted calls grade a synthetic product: the type comes from the
//! product id prefix, a scratch appears at `defect_rate` and each required
//! component goes missing at `missing_rate`.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;

use super::catalog::{self, CATALOG, ProductSpec};
use super::{BoundingBox, Defect, InspectionError, InspectionVerdict, Severity, VisionProvider};

#[derive(Debug, Clone)]
pub struct VisionStep {
    pub result: Result<InspectionVerdict, InspectionError>,
    pub latency: Duration,
}

impl VisionStep {
    pub fn new(result: Result<InspectionVerdict, InspectionError>, latency: Duration) -> Self {
        Self { result, latency }
    }

    #[cfg(test)]
    pub fn verdict(verdict: InspectionVerdict) -> Self {
        Self::new(Ok(verdict), Duration::ZERO)
    }

    #[cfg(test)]
    pub fn fail(error: InspectionError) -> Self {
        Self::new(Err(error), Duration::ZERO)
    }
}

#[derive(Default)]
struct Bench {
    script: VecDeque<VisionStep>,
    calls: usize,
}

pub struct SimulatedVision {
    latency: Duration,
    defect_rate: f64,
    missing_rate: f64,
    bench: Mutex<Bench>,
}

impl SimulatedVision {
    pub fn new(latency: Duration, defect_rate: f64, missing_rate: f64) -> Self {
        Self {
            latency,
            defect_rate: defect_rate.clamp(0.0, 1.0),
            missing_rate: missing_rate.clamp(0.0, 1.0),
            bench: Mutex::new(Bench::default()),
        }
    }

    #[cfg(test)]
    pub fn script(&self, steps: impl IntoIterator<Item = VisionStep>) {
        self.bench().script.extend(steps);
    }

    #[cfg(test)]
    pub fn calls(&self) -> usize {
        self.bench().calls
    }

    fn bench(&self) -> MutexGuard<'_, Bench> {
        self.bench.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_step(&self, product_id: &str) -> VisionStep {
        let scripted = {
            let mut bench = self.bench();
            bench.calls += 1;
            tracing::trace!(product_id, call = bench.calls, scripted = bench.script.len(), "vision capture");
            bench.script.pop_front()
        };
        scripted.unwrap_or_else(|| VisionStep::new(Ok(self.synthesize(product_id)), self.latency))
    }

    fn synthesize(&self, product_id: &str) -> InspectionVerdict {
        let mut rng = rand::thread_rng();
        let spec: &ProductSpec = match catalog::product_type_of(product_id) {
            Some(spec) => spec,
            None => CATALOG.choose(&mut rng).unwrap_or(&CATALOG[0]),
        };

        let mut defects = Vec::new();
        if rng.gen_bool(self.defect_rate) {
            let severity = match rng.gen_range(0..10) {
                0..=5 => Severity::Low,
                6..=7 => Severity::Medium,
                8 => Severity::High,
                _ => Severity::Critical,
            };
            let region = BoundingBox {
                x: rng.gen_range(0..600),
                y: rng.gen_range(0..400),
                width: rng.gen_range(4..40),
                height: rng.gen_range(2..20),
            };
            defects.push(Defect::new("scratch", severity, rng.gen_range(0.6..0.95)).at(region));
        }

        let missing = spec
            .required_components
            .iter()
            .filter(|_| rng.gen_bool(self.missing_rate))
            .map(|c| c.to_string())
            .collect();

        InspectionVerdict::grade(defects, missing, spec.rohs_compliant).with_product_type(spec.code)
    }
}

impl VisionProvider for SimulatedVision {
    async fn capture_and_classify(
        &self,
        product_id: &str,
        _deadline: Duration,
    ) -> Result<InspectionVerdict, InspectionError> {
        let step = self.next_step(product_id);
        if !step.latency.is_zero() {
            tokio::time::sleep(step.latency).await;
        }
        tracing::debug!(product_id, ok = step.result.is_ok(), "simulated capture");
        step.result
    }
}
