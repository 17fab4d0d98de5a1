//! Wiring of one inspection line: backends selected from configuration, the
//! homing supervisor, the gateway, the controller and the ledger.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::{
    HardwareBackend, HardwareConfig, LabelBackend, LabelConfig, LedgerBackend, LedgerConfig,
    TracelineConfig,
};
use crate::controller::{ControllerSettings, DispositionController};
use crate::error::TracelineError;
use crate::hardware::{
    ActuatorCommand, ActuatorGateway, ActuatorResult, Driver, GatewayStats, NetworkDriver,
    SimulatedDriver,
};
use crate::homing::{HomingExhausted, HomingState, HomingStatus, HomingSupervisor};
use crate::inspection::{InspectionSource, SimulatedVision, catalog};
use crate::labeling::{Printer, SimulatedPrinter, SpoolPrinter};
use crate::ledger::{JsonlLedger, Ledger, MemoryLedger};
use crate::retry::OperationClass;
use crate::state_machine::{LedgerEntry, ProductInstance};

pub fn open_ledger(config: &LedgerConfig) -> Result<Arc<dyn Ledger>, TracelineError> {
    Ok(match config.backend {
        LedgerBackend::Memory => Arc::new(MemoryLedger::new()),
        LedgerBackend::Jsonl => {
            let ledger = JsonlLedger::open(&config.path)?;
            tracing::info!(path = %ledger.path().display(), entries = ledger.len(), "ledger loaded");
            Arc::new(ledger)
        }
    })
}

pub fn build_driver(config: &HardwareConfig) -> Result<Driver, TracelineError> {
    Ok(match config.backend {
        HardwareBackend::Simulated => Driver::Simulated(SimulatedDriver::new(
            Duration::from_millis(config.latency_ms),
            config.fault_rate,
        )),
        HardwareBackend::Network => Driver::Network(NetworkDriver::new(&config.base_url)?),
    })
}

pub fn build_printer(config: &LabelConfig) -> Printer {
    match config.backend {
        LabelBackend::Simulated => {
            Printer::Simulated(SimulatedPrinter::new(Duration::ZERO, config.failure_rate))
        }
        LabelBackend::Spool => Printer::Spool(SpoolPrinter::new(&config.spool_dir)),
    }
}

/// What the operator asked `run` to do.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub count: usize,
    pub product_type: String,
    /// Defaults to `BATCH-{type}-{YYYYMMDD}`.
    pub batch_id: Option<String>,
    pub concurrency: usize,
}

#[derive(Debug)]
pub struct RunReport {
    pub batch_id: String,
    pub entries: Vec<LedgerEntry>,
    /// Products whose entry could not be committed.
    pub failures: Vec<String>,
    /// Gateway counters at the end of the run.
    pub stats: GatewayStats,
    pub homing: HomingState,
}

type Controller = DispositionController<SimulatedVision, Driver, Printer>;

pub struct InspectionLine {
    homing: Arc<HomingSupervisor<Driver>>,
    gateway: ActuatorGateway<Driver>,
    controller: Arc<Controller>,
    ledger: Arc<dyn Ledger>,
    supervisor: Option<JoinHandle<()>>,
    next_seq: AtomicU32,
    stop_deadline: Duration,
}

impl InspectionLine {
    pub fn from_config(config: &TracelineConfig) -> Result<Self> {
        let ledger = open_ledger(&config.ledger)
            .with_context(|| format!("failed to open ledger {}", config.ledger.path.display()))?;
        Self::with_ledger(config, ledger)
    }

    pub fn with_ledger(config: &TracelineConfig, ledger: Arc<dyn Ledger>) -> Result<Self> {
        let driver = Arc::new(build_driver(&config.hardware).context("failed to set up hardware")?);
        let homing = Arc::new(HomingSupervisor::new(
            Arc::clone(&driver),
            config.retry.policy(OperationClass::Homing).clone(),
            config.deadlines.homing(),
            config.homing.rehome_interval(),
        ));
        let gateway = ActuatorGateway::new(
            driver,
            Arc::clone(&homing),
            Duration::from_millis(config.gateway.dedup_window_ms),
        );

        let vision = Arc::new(SimulatedVision::new(
            Duration::from_millis(config.vision.latency_ms),
            config.vision.defect_rate,
            config.vision.missing_rate,
        ));
        let controller = DispositionController::new(
            InspectionSource::new(vision, config.deadlines.inspection()),
            gateway.clone(),
            Arc::new(build_printer(&config.labels)),
            Arc::clone(&ledger),
            ControllerSettings::from_config(config),
        );

        let seq = u32::try_from(ledger.len()).unwrap_or(u32::MAX);
        Ok(Self {
            homing,
            gateway,
            controller: Arc::new(controller),
            ledger,
            supervisor: None,
            next_seq: AtomicU32::new(seq),
            stop_deadline: config.deadlines.actuation(),
        })
    }

    pub fn homing_status(&self) -> HomingStatus {
        self.homing.status()
    }

    /// Starts the homing supervisor and waits for the conveyor to be homed.
    pub async fn start(&mut self) -> Result<(), HomingExhausted> {
        if self.supervisor.is_none() {
            self.supervisor = Some(tokio::spawn(Arc::clone(&self.homing).run()));
        }
        self.homing.request_homing();
        self.homing.wait_until_homed().await
    }

    /// A fresh product with the next id in sequence.
    pub fn next_product(&self, product_type: &str, batch_id: &str) -> ProductInstance {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let product_id = catalog::product_id(product_type, Utc::now(), seq);
        ProductInstance::new(product_id, batch_id.to_string())
    }

    /// Runs `request.count` products, at most `request.concurrency` at a
    /// time. `on_entry` sees each committed entry as it lands.
    pub async fn run(&self, request: &RunRequest, mut on_entry: impl FnMut(&LedgerEntry)) -> RunReport {
        let batch_id = request
            .batch_id
            .clone()
            .unwrap_or_else(|| catalog::batch_id(&request.product_type, Utc::now()));
        let permits = Arc::new(Semaphore::new(request.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        tracing::info!(
            batch_id = %batch_id,
            count = request.count,
            concurrency = request.concurrency,
            "run started"
        );

        let mut report = RunReport {
            batch_id: batch_id.clone(),
            entries: Vec::with_capacity(request.count),
            failures: Vec::new(),
            stats: GatewayStats::default(),
            homing: HomingState::Unknown,
        };

        for _ in 0..request.count {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let product = self.next_product(&request.product_type, &batch_id);
            let product_id = product.product_id.clone();
            let controller = Arc::clone(&self.controller);
            tasks.spawn(async move {
                let result = controller.process(product).await;
                drop(permit);
                (product_id, result)
            });

            // Report what already finished while the next product waits for a permit.
            while let Some(joined) = tasks.try_join_next() {
                collect(joined, &mut report, &mut on_entry);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut report, &mut on_entry);
        }

        report.stats = self.gateway.stats();
        report.homing = self.homing_status().current();
        tracing::info!(
            batch_id = %batch_id,
            committed = report.entries.len(),
            failed = report.failures.len(),
            ledger_total = self.ledger.len(),
            dedup_hits = report.stats.dedup_hits,
            stale_results = report.stats.stale_results,
            "run finished"
        );
        report
    }

    /// Stops the homing supervisor, then halts the conveyor. The STOP
    /// result is returned so the caller can tell whether the belt is at rest.
    pub async fn shutdown(mut self) -> ActuatorResult {
        self.homing.shutdown();
        if let Some(handle) = self.supervisor.take()
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "homing supervisor did not stop cleanly");
        }

        let stop = self
            .gateway
            .execute(ActuatorCommand::stop(self.stop_deadline))
            .await;
        if stop.outcome.is_completed() {
            tracing::info!("conveyor stopped");
        } else {
            tracing::warn!(outcome = %stop.outcome, "conveyor did not confirm STOP");
        }
        stop
    }
}

fn collect(
    joined: Result<(String, Result<LedgerEntry, TracelineError>), tokio::task::JoinError>,
    report: &mut RunReport,
    on_entry: &mut impl FnMut(&LedgerEntry),
) {
    match joined {
        Ok((_, Ok(entry))) => {
            on_entry(&entry);
            report.entries.push(entry);
        }
        Ok((product_id, Err(e))) => {
            tracing::error!(product_id = %product_id, error = %e, "product not committed");
            report.failures.push(format!("{product_id}: {e}"));
        }
        Err(e) => {
            tracing::error!(error = %e, "product task failed");
            report.failures.push(e.to_string());
        }
    }
}
