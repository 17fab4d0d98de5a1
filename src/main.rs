mod cli;
mod config;
mod controller;
mod error;
mod hardware;
mod homing;
mod inspection;
mod labeling;
mod ledger;
mod line;
mod logging;
mod retry;
mod state_machine;
mod ui;

use anyhow::{Context, Result, bail};
use clap::Parser;

use cli::{Cli, Command};
use config::TracelineConfig;
use error::TracelineError;
use line::{InspectionLine, RunRequest};
use ui::LineProgress;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose)?;

    let mut config = TracelineConfig::load(cli.config.as_deref())?;
    config.apply_overrides(cli.threshold, cli.max_retries);
    config.validate()?;

    match cli.command {
        Command::Run {
            count,
            batch,
            concurrency,
            product_type,
        } => {
            let request = RunRequest {
                count,
                product_type: product_type.unwrap_or_else(|| config.line.product_type.clone()),
                batch_id: batch,
                concurrency: concurrency.unwrap_or(config.line.concurrency),
            };
            run(&config, request).await
        }
        Command::Status => {
            let ledger = line::open_ledger(&config.ledger)?;
            if ledger.is_empty() {
                return Err(TracelineError::EmptyLedger.into());
            }
            ui::print_summary(&ledger.summary());
            Ok(())
        }
        Command::Show { product_id } => {
            let ledger = line::open_ledger(&config.ledger)?;
            let entry = ledger
                .get(&product_id)
                .ok_or(TracelineError::ProductNotFound(product_id))?;
            ui::print_entry(&entry);
            Ok(())
        }
        Command::Batch { batch_id } => {
            let ledger = line::open_ledger(&config.ledger)?;
            let entries = ledger.by_batch(&batch_id);
            if entries.is_empty() {
                bail!("No products recorded for batch {batch_id}");
            }
            ui::print_batch(&batch_id, &entries);
            Ok(())
        }
        Command::Export { path } => {
            let ledger = line::open_ledger(&config.ledger)?;
            let count = ledger
                .export_json(&path)
                .with_context(|| format!("failed to export ledger to {}", path.display()))?;
            println!("Exported {count} entries to {}", path.display());
            Ok(())
        }
    }
}

async fn run(config: &TracelineConfig, request: RunRequest) -> Result<()> {
    if inspection::catalog::lookup(&request.product_type).is_none() {
        bail!("Unknown product type: {}", request.product_type);
    }

    let mut line = InspectionLine::from_config(config)?;
    let mut progress = LineProgress::homing();
    if let Err(e) = line.start().await {
        progress.abandon("conveyor could not be homed");
        line.shutdown().await;
        return Err(e).context("line start failed");
    }

    let batch_id = request
        .batch_id
        .clone()
        .unwrap_or_else(|| inspection::catalog::batch_id(&request.product_type, chrono::Utc::now()));
    let request = RunRequest {
        batch_id: Some(batch_id.clone()),
        ..request
    };
    progress.start_batch(&batch_id, request.count);

    let report = line.run(&request, |entry| progress.entry(entry)).await;
    progress.finish(&report);
    line.shutdown().await;

    if !report.failures.is_empty() {
        bail!("{} products could not be committed", report.failures.len());
    }
    Ok(())
}
