//! Interface de terminal do traceline: barra de progresso e saída colorida.
//!
//! Usa as crates `indicatif` para o progresso do lote e `console` para
//! estilização com cores. O [`LineProgress`] acompanha visualmente uma
//! execução da linha; as funções `print_*` formatam as consultas ao ledger.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::ledger::LedgerSummary;
use crate::line::RunReport;
use crate::state_machine::{Disposition, LedgerEntry};

/// Estilo de cor para cada disposição: verde aceito, amarelo rejeitado,
/// vermelho abortado.
fn disposition_style(disposition: &Disposition) -> Style {
    match disposition {
        Disposition::Accepted => Style::new().green().bold(),
        Disposition::Rejected => Style::new().yellow().bold(),
        Disposition::Aborted(_) => Style::new().red().bold(),
    }
}

fn disposition_mark(disposition: &Disposition) -> &'static str {
    match disposition {
        Disposition::Accepted => "✓",
        Disposition::Rejected => "↓",
        Disposition::Aborted(_) => "✗",
    }
}

/// Indicador visual de progresso para um lote em execução.
pub struct LineProgress {
    pb: ProgressBar,
    dim: Style,
}

impl LineProgress {
    /// Mostra um spinner enquanto o transportador é referenciado.
    pub fn homing() -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message("HOMING conveyor");
        pb.enable_steady_tick(Duration::from_millis(100));
        Self {
            pb,
            dim: Style::new().dim(),
        }
    }

    /// Troca o spinner por uma barra com `count` produtos.
    pub fn start_batch(&mut self, batch_id: &str, count: usize) {
        self.pb.finish_and_clear();
        self.pb = ProgressBar::new(count as u64);
        self.pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        self.pb.set_message(batch_id.to_string());
        self.pb.enable_steady_tick(Duration::from_millis(100));
    }

    /// Registra um produto concluído acima da barra.
    pub fn entry(&self, entry: &LedgerEntry) {
        let style = disposition_style(&entry.disposition);
        let retries = if entry.retry_count > 0 {
            format!(" ({} retries)", entry.retry_count)
        } else {
            String::new()
        };
        self.pb.println(format!(
            "  {} {} {}{}",
            style.apply_to(disposition_mark(&entry.disposition)),
            entry.product_id,
            style.apply_to(&entry.disposition),
            self.dim.apply_to(retries),
        ));
        self.pb.inc(1);
    }

    /// Encerra a barra e imprime o resultado do lote.
    pub fn finish(&self, report: &RunReport) {
        self.pb.finish_and_clear();
        let summary = LedgerSummary::from_entries(&report.entries);
        println!();
        println!(
            "{}",
            Style::new().bold().apply_to(format!("─── Batch {} ───", report.batch_id))
        );
        print_counts(&summary);
        println!(
            "  {}",
            self.dim.apply_to(format!(
                "conveyor {}, {} commands sent, {} deduplicated, {} late replies",
                report.homing,
                report.stats.dispatched,
                report.stats.dedup_hits,
                report.stats.stale_results
            ))
        );
        for failure in &report.failures {
            println!("  {} {failure}", Style::new().red().bold().apply_to("!"));
        }
    }

    /// Encerra a barra com uma mensagem de erro.
    pub fn abandon(&self, message: &str) {
        self.pb.abandon_with_message(message.to_string());
    }
}

fn print_counts(summary: &LedgerSummary) {
    println!(
        "  {} accepted  {} rejected  {} aborted",
        Style::new().green().bold().apply_to(summary.accepted),
        Style::new().yellow().bold().apply_to(summary.rejected),
        Style::new().red().bold().apply_to(summary.aborted),
    );
    for (reason, count) in &summary.abort_reasons {
        println!("    {reason}: {count}");
    }
    println!(
        "  {} retries, {} warnings",
        summary.retries, summary.warnings
    );
}

/// Resumo do ledger inteiro (subcomando `status`).
pub fn print_summary(summary: &LedgerSummary) {
    println!(
        "{}",
        Style::new().bold().apply_to(format!(
            "─── Ledger: {} products in {} batches ───",
            summary.total, summary.batches
        ))
    );
    print_counts(summary);
}

/// Registro completo de um produto em JSON (subcomando `show`).
pub fn print_entry(entry: &LedgerEntry) {
    let style = disposition_style(&entry.disposition);
    println!("{}", style.apply_to(format!("─── {} ───", entry.product_id)));
    println!("{}", serde_json::to_string_pretty(entry).unwrap_or_default());
}

/// Uma linha por produto do lote (subcomando `batch`).
pub fn print_batch(batch_id: &str, entries: &[LedgerEntry]) {
    println!(
        "{}",
        Style::new()
            .bold()
            .apply_to(format!("─── {batch_id}: {} products ───", entries.len()))
    );
    for entry in entries {
        let style = disposition_style(&entry.disposition);
        let confidence = entry
            .verdict
            .as_ref()
            .map(|v| format!("{:.2}", v.confidence))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {:<28} {:<36} confidence {confidence}",
            style.apply_to(disposition_mark(&entry.disposition)),
            entry.product_id,
            style.apply_to(entry.disposition.to_string()),
        );
    }
    print_counts(&LedgerSummary::from_entries(entries));
}
