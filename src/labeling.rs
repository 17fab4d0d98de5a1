//! Label issuance.
//!
//! A label carries the traceability payload for one product. Printing is
//! best effort: the controller records a failure as a warning and carries on
//! with the physical disposition.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("printer error: {0}")]
    Printer(String),

    #[error("label deadline of {0}ms elapsed")]
    Timeout(u64),

    #[error("spool IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("label encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LabelStatus {
    Passed,
    Rejected,
}

impl fmt::Display for LabelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelStatus::Passed => write!(f, "PASSED"),
            LabelStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Everything printed on the label besides the product and batch ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,
    pub manufacturing_date: NaiveDate,
    pub rohs_compliant: bool,
    pub status: LabelStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelArtifact {
    pub label_id: Uuid,
    pub product_id: String,
    pub batch_id: String,
    pub fields: LabelFields,
    /// Text encoded in the label's QR code.
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<PathBuf>,
    pub issued_at: DateTime<Utc>,
}

impl LabelArtifact {
    pub fn new(product_id: &str, batch_id: &str, fields: &LabelFields) -> Self {
        let issued_at = Utc::now();
        Self {
            label_id: Uuid::new_v4(),
            product_id: product_id.to_string(),
            batch_id: batch_id.to_string(),
            fields: fields.clone(),
            payload: traceability_payload(product_id, batch_id, fields, issued_at),
            location: None,
            issued_at,
        }
    }
}

/// `key:value` lines, one per traceability field.
pub fn traceability_payload(
    product_id: &str,
    batch_id: &str,
    fields: &LabelFields,
    at: DateTime<Utc>,
) -> String {
    [
        format!("product_id:{product_id}"),
        format!("product_type:{}", fields.product_type.as_deref().unwrap_or("")),
        format!("batch_id:{batch_id}"),
        format!("manufacturing_date:{}", fields.manufacturing_date),
        format!("rohs_compliant:{}", fields.rohs_compliant),
        format!("status:{}", fields.status),
        format!("timestamp:{}", at.to_rfc3339()),
    ]
    .join("\n")
}

pub trait LabelIssuer: Send + Sync + 'static {
    fn issue_label(
        &self,
        product_id: &str,
        batch_id: &str,
        fields: &LabelFields,
    ) -> impl Future<Output = Result<LabelArtifact, LabelError>> + Send;
}

/// In-memory printer for the bench and tests.
pub struct SimulatedPrinter {
    latency: Duration,
    failure_rate: f64,
    failures: Mutex<VecDeque<String>>,
    issued: Mutex<Vec<LabelArtifact>>,
}

impl SimulatedPrinter {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            failures: Mutex::new(VecDeque::new()),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// The next label fails with `reason`.
    pub fn fail_next(&self, reason: &str) {
        lock(&self.failures).push_back(reason.to_string());
    }

    pub fn issued(&self) -> Vec<LabelArtifact> {
        lock(&self.issued).clone()
    }

    fn next_failure(&self) -> Option<String> {
        if let Some(reason) = lock(&self.failures).pop_front() {
            return Some(reason);
        }
        (self.failure_rate > 0.0 && rand::random::<f64>() < self.failure_rate)
            .then(|| "simulated ribbon out".to_string())
    }
}

impl LabelIssuer for SimulatedPrinter {
    async fn issue_label(
        &self,
        product_id: &str,
        batch_id: &str,
        fields: &LabelFields,
    ) -> Result<LabelArtifact, LabelError> {
        let failure = self.next_failure();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(reason) = failure {
            return Err(LabelError::Printer(reason));
        }

        let artifact = LabelArtifact::new(product_id, batch_id, fields);
        lock(&self.issued).push(artifact.clone());
        Ok(artifact)
    }
}

/// Writes one JSON artifact per label into a spool directory that the
/// print server picks up.
pub struct SpoolPrinter {
    dir: PathBuf,
}

impl SpoolPrinter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl LabelIssuer for SpoolPrinter {
    async fn issue_label(
        &self,
        product_id: &str,
        batch_id: &str,
        fields: &LabelFields,
    ) -> Result<LabelArtifact, LabelError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut artifact = LabelArtifact::new(product_id, batch_id, fields);
        let path = self.dir.join(format!("{product_id}.label.json"));
        artifact.location = Some(path.clone());

        let json = serde_json::to_vec_pretty(&artifact)?;
        tokio::fs::write(&path, json).await?;
        tracing::debug!(product_id, path = %path.display(), "label spooled");
        Ok(artifact)
    }
}

/// Printer backend selected from configuration.
pub enum Printer {
    Simulated(SimulatedPrinter),
    Spool(SpoolPrinter),
}

impl LabelIssuer for Printer {
    async fn issue_label(
        &self,
        product_id: &str,
        batch_id: &str,
        fields: &LabelFields,
    ) -> Result<LabelArtifact, LabelError> {
        match self {
            Printer::Simulated(p) => p.issue_label(product_id, batch_id, fields).await,
            Printer::Spool(p) => p.issue_label(product_id, batch_id, fields).await,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> LabelFields {
        LabelFields {
            product_type: Some("DEV001".into()),
            manufacturing_date: NaiveDate::from_ymd_opt(2026, 3, 9).unwrap(),
            rohs_compliant: true,
            status: LabelStatus::Passed,
        }
    }

    #[test]
    fn payload_lists_traceability_fields() {
        let at = DateTime::parse_from_rfc3339("2026-03-09T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let payload = traceability_payload("DEV001-1", "BATCH-DEV001-20260309", &fields(), at);
        let lines: Vec<_> = payload.lines().collect();
        assert_eq!(lines[0], "product_id:DEV001-1");
        assert_eq!(lines[1], "product_type:DEV001");
        assert_eq!(lines[2], "batch_id:BATCH-DEV001-20260309");
        assert_eq!(lines[3], "manufacturing_date:2026-03-09");
        assert_eq!(lines[4], "rohs_compliant:true");
        assert_eq!(lines[5], "status:PASSED");
        assert!(lines[6].starts_with("timestamp:2026-03-09T10:00:00"));
    }

    #[tokio::test]
    async fn simulated_printer_fails_on_demand() {
        let printer = SimulatedPrinter::new(Duration::ZERO, 0.0);
        printer.fail_next("ribbon out");

        let err = printer.issue_label("p-1", "b-1", &fields()).await.unwrap_err();
        assert_eq!(err.to_string(), "printer error: ribbon out");

        let ok = printer.issue_label("p-1", "b-1", &fields()).await.unwrap();
        assert_eq!(ok.product_id, "p-1");
        assert_eq!(printer.issued().len(), 1);
    }

    #[tokio::test]
    async fn spool_printer_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let printer = Printer::Spool(SpoolPrinter::new(dir.path().join("spool")));

        let artifact = printer
            .issue_label("DEV001-20260309100000-0001", "BATCH-DEV001-20260309", &fields())
            .await
            .unwrap();
        let path = artifact.location.clone().unwrap();
        assert!(path.ends_with("DEV001-20260309100000-0001.label.json"));

        let written: LabelArtifact =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, artifact);
        assert_eq!(written.fields.status, LabelStatus::Passed);
    }
}
