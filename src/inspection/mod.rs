//! Camera capture and classification behind a deadline.
//!
//! [`InspectionSource`] wraps a [`VisionProvider`] and turns an overrun into
//! [`InspectionError::CaptureTimeout`]. It never retries; the controller owns
//! the inspection retry policy.

pub mod catalog;
pub mod simulated;
pub mod verdict;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;

pub use simulated::SimulatedVision;
#[cfg(test)]
pub use simulated::VisionStep;
pub use verdict::{BoundingBox, Defect, InspectionVerdict, Severity};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InspectionError {
    #[error("capture timed out")]
    CaptureTimeout,

    #[error("inference failed: {0}")]
    InferenceFailure(String),
}

/// Camera plus model. One call captures a frame and classifies it.
pub trait VisionProvider: Send + Sync + 'static {
    fn capture_and_classify(
        &self,
        product_id: &str,
        deadline: Duration,
    ) -> impl Future<Output = Result<InspectionVerdict, InspectionError>> + Send;
}

pub struct InspectionSource<V> {
    provider: Arc<V>,
    deadline: Duration,
}

impl<V: VisionProvider> InspectionSource<V> {
    pub fn new(provider: Arc<V>, deadline: Duration) -> Self {
        Self { provider, deadline }
    }

    pub async fn inspect(&self, product_id: &str) -> Result<InspectionVerdict, InspectionError> {
        match timeout(
            self.deadline,
            self.provider.capture_and_classify(product_id, self.deadline),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(
                    product_id,
                    deadline_ms = self.deadline.as_millis() as u64,
                    "capture deadline elapsed"
                );
                Err(InspectionError::CaptureTimeout)
            }
        }
    }
}
