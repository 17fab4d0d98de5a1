use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum quality score for a product to pass grading.
pub const PASS_SCORE: f64 = 0.7;

/// Score deduction when any required component is missing.
const MISSING_COMPONENT_PENALTY: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// How much of the quality score a defect of this severity costs.
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Low => 0.1,
            Severity::Medium => 0.3,
            Severity::High => 0.6,
            Severity::Critical => 1.0,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Pixel region of a defect in the captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defect {
    pub label: String,
    pub severity: Severity,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<BoundingBox>,
}

impl Defect {
    pub fn new(label: &str, severity: Severity, confidence: f64) -> Self {
        Self {
            label: label.to_string(),
            severity,
            confidence: confidence.clamp(0.0, 1.0),
            region: None,
        }
    }

    pub fn at(mut self, region: BoundingBox) -> Self {
        self.region = Some(region);
        self
    }
}

/// What the camera and model concluded about one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionVerdict {
    pub passed: bool,
    /// Quality score in [0, 1]; the decision compares it to the line threshold.
    pub confidence: f64,
    pub defects: Vec<Defect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,
    #[serde(default)]
    pub missing_components: Vec<String>,
    pub rohs_compliant: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
    pub inspected_at: DateTime<Utc>,
}

impl InspectionVerdict {
    /// Grades raw findings into a verdict.
    ///
    /// The score starts at 1.0 and loses the weight of the worst defect
    /// severity, plus a fixed penalty when any component is missing. A
    /// product that is not RoHS compliant scores zero regardless.
    pub fn grade(defects: Vec<Defect>, missing_components: Vec<String>, rohs_compliant: bool) -> Self {
        let mut score = 1.0;
        let mut reasons = Vec::new();

        if let Some(worst) = defects.iter().map(|d| d.severity).max() {
            score -= worst.weight();
            reasons.push(format!("Found {worst} severity defects"));
        }

        if !missing_components.is_empty() {
            score -= MISSING_COMPONENT_PENALTY;
            reasons.push(format!("Missing components: {}", missing_components.join(", ")));
        }

        if !rohs_compliant {
            score = 0.0;
            reasons.push("Product is not RoHS compliant".to_string());
        }

        let score = f64::clamp(score, 0.0, 1.0);
        let passed = score >= PASS_SCORE;
        if passed {
            reasons.push("Product meets all quality standards".to_string());
        }

        Self {
            passed,
            confidence: score,
            defects,
            product_type: None,
            missing_components,
            rohs_compliant,
            reasons,
            inspected_at: Utc::now(),
        }
    }

    pub fn with_product_type(mut self, product_type: &str) -> Self {
        self.product_type = Some(product_type.to_string());
        self
    }

    /// A verdict that skips grading, for callers that already have a model
    /// score.
    pub fn scored(passed: bool, confidence: f64) -> Self {
        Self {
            passed,
            confidence: confidence.clamp(0.0, 1.0),
            defects: Vec::new(),
            product_type: None,
            missing_components: Vec::new(),
            rohs_compliant: true,
            reasons: Vec::new(),
            inspected_at: Utc::now(),
        }
    }
}
