//! Known product types and the identifiers derived from them.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductSpec {
    pub code: &'static str,
    pub name: &'static str,
    pub rohs_compliant: bool,
    pub required_components: &'static [&'static str],
}

pub static CATALOG: [ProductSpec; 3] = [
    ProductSpec {
        code: "DEV001",
        name: "Arduino Nano",
        rohs_compliant: true,
        required_components: &["USB Connector", "Microcontroller", "Pins"],
    },
    ProductSpec {
        code: "DEV002",
        name: "Raspberry Pi",
        rohs_compliant: true,
        required_components: &["HDMI Port", "USB Ports", "GPIO Pins", "Ethernet Port"],
    },
    ProductSpec {
        code: "DEV003",
        name: "ESP32 Module",
        rohs_compliant: true,
        required_components: &["Antenna", "Chip", "Pins"],
    },
];

pub fn lookup(code: &str) -> Option<&'static ProductSpec> {
    CATALOG.iter().find(|spec| spec.code == code)
}

/// Product type encoded in a product id (`DEV001-...` → `DEV001`).
pub fn product_type_of(product_id: &str) -> Option<&'static ProductSpec> {
    product_id.split('-').next().and_then(lookup)
}

/// `{type}-{YYYYMMDDHHMMSS}-{nnnn}`
pub fn product_id(code: &str, at: DateTime<Utc>, seq: u32) -> String {
    format!("{code}-{}-{:04}", at.format("%Y%m%d%H%M%S"), seq % 10_000)
}

/// `BATCH-{type}-{YYYYMMDD}`
pub fn batch_id(code: &str, at: DateTime<Utc>) -> String {
    format!("BATCH-{code}-{}", at.format("%Y%m%d"))
}
