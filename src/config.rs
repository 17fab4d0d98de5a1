//! Configuração do traceline carregada a partir de `traceline.toml`.
//!
//! A struct [`TracelineConfig`] contém todos os parâmetros configuráveis,
//! agrupados por seção. Valores não presentes no arquivo usam defaults
//! sensíveis. O caminho do arquivo vem de `--config`, de `TRACELINE_CONFIG`
//! ou, na falta de ambos, de `traceline.toml` no diretório atual.
//! A variável de ambiente `TRACELINE_LEDGER` tem precedência sobre o
//! caminho do ledger no arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::TracelineError;
use crate::retry::{OperationClass, RetryPolicy};

const DEFAULT_CONFIG_FILE: &str = "traceline.toml";

/// Configuração de nível superior carregada de `traceline.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TracelineConfig {
    #[serde(default)]
    pub line: LineConfig,
    #[serde(default)]
    pub deadlines: DeadlineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub homing: HomingConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub labels: LabelConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

/// Parâmetros da linha de inspeção.
#[derive(Debug, Clone, Deserialize)]
pub struct LineConfig {
    /// Confiança mínima (inclusiva) para aceitar um produto aprovado.
    #[serde(default = "default_decision_threshold")]
    pub decision_threshold: f64,

    /// Tipo de produto usado quando o operador não informa um.
    #[serde(default = "default_product_type")]
    pub product_type: String,

    /// Quantos produtos podem estar em processamento ao mesmo tempo.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

// Valor padrão para o limiar de decisão: 0.7.
fn default_decision_threshold() -> f64 {
    0.7
}

fn default_product_type() -> String {
    "DEV001".to_string()
}

fn default_concurrency() -> usize {
    4
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            decision_threshold: default_decision_threshold(),
            product_type: default_product_type(),
            concurrency: default_concurrency(),
        }
    }
}

/// Prazos, em milissegundos, de cada chamada ao hardware.
#[derive(Debug, Clone, Deserialize)]
pub struct DeadlineConfig {
    #[serde(default = "default_inspection_ms")]
    pub inspection_ms: u64,
    #[serde(default = "default_actuation_ms")]
    pub actuation_ms: u64,
    #[serde(default = "default_homing_ms")]
    pub homing_ms: u64,
    #[serde(default = "default_label_ms")]
    pub label_ms: u64,
}

fn default_inspection_ms() -> u64 {
    2000
}

fn default_actuation_ms() -> u64 {
    1500
}

fn default_homing_ms() -> u64 {
    5000
}

fn default_label_ms() -> u64 {
    1000
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            inspection_ms: default_inspection_ms(),
            actuation_ms: default_actuation_ms(),
            homing_ms: default_homing_ms(),
            label_ms: default_label_ms(),
        }
    }
}

impl DeadlineConfig {
    pub fn inspection(&self) -> Duration {
        Duration::from_millis(self.inspection_ms)
    }

    pub fn actuation(&self) -> Duration {
        Duration::from_millis(self.actuation_ms)
    }

    pub fn homing(&self) -> Duration {
        Duration::from_millis(self.homing_ms)
    }

    pub fn label(&self) -> Duration {
        Duration::from_millis(self.label_ms)
    }
}

/// Uma política de retentativa por classe de operação.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub inspection: RetryPolicy,
    #[serde(default)]
    pub actuation: RetryPolicy,
    #[serde(default = "default_homing_policy")]
    pub homing: RetryPolicy,
}

// A homing é mais lenta e mais tolerante que as demais operações.
fn default_homing_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay_ms: 1000,
        backoff_multiplier: 2.0,
        jitter_fraction: 0.2,
        max_delay_ms: 10_000,
        max_elapsed_ms: 60_000,
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            inspection: RetryPolicy::default(),
            actuation: RetryPolicy::default(),
            homing: default_homing_policy(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self, class: OperationClass) -> &RetryPolicy {
        match class {
            OperationClass::Inspection => &self.inspection,
            OperationClass::Actuation => &self.actuation,
            OperationClass::Homing => &self.homing,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Janela em que um comando concluído é servido do cache pelo seu id.
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
}

fn default_dedup_window_ms() -> u64 {
    30_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: default_dedup_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HomingConfig {
    /// Intervalo da re-homing periódica. Zero desabilita.
    #[serde(default)]
    pub rehome_interval_secs: u64,
}

impl HomingConfig {
    pub fn rehome_interval(&self) -> Option<Duration> {
        (self.rehome_interval_secs > 0).then(|| Duration::from_secs(self.rehome_interval_secs))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareBackend {
    #[default]
    Simulated,
    Network,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HardwareConfig {
    #[serde(default)]
    pub backend: HardwareBackend,

    /// Endereço do controlador de I/O (backend `network`).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Latência simulada de cada movimento (backend `simulated`).
    #[serde(default = "default_hardware_latency_ms")]
    pub latency_ms: u64,

    /// Probabilidade de falha simulada por comando.
    #[serde(default)]
    pub fault_rate: f64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_hardware_latency_ms() -> u64 {
    50
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            backend: HardwareBackend::default(),
            base_url: default_base_url(),
            latency_ms: default_hardware_latency_ms(),
            fault_rate: 0.0,
        }
    }
}

/// Câmera e modelo simulados.
#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_vision_latency_ms")]
    pub latency_ms: u64,
    #[serde(default = "default_defect_rate")]
    pub defect_rate: f64,
    #[serde(default = "default_missing_rate")]
    pub missing_rate: f64,
}

fn default_vision_latency_ms() -> u64 {
    100
}

fn default_defect_rate() -> f64 {
    0.1
}

fn default_missing_rate() -> f64 {
    0.02
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            latency_ms: default_vision_latency_ms(),
            defect_rate: default_defect_rate(),
            missing_rate: default_missing_rate(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelBackend {
    #[default]
    Simulated,
    Spool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelConfig {
    #[serde(default)]
    pub backend: LabelBackend,

    /// Diretório onde o backend `spool` grava as etiquetas.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,

    /// Probabilidade de falha simulada da impressora.
    #[serde(default)]
    pub failure_rate: f64,
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("labels")
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            backend: LabelBackend::default(),
            spool_dir: default_spool_dir(),
            failure_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    Memory,
    #[default]
    Jsonl,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("traceline.jsonl")
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::default(),
            path: default_ledger_path(),
        }
    }
}

impl TracelineConfig {
    /// Carrega a configuração. `path` explícito precisa existir; o caminho
    /// padrão cai nos valores default se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os("TRACELINE_CONFIG").map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(explicit) => Self::from_file(&explicit)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };

        // Variável de ambiente tem precedência sobre o arquivo para o ledger.
        if let Some(ledger) = std::env::var_os("TRACELINE_LEDGER")
            && !ledger.is_empty()
        {
            config.ledger.path = PathBuf::from(ledger);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = toml::from_str::<TracelineConfig>(&contents)
            .map_err(TracelineError::from)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Aplica as flags globais da CLI sobre o que veio do arquivo.
    /// `--max-retries` vale para inspeção e atuação.
    pub fn apply_overrides(&mut self, threshold: Option<f64>, max_retries: Option<u32>) {
        if let Some(threshold) = threshold {
            self.line.decision_threshold = threshold;
        }
        if let Some(max_retries) = max_retries {
            self.retry.inspection.max_attempts = max_retries;
            self.retry.actuation.max_attempts = max_retries;
        }
    }

    pub fn validate(&self) -> Result<(), TracelineError> {
        if !(0.0..=1.0).contains(&self.line.decision_threshold) {
            return Err(TracelineError::Config(format!(
                "line.decision_threshold must be within [0, 1] (got {})",
                self.line.decision_threshold
            )));
        }
        if self.line.concurrency == 0 {
            return Err(TracelineError::Config(
                "line.concurrency must be at least 1".to_string(),
            ));
        }
        for class in [
            OperationClass::Inspection,
            OperationClass::Actuation,
            OperationClass::Homing,
        ] {
            self.retry.policy(class).validate(class).map_err(TracelineError::Config)?;
        }
        for (name, rate) in [
            ("hardware.fault_rate", self.hardware.fault_rate),
            ("vision.defect_rate", self.vision.defect_rate),
            ("vision.missing_rate", self.vision.missing_rate),
            ("labels.failure_rate", self.labels.failure_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(TracelineError::Config(format!(
                    "{name} must be within [0, 1] (got {rate})"
                )));
            }
        }
        Ok(())
    }
}
