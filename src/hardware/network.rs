//! Driver para um controlador de I/O acessível via HTTP.
//!
//! Cada [`ActuatorCommand`] é enviado como JSON em `POST {base_url}/commands`.
//! O controlador responde com `{"status": "...", "reason": "..."}` usando o
//! mesmo formato de [`ActuatorOutcome`]. Qualquer falha de transporte vira
//! `Fault`; estouro do prazo vira `Timeout`. O driver nunca retenta.

use std::time::Duration;

use reqwest::Client;
use thiserror::Error;

use super::{ActuatorCommand, ActuatorOutcome, HardwareDriver};

/// Erros ao falar com o controlador de I/O.
#[derive(Debug, Error)]
pub enum NetworkDriverError {
    /// O controlador respondeu com um status HTTP de erro (4xx/5xx).
    #[error("controller returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// O corpo da resposta não é um resultado de atuador válido.
    #[error("malformed controller reply: {0}")]
    Malformed(String),

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

pub struct NetworkDriver {
    client: Client,
    base_url: String,
}

impl NetworkDriver {
    /// Cria o driver apontando para `base_url` (ex.: `http://10.0.0.12:8080`).
    pub fn new(base_url: &str) -> Result<Self, NetworkDriverError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Envia o comando e devolve o resultado reportado pelo controlador.
    pub async fn dispatch(
        &self,
        command: &ActuatorCommand,
        deadline: Duration,
    ) -> Result<ActuatorOutcome, NetworkDriverError> {
        let response = self
            .client
            .post(format!("{}/commands", self.base_url))
            .timeout(deadline)
            .json(command)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(NetworkDriverError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        serde_json::from_str::<ActuatorOutcome>(&body)
            .map_err(|e| NetworkDriverError::Malformed(format!("{e}: {body}")))
    }
}

impl HardwareDriver for NetworkDriver {
    async fn send(&self, command: &ActuatorCommand, deadline: Duration) -> ActuatorOutcome {
        match self.dispatch(command, deadline).await {
            Ok(outcome) => outcome,
            Err(NetworkDriverError::Transport(e)) if e.is_timeout() => ActuatorOutcome::Timeout,
            Err(e) => {
                tracing::warn!(
                    device = %command.device,
                    command_id = %command.id,
                    error = %e,
                    "controller request failed"
                );
                ActuatorOutcome::Fault(e.to_string())
            }
        }
    }
}
