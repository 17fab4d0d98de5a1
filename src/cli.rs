//! Interface de linha de comando do traceline baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, status, show,
//! batch, export) e flags globais (--config, --threshold, --max-retries,
//! --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// traceline: inspeção, disposição e rastreabilidade de uma linha de produção.
#[derive(Debug, Parser)]
#[command(name = "traceline", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: traceline.toml).
    #[arg(long, short, global = true, env = "TRACELINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Limiar de confiança (inclusivo) para aceitar um produto.
    #[arg(long, global = true)]
    pub threshold: Option<f64>,

    /// Número máximo de retentativas de inspeção e atuação.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Coloca a linha em operação e processa um lote de produtos.
    Run {
        /// Quantidade de produtos a inspecionar.
        #[arg(long, short = 'n', default_value_t = 10)]
        count: usize,

        /// Identificador do lote (padrão: BATCH-{tipo}-{AAAAMMDD}).
        #[arg(long)]
        batch: Option<String>,

        /// Produtos em processamento simultâneo (padrão: line.concurrency).
        #[arg(long)]
        concurrency: Option<usize>,

        /// Código do tipo de produto (padrão: line.product_type).
        #[arg(long)]
        product_type: Option<String>,
    },

    /// Mostra o resumo do ledger.
    Status,

    /// Mostra o registro completo de um produto.
    Show {
        /// Identificador do produto.
        product_id: String,
    },

    /// Lista os produtos de um lote.
    Batch {
        /// Identificador do lote.
        batch_id: String,
    },

    /// Exporta todo o ledger como um array JSON.
    Export {
        /// Arquivo de destino.
        path: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from([
            "traceline",
            "run",
            "--count",
            "25",
            "--batch",
            "BATCH-DEV002-20260309",
            "--product-type",
            "DEV002",
        ]);
        match cli.command {
            Command::Run {
                count,
                batch,
                concurrency,
                product_type,
            } => {
                assert_eq!(count, 25);
                assert_eq!(batch.as_deref(), Some("BATCH-DEV002-20260309"));
                assert!(concurrency.is_none());
                assert_eq!(product_type.as_deref(), Some("DEV002"));
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn run_defaults() {
        let cli = Cli::parse_from(["traceline", "run"]);
        assert!(matches!(cli.command, Command::Run { count: 10, .. }));
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "traceline",
            "--threshold",
            "0.85",
            "--max-retries",
            "5",
            "--verbose",
            "status",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.threshold, Some(0.85));
        assert_eq!(cli.max_retries, Some(5));
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn cli_parses_queries() {
        let cli = Cli::parse_from(["traceline", "show", "DEV001-20260309140507-0001"]);
        assert!(matches!(cli.command, Command::Show { ref product_id } if product_id == "DEV001-20260309140507-0001"));

        let cli = Cli::parse_from(["traceline", "export", "out.json", "--config", "line.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("line.toml")));
        assert!(matches!(cli.command, Command::Export { ref path } if path == &PathBuf::from("out.json")));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
