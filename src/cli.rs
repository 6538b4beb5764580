//! Interface de linha de comando do worker baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, detect, publish)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_PATH;

/// Worker que consome jobs da fila e executa detecção de objetos em imagens.
#[derive(Debug, Parser)]
#[command(name = "vision-worker", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração TOML.
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Consome a fila até receber SIGINT/SIGTERM ou perder a conexão.
    Run {
        /// Sobrescreve a fila configurada.
        #[arg(long)]
        queue: Option<String>,

        /// Sobrescreve o prazo por job, em segundos.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Executa uma única detecção e imprime o resultado em JSON.
    Detect {
        /// URL pública da imagem.
        image_url: String,
    },

    /// Publica um job na fila configurada.
    Publish {
        /// URL pública da imagem.
        image_url: String,

        /// Identificador do job; um UUID v4 é gerado se omitido.
        #[arg(long)]
        job_id: Option<String>,
    },
}
