//! Interface de linha de comando do vmflow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (demo, transitions,
//! config) e flags globais (--config, --workers, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// vmflow: máquinas de estado e jobs serializados para volumes e snapshots de VM.
#[derive(Debug, Parser)]
#[command(name = "vmflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho alternativo para o arquivo de configuração.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Tamanho do pool de workers (sobrepõe o arquivo e `VMFLOW_WORKERS`).
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Máquina de estados cuja tabela pode ser impressa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MachineArg {
    /// Ciclo de vida de volumes.
    Volume,
    /// Ciclo de vida de snapshots de VM.
    VmSnapshot,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa a demonstração embutida sobre o hypervisor simulado.
    Demo {
        /// Injeta uma falha na criação do volume para mostrar a compensação.
        #[arg(long)]
        inject_failure: bool,
    },

    /// Imprime a tabela de transições de uma máquina de estados.
    Transitions {
        machine: MachineArg,

        /// Saída em JSON em vez de texto.
        #[arg(long)]
        json: bool,
    },

    /// Mostra a configuração efetiva em TOML.
    Config,
}
