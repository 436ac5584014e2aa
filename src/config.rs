//! Configuração do vmflow carregada a partir de `vmflow.toml`.
//!
//! A struct [`OrchestratorConfig`] contém todos os parâmetros configuráveis e é
//! passada explicitamente na construção de fila, orquestradores e reconciliador.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `VMFLOW_WORKERS` tem precedência sobre o arquivo.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Nome do arquivo procurado no diretório atual.
pub const CONFIG_FILE: &str = "vmflow.toml";

/// Configuração de nível superior carregada de `vmflow.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Tamanho fixo do pool de workers.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Intervalo de polling do `JobOutcome`, em milissegundos.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Horizonte após o qual um job em execução é abandonado.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Idade mínima de uma entidade presa antes da reconciliação agir.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Por quanto tempo um job finalizado continua consultável.
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,

    /// Intervalo entre passadas periódicas de reconciliação.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Limite de snapshots por VM.
    #[serde(default = "default_max_snapshots_per_vm")]
    pub max_snapshots_per_vm: usize,

    /// Filtro padrão do `tracing` quando `RUST_LOG` não está definido.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

// Valor padrão para o pool de workers: 4.
fn default_worker_count() -> usize {
    4
}

// Valor padrão para o polling: 250ms.
fn default_poll_interval_ms() -> u64 {
    250
}

// Valor padrão para o horizonte de um job: 30 minutos.
fn default_job_timeout_secs() -> u64 {
    1800
}

// Valor padrão para considerar uma entidade presa: 10 minutos.
fn default_stale_after_secs() -> u64 {
    600
}

// Valor padrão para a retenção de jobs finalizados: 1 dia.
fn default_job_retention_secs() -> u64 {
    86_400
}

// Valor padrão para o intervalo de reconciliação: 60s.
fn default_reconcile_interval_secs() -> u64 {
    60
}

// Valor padrão para snapshots por VM: 10.
fn default_max_snapshots_per_vm() -> usize {
    10
}

// Valor padrão para o filtro de log: "info".
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
            job_retention_secs: default_job_retention_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            max_snapshots_per_vm: default_max_snapshots_per_vm(),
            log_filter: default_log_filter(),
        }
    }
}

impl OrchestratorConfig {
    /// Carrega a configuração de `vmflow.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração de um caminho explícito.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("falha ao ler {}", path.display()))?;
            toml::from_str::<OrchestratorConfig>(&contents)
                .with_context(|| format!("falha ao interpretar {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(workers) = std::env::var("VMFLOW_WORKERS")
            && !workers.is_empty()
        {
            config.worker_count = workers
                .parse()
                .with_context(|| format!("VMFLOW_WORKERS inválido: {workers}"))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejeita combinações que deixariam a fila parada.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            bail!("worker_count deve ser maior que zero");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms deve ser maior que zero");
        }
        if self.job_timeout_secs == 0 {
            bail!("job_timeout_secs deve ser maior que zero");
        }
        if self.reconcile_interval_secs == 0 {
            bail!("reconcile_interval_secs deve ser maior que zero");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}
