//! Interface de terminal do vmflow: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`StepProgress`] acompanha visualmente cada
//! operação da demonstração no terminal.

use std::fmt;
use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::json;

use vmflow::state_machine::{Impact, StateMachine, Symbol};

/// Indicador visual de progresso para uma operação no terminal.
///
/// Exibe um spinner animado enquanto a operação aguarda o job e mensagens
/// coloridas para sucesso (verde) e falha (vermelho).
pub struct StepProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    // Estilo verde para mensagens de sucesso.
    green: Style,
    // Estilo vermelho para mensagens de falha.
    red: Style,
}

impl StepProgress {
    /// Inicia o spinner com a descrição da operação.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(description.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
        }
    }

    /// Finaliza o spinner e exibe o resultado da operação.
    pub fn finish<T, E: fmt::Display>(
        &self,
        result: &Result<T, E>,
        detail: impl FnOnce(&T) -> String,
    ) {
        self.pb.finish_and_clear();
        match result {
            Ok(value) => println!("  {} {}", self.green.apply_to("✓"), detail(value)),
            Err(err) => println!("  {} {err}", self.red.apply_to("✗")),
        }
    }
}

/// Imprime um título seguido do valor em JSON formatado.
pub fn print_json(title: &str, value: &impl Serialize) {
    println!();
    println!("{}", Style::new().cyan().apply_to(format!("─── {title} ───")));
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

/// Imprime a tabela de transições, uma aresta por linha ou em JSON.
pub fn print_transitions<S: Symbol, E: Symbol>(machine: &StateMachine<S, E>, as_json: bool) {
    if as_json {
        let rows: Vec<_> = machine
            .transitions()
            .iter()
            .map(|t| {
                json!({
                    "from": t.from.to_string(),
                    "event": t.event.to_string(),
                    "to": t.to.to_string(),
                    "usage": t.has_impact(Impact::Usage),
                })
            })
            .collect();
        print_json(machine.name(), &rows);
        return;
    }

    let dim = Style::new().dim();
    println!("{}", Style::new().bold().apply_to(machine.name()));
    for transition in machine.transitions() {
        println!("  {transition}");
    }
    println!("{}", dim.apply_to(format!("{} transições", machine.transitions().len())));
}
