//! Interface de terminal do dcapi: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de espera e `console` para
//! estilização com cores. O [`WaitProgress`] acompanha visualmente a espera
//! pelo resultado de um WU no terminal.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use dcapi::driver::{BackendKind, Capabilities};
use dcapi::{DcConfig, ResultStatus, WuResult};

/// Indicador visual de progresso enquanto o master espera por um WU.
///
/// Exibe um spinner animado durante a espera e mensagens coloridas para
/// resultado final (verde), inválido (vermelho) e sub-resultado (amarelo).
pub struct WaitProgress {
    // Spinner do indicatif.
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl WaitProgress {
    /// Inicia o spinner com o nome do WU.
    pub fn start(wu_name: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("waiting for {wu_name}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Mostra um sub-resultado sem interromper o spinner.
    pub fn sub_result(&self, result: &WuResult) {
        for (name, path) in &result.outputs {
            self.pb.println(format!(
                "  {} sub-result {name}: {}",
                self.yellow.apply_to("◆"),
                path.display()
            ));
        }
    }

    /// Finaliza o spinner e exibe o resultado terminal.
    pub fn finish(&self, result: &WuResult) {
        self.pb.finish_and_clear();
        let exit = result
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        match result.status {
            ResultStatus::Final | ResultStatus::Accept => println!(
                "  {} {} finished ({}), exit code {exit}",
                self.green.apply_to("✓"),
                result.wu_name,
                result.status
            ),
            ResultStatus::Invalid | ResultStatus::Sub => println!(
                "  {} {} finished ({}), exit code {exit}",
                self.red.apply_to("✗"),
                result.wu_name,
                result.status
            ),
        }
        println!("    output dir: {}", result.output_dir.display());
        for (name, path) in &result.outputs {
            println!("    {name}: {}", path.display());
        }
        for (label, path) in [
            ("stdout", &result.stdout),
            ("stderr", &result.stderr),
            ("log", &result.syslog),
        ] {
            if let Some(path) = path {
                println!("    {label}: {}", path.display());
            }
        }
    }

    /// Finaliza o spinner quando a espera termina sem resultado.
    pub fn no_result(&self, wu_name: &str) {
        self.pb.finish_and_clear();
        println!(
            "  {} no result for {wu_name} (timeout or interrupted)",
            self.yellow.apply_to("…")
        );
    }
}

/// Imprime as capacidades de um backend.
pub fn print_capabilities(kind: BackendKind, caps: &Capabilities) {
    let on = Style::new().green();
    let off = Style::new().dim();
    println!("{}", Style::new().bold().apply_to(format!("backend {kind}")));
    for (name, enabled) in [
        ("exit code", caps.exit_code),
        ("stdout", caps.stdout),
        ("stderr", caps.stderr),
        ("log", caps.log),
        ("sub-results", caps.subresults),
        ("messaging", caps.messaging),
        ("suspend", caps.suspend),
    ] {
        if enabled {
            println!("  {} {name}", on.apply_to("✓"));
        } else {
            println!("  {} {name}", off.apply_to("-"));
        }
    }
}

/// Imprime um resumo da configuração validada.
pub fn print_config_summary(config: &DcConfig) {
    let green = Style::new().green().bold();
    println!("{} configuration is valid", green.apply_to("✓"));
    if let Some(dir) = &config.work_dir {
        println!("  work_dir: {}", dir.display());
    }
    println!("  backend: {}", config.backend);
    println!("  poll interval: {}ms", config.poll_interval_ms);
    println!("  max work units: {}", config.max_workunits);
    println!("  status workers: {}", config.status_workers);
    if !config.extra.is_empty() {
        let keys: Vec<&str> = config.extra.keys().map(String::as_str).collect();
        println!("  application keys: {}", keys.join(", "));
    }
}
