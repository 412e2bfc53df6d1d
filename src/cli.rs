//! Interface de linha de comando do dcapi baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, capabilities,
//! check-config) e flags globais (--config, --backend, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use dcapi::driver::BackendKind;

/// dcapi: despacha work units para backends locais, Condor, ClusterGrid e BOINC.
#[derive(Debug, Parser)]
#[command(name = "dcapi", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração TOML (padrão: `dcapi.toml` no diretório atual).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Backend a usar, sobrescrevendo a configuração.
    #[arg(long, global = true)]
    pub backend: Option<BackendArg>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Backend aceito pela CLI, mapeado para [`BackendKind`] internamente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    /// Processo filho na máquina local.
    Local,
    /// Pool Condor via `condor_submit`.
    Condor,
    /// Broker ClusterGrid via `clgr_submit`.
    Clustergrid,
    /// Projeto BOINC via `create_work`.
    Boinc,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Local => BackendKind::Local,
            BackendArg::Condor => BackendKind::Condor,
            BackendArg::Clustergrid => BackendKind::ClusterGrid,
            BackendArg::Boinc => BackendKind::Boinc,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submete um único WU e espera pelo resultado.
    Run {
        /// Executável do cliente (caminho ou nome procurado no PATH)
        /// seguido dos seus argumentos.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,

        /// Arquivo de entrada no formato `NOME=CAMINHO` (repetível).
        #[arg(long = "input", short = 'i')]
        inputs: Vec<String>,

        /// Nome lógico de um arquivo de saída esperado (repetível).
        #[arg(long = "output", short = 'o')]
        outputs: Vec<String>,

        /// Segundos de espera: 0 bloqueia até o resultado, negativo verifica uma vez.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        timeout: i64,

        /// Número máximo de sub-resultados aceitos.
        #[arg(long, default_value_t = 0)]
        subresults: u32,

        /// Prioridade repassada ao backend.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i32,

        /// Identificador do projeto usado nos nomes dos WUs.
        #[arg(long, default_value = "dcapi")]
        project: String,

        /// Nome da aplicação (usado pelos templates BOINC).
        #[arg(long, default_value = "dcapi")]
        app: String,

        /// Remove o diretório de trabalho ao final.
        #[arg(long, default_value_t = false)]
        cleanup: bool,
    },

    /// Mostra as capacidades do backend configurado.
    Capabilities,

    /// Valida o arquivo de configuração.
    CheckConfig,
}

/// Separa uma especificação `NOME=CAMINHO`. Sem `=`, o nome lógico é o nome
/// do arquivo.
pub fn parse_input_spec(spec: &str) -> Option<(String, String)> {
    if let Some((name, path)) = spec.split_once('=') {
        if name.is_empty() || path.is_empty() {
            return None;
        }
        return Some((name.to_string(), path.to_string()));
    }
    let name = std::path::Path::new(spec).file_name()?.to_str()?;
    Some((name.to_string(), spec.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from([
            "dcapi", "run", "--timeout", "5", "-i", "in.txt=/tmp/a.txt", "-o", "out.txt",
            "sleep", "1",
        ]);
        match cli.command {
            Command::Run {
                command,
                inputs,
                outputs,
                timeout,
                ..
            } => {
                assert_eq!(command, vec!["sleep", "1"]);
                assert_eq!(inputs, vec!["in.txt=/tmp/a.txt"]);
                assert_eq!(outputs, vec!["out.txt"]);
                assert_eq!(timeout, 5);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn client_args_may_look_like_flags() {
        let cli = Cli::parse_from(["dcapi", "run", "sh", "-c", "exit 3"]);
        match cli.command {
            Command::Run { command, .. } => {
                assert_eq!(command, vec!["sh", "-c", "exit 3"]);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "dcapi",
            "--backend",
            "clustergrid",
            "--config",
            "grid.toml",
            "--verbose",
            "capabilities",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.backend, Some(BackendArg::Clustergrid));
        assert_eq!(cli.config, Some(PathBuf::from("grid.toml")));
        assert!(matches!(cli.command, Command::Capabilities));
        assert_eq!(BackendKind::from(BackendArg::Clustergrid), BackendKind::ClusterGrid);
    }

    #[test]
    fn input_specs() {
        assert_eq!(
            parse_input_spec("in.txt=/data/a.txt"),
            Some(("in.txt".to_string(), "/data/a.txt".to_string()))
        );
        assert_eq!(
            parse_input_spec("/data/b.txt"),
            Some(("b.txt".to_string(), "/data/b.txt".to_string()))
        );
        assert_eq!(parse_input_spec("=x"), None);
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
