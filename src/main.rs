mod cli;
mod ui;

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{parse_input_spec, Cli, Command};

use dcapi::driver::build_driver;
use dcapi::{logging, DcConfig, Master, TransferMode};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(if cli.verbose { "debug" } else { "warn" });

    let mut config = DcConfig::load(cli.config.as_deref())?;
    if let Some(backend) = cli.backend {
        config.backend = backend.into();
    }

    match cli.command {
        Command::Run {
            command,
            inputs,
            outputs,
            timeout,
            subresults,
            priority,
            project,
            app,
            cleanup,
        } => {
            if config.work_dir.is_none() {
                config.work_dir = Some(std::env::temp_dir().join("dcapi"));
            }
            let driver = build_driver(&config, &app)?;
            let mut master = Master::with_driver(&project, &app, config, driver)?;

            let Some((client, args)) = command.split_first() else {
                bail!("missing client executable");
            };
            let wu = master.create(client, args, subresults, None)?;
            for spec in &inputs {
                let Some((name, path)) = parse_input_spec(spec) else {
                    bail!("invalid input `{spec}`, expected NAME=PATH");
                };
                master
                    .add_input(&wu, &name, &path, TransferMode::Regular)
                    .with_context(|| format!("cannot stage input {name}"))?;
            }
            for name in &outputs {
                master.add_output(&wu, name)?;
            }
            master.set_priority(&wu, priority)?;
            master.submit(&wu).context("submit failed")?;

            let token = master.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });

            let progress = ui::WaitProgress::start(&wu);
            let mut terminal = None;
            while terminal.is_none() {
                let mut delivered = Vec::new();
                let count = master
                    .check_for_result(timeout, |result| delivered.push(result))
                    .await?;
                if count == 0 {
                    break;
                }
                for result in delivered {
                    if result.is_terminal() {
                        terminal = Some(result);
                    } else {
                        progress.sub_result(&result);
                    }
                }
            }

            let code = match &terminal {
                Some(result) => {
                    progress.finish(result);
                    let code = result.exit_code.unwrap_or(1).clamp(0, 255);
                    u8::try_from(code).unwrap_or(1)
                }
                None => {
                    progress.no_result(&wu);
                    if let Err(err) = master.cancel(&wu) {
                        tracing::warn!(wu = %wu, error = %err, "cannot cancel work unit");
                    }
                    2
                }
            };
            if cleanup {
                master.destroy(&wu)?;
            }
            Ok(ExitCode::from(code))
        }
        Command::Capabilities => {
            let driver = build_driver(&config, "dcapi")?;
            ui::print_capabilities(driver.kind(), &driver.capabilities());
            Ok(ExitCode::SUCCESS)
        }
        Command::CheckConfig => {
            config.validate()?;
            ui::print_config_summary(&config);
            Ok(ExitCode::SUCCESS)
        }
    }
}
