use std::process::ExitCode;

use clap::Parser;

use leadflow_cli::{Cli, CommandError};
use leadflow_infra::IngestionConfig;

#[tokio::main]
async fn main() -> ExitCode {
    // Invalid arguments exit with status 2 from here.
    let cli = Cli::parse();
    leadflow_observability::init();

    let name = cli.command.name();
    let result = match IngestionConfig::from_env() {
        Ok(config) => leadflow_cli::run(cli.command, &config).await,
        Err(err) => Err(CommandError::from(err)),
    };

    match result {
        Ok(output) => emit(&output, false),
        Err(err) => {
            tracing::error!(command = name, reason = %err.reason, "{}", err.message);
            emit(&err.into_failed(name), true);
            ExitCode::FAILURE
        }
    }
}

fn emit<T: serde::Serialize>(document: &T, to_stderr: bool) -> ExitCode {
    let line = match serde_json::to_string(document) {
        Ok(line) => line,
        Err(err) => {
            eprintln!("failed to serialize output: {err}");
            return ExitCode::FAILURE;
        }
    };
    if to_stderr {
        eprintln!("{line}");
    } else {
        println!("{line}");
    }
    ExitCode::SUCCESS
}
