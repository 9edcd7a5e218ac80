mod cli;

use std::{fs::OpenOptions, sync::Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

const DEFAULT_LOG_FILTER: &str = "colorchallenge=info,scheduler=info,worker=info,common=info";

fn init_tracing(cli: &Cli) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("no se pudo abrir el log {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    match cli.command {
        Commands::Run {
            input,
            output,
            summary_json,
            tuning,
        } => {
            cli::run(input, output, summary_json, tuning).await?;
        }
        Commands::Inspect { url, tuning } => {
            cli::inspect(url, tuning).await?;
        }
    }

    Ok(())
}
