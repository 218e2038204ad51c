use anyhow::{Context, Result};
use clap::Parser;
use pipetun_cli::args::{normalize_args, Cli};
use pipetun_cli::commands::{self, Logging};
use pipetun_cli::config::ConfigManager;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse_from(normalize_args(std::env::args_os()));

    init_logging(&cli.log_level, cli.log_file.as_deref())?;

    let config = ConfigManager::default_location()?;
    let settings = config.load()?.with_process_env();
    let ctx = commands::Context::system(settings)?;
    let logging = Logging {
        level: cli.log_level.clone(),
        file: cli.log_file.clone(),
    };

    commands::dispatch(cli.command, &ctx, &config, &logging).await
}

fn init_logging(log_level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .context(format!("Failed to create log directory: {:?}", parent))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context(format!("Failed to open log file: {:?}", path))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}
