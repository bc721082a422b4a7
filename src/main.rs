use anyhow::{Context, Result};
use clap::Parser;
use conversa::cli::{print_commands, Cli, CliHandler, Commands, SyncArgs};
use conversa::config::AppConfig;
use std::path::Path;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    let log_file = cli.log_file.as_deref().or(config.log_file.as_deref());
    init_tracing(cli.debug, log_file)?;

    if cli.debug {
        tracing::info!("Debug mode enabled, verbose logging active");
    }

    // Polling is the default when no subcommand is given
    let command = cli.command.unwrap_or(Commands::Sync(SyncArgs {
        once: false,
        reload: false,
        mode: None,
        interval: None,
    }));

    // Needs no account
    if let Commands::Palette { query } = &command {
        print_commands(query.as_deref());
        return Ok(());
    }

    let options = command.sync_options(&config)?;
    let handler = CliHandler::new(&config, cli.account.as_deref(), options).await?;
    handler.handle_command(command).await
}

fn init_tracing(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let log_level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;

            tracing_subscriber::fmt()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_max_level(log_level)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_max_level(log_level)
                .init();
        }
    }

    Ok(())
}
