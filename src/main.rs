use anyhow::Context;
use clap::Parser;
use colored::*;
use std::process::ExitCode;

use nixpilot::cli::{Cli, Command, DaemonAction, PolicyAction};
use nixpilot::commands;
use nixpilot::config::Config;
use nixpilot::error::PilotError;
use nixpilot::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            if matches!(e.downcast_ref::<PilotError>(), Some(PilotError::UserCancelled)) {
                eprintln!("{} Cancelled.", "[X]".yellow());
            } else {
                eprintln!("{} {:#}", "[X]".red().bold(), e);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    let starts_daemon = matches!(
        cli.command,
        Command::Daemon {
            action: None | Some(DaemonAction::Start)
        }
    );
    // Held until exit so the file writer flushes
    let _guard = if starts_daemon {
        Some(logging::init_daemon(&config.logs_dir(), cli.debug)?)
    } else {
        logging::init_cli(cli.debug);
        None
    };
    tracing::debug!(config_root = %config.config_root.display(), "configuration loaded");

    let code = match cli.command {
        Command::Apply(args) => commands::apply(&config, args).await?,
        Command::Rollback { target, activate } => {
            commands::rollback(&config, target, activate).await?;
            ExitCode::SUCCESS
        }
        Command::Snapshots { action } => {
            commands::snapshots(&config, action).await?;
            ExitCode::SUCCESS
        }
        Command::History { executions, limit } => {
            commands::history(&config, executions, limit)?;
            ExitCode::SUCCESS
        }
        Command::Health => {
            commands::health(&config).await?;
            ExitCode::SUCCESS
        }
        Command::Policy { action } => match action {
            PolicyAction::Show => {
                commands::policy_show(&config)?;
                ExitCode::SUCCESS
            }
            PolicyAction::Check { path, command } => commands::policy_check(&config, path, command)?,
        },
        Command::Daemon { action } => {
            match action.unwrap_or(DaemonAction::Start) {
                DaemonAction::Start => commands::start_daemon(config).await?,
                DaemonAction::Stop => commands::stop_daemon(&config).await?,
                DaemonAction::Status => commands::daemon_status(&config).await?,
                DaemonAction::Reload => commands::daemon_reload(&config).await?,
                DaemonAction::Cancel { tx_id } => commands::daemon_cancel(&config, tx_id).await?,
            }
            ExitCode::SUCCESS
        }
        Command::Resume => {
            commands::resume(&config).await?;
            ExitCode::SUCCESS
        }
    };
    Ok(code)
}
