use super::{build_engine, load_policy};
use crate::config::Config;
use crate::daemon::{DaemonClient, DaemonRequest, DaemonResponse, DaemonServer};
use crate::error::{PilotError, Result};
use crate::transaction::Orchestrator;
use crate::ui::state_label;
use colored::*;

/// Run the daemon in the foreground until Shutdown or SIGINT
pub async fn start_daemon(config: Config) -> Result<()> {
    eprintln!("{} Starting nixpilot daemon...", "[>>]".cyan().bold());

    let engine = build_engine(&config)?;
    if let Some(reason) = engine.halt_latch().reason()? {
        eprintln!(
            "{} Halted: {}. Submissions are rejected until `nixpilot resume`.",
            "[!!!]".red().bold(),
            reason
        );
    }
    eprintln!("  Config root: {}", config.config_root.display());
    eprintln!("  Policy digest: {}", engine.policy().digest());

    let orchestrator = Orchestrator::start(engine);
    let server = DaemonServer::new(config, orchestrator);
    server.start().await
}

fn client(config: &Config) -> Result<DaemonClient> {
    let client = DaemonClient::new(config.socket_path());
    if !client.is_running() {
        return Err(PilotError::Daemon(format!(
            "daemon is not running (no socket at {})",
            config.socket_path().display()
        )));
    }
    Ok(client)
}

fn unexpected(response: DaemonResponse) -> PilotError {
    match response {
        DaemonResponse::Error { message } => PilotError::Daemon(message),
        other => PilotError::Daemon(format!("unexpected response: {:?}", other)),
    }
}

pub async fn stop_daemon(config: &Config) -> Result<()> {
    eprintln!("{} Stopping daemon...", "[STOP]".yellow());
    match client(config)?.send_request(&DaemonRequest::Shutdown).await? {
        DaemonResponse::ShuttingDown => {
            eprintln!("{} Daemon is draining its queue and will exit.", "[OK]".green());
            Ok(())
        }
        other => Err(unexpected(other)),
    }
}

pub async fn daemon_status(config: &Config) -> Result<()> {
    let client = DaemonClient::new(config.socket_path());
    if !client.is_running() {
        eprintln!("{} Daemon is not running.", "[X]".red());
        eprintln!("\n{} To start it:", "[TIP]".cyan());
        eprintln!("  {}", "nixpilot daemon start".yellow());
        return Ok(());
    }

    let uptime = match client.send_request(&DaemonRequest::Ping).await? {
        DaemonResponse::Pong { uptime_seconds, .. } => uptime_seconds,
        other => return Err(unexpected(other)),
    };

    match client.send_request(&DaemonRequest::Status).await? {
        DaemonResponse::Status {
            current,
            pending,
            halted,
        } => {
            println!("{} Daemon is running.", "[OK]".green().bold());
            println!("  Uptime: {} seconds", uptime);
            println!("  Queued or in flight: {}", pending);
            if let Some(progress) = current {
                println!(
                    "  Current: {} {}  {}",
                    state_label(progress.state),
                    &progress.tx_id[..progress.tx_id.len().min(8)],
                    progress.description
                );
            }
            if let Some(reason) = halted {
                println!("  {} Halted: {}", "[!!!]".red().bold(), reason);
            }
            Ok(())
        }
        other => Err(unexpected(other)),
    }
}

/// Validate the policy file locally first so a typo is reported here
pub async fn daemon_reload(config: &Config) -> Result<()> {
    load_policy(config)?;
    match client(config)?.send_request(&DaemonRequest::Reload).await? {
        DaemonResponse::Reloaded { old_digest, new_digest } => {
            if old_digest == new_digest {
                println!("{} Policy unchanged ({})", "[OK]".green(), short(&new_digest));
            } else {
                println!(
                    "{} Policy reloaded: {} -> {}",
                    "[OK]".green().bold(),
                    short(&old_digest),
                    short(&new_digest)
                );
            }
            Ok(())
        }
        other => Err(unexpected(other)),
    }
}

pub async fn daemon_cancel(config: &Config, tx_id: String) -> Result<()> {
    let request = DaemonRequest::Cancel { tx_id };
    match client(config)?.send_request(&request).await? {
        DaemonResponse::Cancelling { tx_id } => {
            println!("{} Cancelling {}", "[OK]".green(), tx_id);
            Ok(())
        }
        other => Err(unexpected(other)),
    }
}

fn short(digest: &str) -> &str {
    &digest[..digest.len().min(12)]
}
