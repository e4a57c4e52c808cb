use super::rollback::format_snapshot;
use super::{load_policy, open_snapshots, via_daemon};
use crate::cli::SnapshotAction;
use crate::config::Config;
use crate::daemon::{DaemonRequest, DaemonResponse};
use crate::error::{PilotError, Result};
use crate::executor::{load_history, CommandExecution, ExecutionStatus};
use crate::health::{HealthMonitor, SystemdProbe};
use crate::policy::{CommandClass, PathVerdict, SafetyPolicy};
use crate::toolchain::GenerationLog;
use crate::transaction::{HaltLatch, Transaction, TransactionJournal};
use crate::ui::{create_spinner, diff_line, state_label};
use colored::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

pub async fn snapshots(config: &Config, action: SnapshotAction) -> Result<()> {
    let store = open_snapshots(config)?;
    match action {
        SnapshotAction::List => {
            let baseline = store.baseline()?;
            let generations: HashMap<String, u64> = GenerationLog::new(&config.state_dir)
                .list()?
                .into_iter()
                .map(|g| (g.snapshot_id, g.number))
                .collect();
            let list = store.list()?;
            if list.is_empty() {
                println!("No snapshots yet.");
            }
            for snapshot in &list {
                println!("{}", format_snapshot(snapshot, baseline.as_deref(), &generations));
            }
        }
        SnapshotAction::Create { label } => {
            let spinner = create_spinner("Capturing configuration tree...");
            let snapshot = store.create(&label, None);
            spinner.finish_and_clear();
            let snapshot = snapshot?;
            println!(
                "{} Snapshot {} ({} files)",
                "[OK]".green().bold(),
                snapshot.id.yellow(),
                snapshot.file_count
            );
        }
        SnapshotAction::Diff { from, to } => {
            let patch = store.diff(&from, &to)?;
            if patch.is_empty() {
                println!("Snapshots are identical.");
                return Ok(());
            }
            println!("{}", patch.summary());
            for line in patch.to_unified().lines() {
                println!("{}", diff_line(line));
            }
        }
        SnapshotAction::Prune { keep } => {
            let keep = keep.unwrap_or(config.retention_keep);
            let report = store.prune(keep)?;
            println!(
                "{} Removed {} snapshots and {} objects (kept newest {})",
                "[OK]".green().bold(),
                report.removed.len(),
                report.objects_removed,
                keep
            );
        }
    }
    Ok(())
}

pub fn history(config: &Config, executions: bool, limit: usize) -> Result<()> {
    if executions {
        let entries = load_history(&config.state_dir.join("executions.jsonl"), limit)?;
        if entries.is_empty() {
            println!("No commands recorded.");
        }
        for entry in &entries {
            println!("{}", format_execution(entry));
        }
        return Ok(());
    }

    let transactions = TransactionJournal::new(&config.state_dir).load(limit)?;
    if transactions.is_empty() {
        println!("No transactions recorded.");
    }
    for tx in &transactions {
        println!("{}", format_transaction(tx));
    }
    Ok(())
}

fn format_transaction(tx: &Transaction) -> String {
    let mut line = format!(
        "{}  {} {}  {}",
        tx.started_at.format("%Y-%m-%d %H:%M:%S"),
        state_label(tx.state),
        &tx.id[..tx.id.len().min(8)],
        tx.request.describe()
    );
    if let Some(reason) = tx.reasons.first() {
        line.push_str(&format!("\n    {} {}", format!("{}:", reason.kind).red(), reason.message));
    }
    line
}

fn format_execution(entry: &CommandExecution) -> String {
    let status = match (entry.status, entry.exit_code) {
        (ExecutionStatus::TimedOut, _) => "timeout".red(),
        (_, Some(0)) => "ok".green(),
        (_, Some(code)) => format!("exit {}", code).red(),
        (_, None) => "killed".red(),
    };
    format!(
        "{}  {:<10} {:<8} {:>6}ms  {}",
        entry.started_at.format("%Y-%m-%d %H:%M:%S"),
        entry.classification.as_str(),
        status,
        entry.duration_ms,
        entry.command
    )
}

/// One probe sample plus the persisted agent state
pub async fn health(config: &Config) -> Result<()> {
    let executor = super::executor(config, load_policy(config)?);
    let probe = SystemdProbe::new(Arc::clone(&executor), config.health.watched_units.clone());
    let monitor = HealthMonitor::new(Arc::new(probe), config.health.clone());

    let spinner = create_spinner("Sampling system health...");
    let sample = monitor.sample().await;
    spinner.finish_and_clear();
    let sample = sample?;

    if sample.failed_units.is_empty() {
        println!("{} No failed units", "[OK]".green().bold());
    } else {
        println!("{} Failed units:", "[!]".red().bold());
        for unit in &sample.failed_units {
            println!("  {}", unit.red());
        }
    }
    for (unit, restarts) in &sample.restarts {
        println!("  {} restarts: {}", unit, restarts);
    }

    if let Some(current) = GenerationLog::new(&config.state_dir).current()? {
        println!(
            "Generation {} (snapshot {}, {})",
            current.number,
            current.snapshot_id,
            current.activated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if let Some(reason) = HaltLatch::new(&config.state_dir).reason()? {
        println!("{} Halted: {}", "[!!!]".red().bold(), reason);
    }
    Ok(())
}

pub fn policy_show(config: &Config) -> Result<()> {
    let policy = load_policy(config)?;
    println!("{} {}", "Policy:".bold(), config.policy_path.display());
    println!("{} {}", "Digest:".bold(), policy.digest());
    if policy.system_wide_access() {
        println!("{}", "System-wide path access is enabled".yellow());
    }

    println!("\n{}", "Allowed path prefixes".cyan().bold());
    for prefix in policy.allowed_path_prefixes() {
        println!("  {}", prefix.display());
    }
    println!("\n{}", "Forbidden path prefixes".cyan().bold());
    for prefix in policy.forbidden_path_prefixes() {
        println!("  {}", prefix.display());
    }
    println!("\n{}", "Forbidden command patterns".cyan().bold());
    for pattern in policy.forbidden_patterns() {
        println!("  {}", pattern);
    }
    println!("\n{}", "Safe command patterns".cyan().bold());
    for pattern in policy.safe_patterns() {
        println!("  {}", pattern);
    }
    Ok(())
}

/// Exit status is failure when anything checked is denied or forbidden
pub fn policy_check(config: &Config, paths: Vec<PathBuf>, command: Option<Vec<String>>) -> Result<ExitCode> {
    if paths.is_empty() && command.is_none() {
        return Err(PilotError::Config("give --path and/or --command to check".to_string()));
    }
    let policy = load_policy(config)?;
    let lines = check_lines(&policy, &paths, command.as_deref());
    let denied = lines.iter().any(|(ok, _)| !ok);
    for (_, line) in lines {
        println!("{}", line);
    }
    Ok(if denied { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn check_lines(policy: &SafetyPolicy, paths: &[PathBuf], command: Option<&[String]>) -> Vec<(bool, String)> {
    let mut lines = Vec::new();
    for path in paths {
        match policy.evaluate_path(path) {
            PathVerdict::Allowed => lines.push((true, format!("{} {}", "allowed".green(), path.display()))),
            PathVerdict::Denied(why) => {
                lines.push((false, format!("{} {}  ({})", "denied".red(), path.display(), why)))
            }
        }
    }
    if let Some(argv) = command {
        let verdict = policy.evaluate_command(argv);
        let label = match verdict.class {
            CommandClass::Safe => "safe".green(),
            CommandClass::Restricted => "restricted".yellow(),
            CommandClass::Forbidden => "forbidden".red(),
        };
        let mut line = format!("{} {}", label, argv.join(" "));
        if let Some(matched) = verdict.matched {
            line.push_str(&format!("  ({})", matched));
        }
        lines.push((verdict.class != CommandClass::Forbidden, line));
    }
    lines
}

/// Clear the halt latch, through the daemon when one is running
pub async fn resume(config: &Config) -> Result<()> {
    let cleared = match via_daemon(config, &DaemonRequest::Resume).await {
        Some(response) => match response? {
            DaemonResponse::Resumed { cleared } => cleared,
            DaemonResponse::Error { message } => return Err(PilotError::Daemon(message)),
            other => return Err(PilotError::Daemon(format!("unexpected response: {:?}", other))),
        },
        None => HaltLatch::new(&config.state_dir).clear()?,
    };

    if cleared {
        println!("{} Halt cleared, automatic processing resumed", "[OK]".green().bold());
    } else {
        println!("Not halted.");
    }
    Ok(())
}
