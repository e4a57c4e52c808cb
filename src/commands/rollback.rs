use super::{build_engine, open_snapshots, via_daemon};
use crate::cli::RollbackArgs;
use crate::config::Config;
use crate::daemon::{DaemonRequest, DaemonResponse};
use crate::error::{PilotError, Result};
use crate::snapshot::Snapshot;
use crate::toolchain::GenerationLog;
use crate::transaction::{RollbackReport, RollbackTarget};
use crate::ui::create_spinner;
use colored::*;
use std::collections::HashMap;

/// `rollback --list | --generation | --backup <id> [--activate]`
pub async fn rollback(config: &Config, args: RollbackArgs, activate: bool) -> Result<()> {
    if args.list {
        return list_snapshots(config);
    }

    let target = match args.backup {
        Some(id) => RollbackTarget::Backup { id, activate },
        None => RollbackTarget::Generation,
    };

    let report = match via_daemon(config, &DaemonRequest::Rollback { target: target.clone() }).await {
        Some(response) => match response? {
            DaemonResponse::RolledBack { report } => report,
            DaemonResponse::Error { message } => return Err(PilotError::Daemon(message)),
            other => return Err(PilotError::Daemon(format!("unexpected response: {:?}", other))),
        },
        None => {
            let engine = build_engine(config)?;
            let spinner = create_spinner("Restoring...");
            let report = engine.rollback(target).await;
            spinner.finish_and_clear();
            report?
        }
    };

    print_report(&report);
    Ok(())
}

fn print_report(report: &RollbackReport) {
    match report.generation {
        Some(number) => println!(
            "{} Rolled back to generation {} (snapshot {})",
            "[OK]".green().bold(),
            number,
            report.snapshot_id
        ),
        None => println!(
            "{} Restored snapshot {}",
            "[OK]".green().bold(),
            report.snapshot_id
        ),
    }
    if !report.activated {
        println!(
            "  {} Tree restored but not activated. Run `nixos-rebuild switch` or use --activate.",
            "[i]".cyan()
        );
    }
}

fn list_snapshots(config: &Config) -> Result<()> {
    let store = open_snapshots(config)?;
    let snapshots = store.list()?;
    if snapshots.is_empty() {
        println!("No snapshots yet.");
        return Ok(());
    }

    let baseline = store.baseline()?;
    let generations: HashMap<String, u64> = GenerationLog::new(&config.state_dir)
        .list()?
        .into_iter()
        .map(|g| (g.snapshot_id, g.number))
        .collect();

    for snapshot in &snapshots {
        println!("{}", format_snapshot(snapshot, baseline.as_deref(), &generations));
    }
    Ok(())
}

pub(crate) fn format_snapshot(
    snapshot: &Snapshot,
    baseline: Option<&str>,
    generations: &HashMap<String, u64>,
) -> String {
    let mut line = format!(
        "{}  {}  {:<24} {} files",
        snapshot.id.yellow(),
        snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
        snapshot.label,
        snapshot.file_count
    );
    if let Some(number) = generations.get(&snapshot.id) {
        line.push_str(&format!("  gen {}", number).cyan().to_string());
    }
    if baseline == Some(snapshot.id.as_str()) {
        line.push_str(&format!("  {}", "(baseline)".green()));
    }
    line
}
