pub mod apply;
pub mod daemon;
pub mod inspect;
pub mod rollback;

use crate::config::Config;
use crate::daemon::{DaemonClient, DaemonRequest, DaemonResponse};
use crate::error::Result;
use crate::executor::CommandExecutor;
use crate::health::{HealthMonitor, SystemdProbe};
use crate::policy::SafetyPolicy;
use crate::snapshot::store::TreeScanner;
use crate::snapshot::SnapshotStore;
use crate::toolchain::{NixToolchain, Toolchain};
use crate::transaction::{Engine, Transaction, TxState};
use crate::validator::Validator;
use crate::ui::state_label;
use colored::*;
use std::sync::Arc;

pub use apply::apply;
pub use daemon::{daemon_cancel, daemon_reload, daemon_status, start_daemon, stop_daemon};
pub use inspect::{health, history, policy_check, policy_show, resume, snapshots};
pub use rollback::rollback;

pub fn load_policy(config: &Config) -> Result<SafetyPolicy> {
    SafetyPolicy::load(&config.policy_path, &config.config_root, &config.state_dir)
}

pub fn executor(config: &Config, policy: SafetyPolicy) -> Arc<CommandExecutor> {
    Arc::new(
        CommandExecutor::new(Arc::new(policy), config.max_output_bytes)
            .with_history(config.state_dir.join("executions.jsonl")),
    )
}

pub fn open_snapshots(config: &Config) -> Result<SnapshotStore> {
    SnapshotStore::open(&config.config_root, &config.state_dir, &config.snapshot_excludes)
}

fn toolchain(config: &Config, executor: &Arc<CommandExecutor>) -> Arc<dyn Toolchain> {
    Arc::new(NixToolchain::new(
        Arc::clone(executor),
        config.flake_attr.clone(),
        config.check_timeout(),
        config.build_timeout(),
        config.activate_timeout(),
    ))
}

/// Wire the real collaborators together. Takes the state directory lock.
pub fn build_engine(config: &Config) -> Result<Engine> {
    std::fs::create_dir_all(&config.state_dir)?;
    let executor = executor(config, load_policy(config)?);

    let toolchain = toolchain(config, &executor);
    let probe = SystemdProbe::new(Arc::clone(&executor), config.health.watched_units.clone());
    let health = Arc::new(HealthMonitor::new(Arc::new(probe), config.health.clone()));
    let snapshots = Arc::new(open_snapshots(config)?);

    Engine::new(config, executor, toolchain, health, snapshots)
}

/// Validation only, for dry runs. Needs no lock since nothing is mutated.
pub fn build_validator(config: &Config, policy: SafetyPolicy) -> Result<Validator> {
    std::fs::create_dir_all(&config.state_dir)?;
    let executor = executor(config, policy);
    let scanner = TreeScanner::new(config.config_root.clone(), &config.snapshot_excludes)?;
    Ok(Validator::new(
        executor.policy(),
        toolchain(config, &executor),
        scanner,
        config.build_timeout(),
    ))
}

/// Send through the daemon when its socket answers. `None` means no daemon.
pub async fn via_daemon(config: &Config, request: &DaemonRequest) -> Option<Result<DaemonResponse>> {
    let client = DaemonClient::new(config.socket_path());
    if !client.is_running() {
        return None;
    }
    match client.send_request(request).await {
        Ok(response) => Some(Ok(response)),
        Err(e) => {
            tracing::debug!(error = %e, "daemon socket present but not answering");
            None
        }
    }
}

pub fn print_transaction(tx: &Transaction) {
    println!(
        "{} {}  {}",
        state_label(tx.state),
        tx.id.dimmed(),
        tx.request.describe()
    );
    if let Some(snapshot_id) = &tx.snapshot_id {
        println!("  Snapshot: {}", snapshot_id);
    }
    if let Some(apply) = &tx.apply_result {
        if let Some(execution) = &apply.execution {
            let output = execution.stdout.trim_end();
            if !output.is_empty() {
                println!("{}", output);
            }
        }
    }
    for reason in &tx.reasons {
        println!("  {} {}", format!("{}:", reason.kind).red().bold(), reason.message);
    }
    if tx.state == TxState::RollbackFailed {
        eprintln!(
            "\n{} Automatic processing is halted. Repair the tree, then run `nixpilot resume`.",
            "[!!!]".red().bold()
        );
    }
}
