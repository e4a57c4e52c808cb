//! The transaction worker.
//!
//! Requests are queued on an unbounded channel and processed one at a time by
//! a single tokio task, so at most one transaction is ever past `Received`.
//! Policy reloads and operator rollbacks travel through the same queue and
//! therefore always run between transactions.

use super::{ApplyResult, HaltLatch, Transaction, TransactionJournal, TxState};
use crate::config::Config;
use crate::error::{FailureKind, FailureReason, PilotError, Result};
use crate::executor::CommandExecutor;
use crate::health::{HealthMonitor, HealthSample, HealthVerdict};
use crate::policy::{CommandClass, SafetyPolicy};
use crate::request::{ChangeRequest, Payload};
use crate::snapshot::store::TreeScanner;
use crate::snapshot::SnapshotStore;
use crate::toolchain::{is_switch_command, GenerationLog, ToolOutcome, Toolchain};
use crate::validator::{StagedTree, ValidationResult, Validator};
use chrono::{DateTime, Utc};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What the worker is doing right now
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub tx_id: String,
    pub state: TxState,
    pub description: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyReload {
    pub old_digest: String,
    pub new_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target")]
pub enum RollbackTarget {
    /// The generation activated before the current one
    Generation,
    /// An arbitrary snapshot, bypassing validation
    Backup { id: String, activate: bool },
}

/// Outcome of an operator rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub snapshot_id: String,
    pub generation: Option<u64>,
    pub activated: bool,
}

/// Everything one transaction needs, owned by the worker
pub struct Engine {
    config_root: PathBuf,
    executor: Arc<CommandExecutor>,
    toolchain: Arc<dyn Toolchain>,
    health: Arc<HealthMonitor>,
    snapshots: Arc<SnapshotStore>,
    scanner: TreeScanner,
    journal: TransactionJournal,
    generations: GenerationLog,
    halt: HaltLatch,
    build_timeout: Duration,
    command_timeout: Duration,
    activate_timeout: Duration,
    progress: watch::Sender<Option<Progress>>,
    // Held for the engine's lifetime so one process mutates the tree at a time
    _lock: Flock<File>,
}

/// Take the exclusive, non-blocking lock on `<state_dir>/nixpilot.lock`
pub fn lock_state_dir(state_dir: &Path) -> Result<Flock<File>> {
    fs::create_dir_all(state_dir)?;
    let path = state_dir.join("nixpilot.lock");
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?;
    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
        PilotError::Locked(format!(
            "{} is held by another nixpilot process ({})",
            path.display(),
            errno
        ))
    })
}

impl Engine {
    pub fn new(
        config: &Config,
        executor: Arc<CommandExecutor>,
        toolchain: Arc<dyn Toolchain>,
        health: Arc<HealthMonitor>,
        snapshots: Arc<SnapshotStore>,
    ) -> Result<Self> {
        let lock = lock_state_dir(&config.state_dir)?;
        let (progress, _) = watch::channel(None);
        Ok(Self {
            config_root: config.config_root.clone(),
            scanner: TreeScanner::new(config.config_root.clone(), &config.snapshot_excludes)?,
            journal: TransactionJournal::new(&config.state_dir),
            generations: GenerationLog::new(&config.state_dir),
            halt: HaltLatch::new(&config.state_dir),
            build_timeout: config.build_timeout(),
            command_timeout: config.command_timeout(),
            activate_timeout: config.activate_timeout(),
            executor,
            toolchain,
            health,
            snapshots,
            progress,
            _lock: lock,
        })
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    pub fn policy(&self) -> Arc<SafetyPolicy> {
        self.executor.policy()
    }

    pub fn journal(&self) -> &TransactionJournal {
        &self.journal
    }

    pub fn generations(&self) -> &GenerationLog {
        &self.generations
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn halt_latch(&self) -> &HaltLatch {
        &self.halt
    }

    fn validator(&self) -> Validator {
        Validator::new(
            self.executor.policy(),
            Arc::clone(&self.toolchain),
            self.scanner.clone(),
            self.build_timeout,
        )
    }

    /// Run one transaction to a terminal state and journal it
    pub async fn process(
        &self,
        tx_id: String,
        request: ChangeRequest,
        cancel: &mut watch::Receiver<bool>,
    ) -> Transaction {
        let mut tx = Transaction::new(tx_id, request);
        tracing::info!(tx_id = %tx.id, request = %tx.request.describe(), "transaction received");
        self.publish(&tx);

        if let Err(e) = self.drive(&mut tx, cancel).await {
            self.recover(&mut tx, e).await;
        }

        if let Some(snapshot_id) = &tx.snapshot_id {
            if let Err(e) = self.snapshots.unpin(snapshot_id) {
                tracing::warn!(tx_id = %tx.id, snapshot_id = %snapshot_id, error = %e, "failed to unpin snapshot");
            }
        }
        self.progress.send_replace(None);

        if let Err(e) = self.journal.append(&tx) {
            tracing::error!(tx_id = %tx.id, error = %e, "failed to journal transaction");
        }
        tracing::info!(
            tx_id = %tx.id,
            state = %tx.state,
            reasons = ?tx.reasons.iter().map(|r| r.kind).collect::<Vec<_>>(),
            "transaction finished"
        );
        tx
    }

    async fn drive(&self, tx: &mut Transaction, cancel: &mut watch::Receiver<bool>) -> Result<()> {
        if let Some(reason) = self.halt.reason()? {
            return tx.reject(vec![FailureReason::new(FailureKind::Halted, reason)]);
        }
        if self.cancel_requested(tx, cancel)? {
            return Ok(());
        }

        self.step(tx, TxState::Validating)?;
        let validator = self.validator();
        let (result, staged) = validator.validate_cheap(&tx.request).await?;
        if !result.ok {
            return tx.reject(result.reasons);
        }
        if self.cancel_requested(tx, cancel)? {
            return Ok(());
        }

        let snapshot = self
            .snapshots
            .create(&format!("pre {}", tx.request.describe()), Some(&tx.id))?;
        self.snapshots.pin(&snapshot.id)?;
        tx.snapshot_id = Some(snapshot.id);
        self.step(tx, TxState::Staged)?;
        if self.cancel_requested(tx, cancel)? {
            return Ok(());
        }

        self.step(tx, TxState::BuildTesting)?;
        let build = match &staged {
            Some(staged) => {
                tokio::select! {
                    result = validator.build_test(staged) => result?,
                    _ = cancelled(cancel) => {
                        return tx.reject(vec![cancelled_reason(TxState::BuildTesting)]);
                    }
                }
            }
            None => ValidationResult::pass(),
        };
        tx.build_result = Some(build.clone());
        if !build.ok {
            return tx.reject(build.reasons);
        }
        if self.cancel_requested(tx, cancel)? {
            return Ok(());
        }

        let baseline = if self.needs_observation(&tx.request) {
            Some(self.health.baseline().await)
        } else {
            None
        };

        self.step(tx, TxState::Applying)?;
        let applied = self.apply(&tx.request, staged.as_ref()).await;
        let ok = applied.ok;
        let message = applied.message.clone();
        tx.apply_result = Some(applied);
        if !ok {
            tx.reasons.push(FailureReason::new(
                FailureKind::ApplyFailed,
                message.unwrap_or_else(|| "activation failed".to_string()),
            ));
            self.step(tx, TxState::ApplyFailed)?;
            return self.roll_back(tx).await;
        }

        self.step(tx, TxState::Applied)?;
        self.step(tx, TxState::Monitoring)?;
        let verdict = match &baseline {
            Some(baseline) => self.observe(tx, baseline).await,
            None => HealthVerdict::Healthy,
        };
        tx.health_verdict = Some(verdict.clone());

        match verdict {
            HealthVerdict::Healthy => {
                self.record_commit(tx);
                tx.transition(TxState::Committed)
            }
            HealthVerdict::Regression(why) => {
                tx.reasons.push(FailureReason::new(FailureKind::HealthRegression, why));
                self.roll_back(tx).await
            }
        }
    }

    async fn observe(&self, tx: &Transaction, baseline: &HealthSample) -> HealthVerdict {
        tracing::info!(tx_id = %tx.id, "observing system health");
        self.health.observe(baseline).await
    }

    /// Make the validated change live
    async fn apply(&self, request: &ChangeRequest, staged: Option<&StagedTree>) -> ApplyResult {
        match &request.payload {
            Payload::Patch { .. } => {
                let Some(staged) = staged else {
                    return apply_failure("no staged tree for patch".to_string(), None);
                };
                if let Err(e) = staged.apply_to_live() {
                    return apply_failure(format!("writing staged files failed: {}", e), None);
                }
                match self.toolchain.activate(&self.config_root).await {
                    Ok(ToolOutcome::Ok) => ApplyResult {
                        ok: true,
                        message: None,
                        execution: None,
                    },
                    Ok(outcome) => apply_failure(outcome.message().to_string(), None),
                    Err(e) => apply_failure(e.to_string(), None),
                }
            }
            Payload::Command { argv, confirmed } => {
                let timeout = if is_switch_command(argv) {
                    self.activate_timeout
                } else {
                    self.command_timeout
                };
                match self.executor.run(argv, timeout, *confirmed).await {
                    Ok(execution) if execution.success() => ApplyResult {
                        ok: true,
                        message: None,
                        execution: Some(execution),
                    },
                    Ok(execution) => {
                        let message = if execution.timed_out() {
                            format!("timed out after {}s", execution.timeout_secs)
                        } else {
                            format!(
                                "exit code {}: {}",
                                execution.exit_code.map_or("none".to_string(), |c| c.to_string()),
                                execution.error_tail(5)
                            )
                        };
                        apply_failure(message, Some(execution))
                    }
                    Err(e) => apply_failure(e.to_string(), None),
                }
            }
            Payload::Declined { message } => apply_failure(message.clone(), None),
        }
    }

    /// Restore the pre-transaction snapshot. A failure here latches the halt.
    async fn roll_back(&self, tx: &mut Transaction) -> Result<()> {
        let outcome = match tx.snapshot_id.clone() {
            Some(snapshot_id) => {
                tracing::warn!(tx_id = %tx.id, snapshot_id = %snapshot_id, "rolling back");
                self.restore_and_activate(&snapshot_id, self.activates(&tx.request))
                    .await
            }
            None => Err(PilotError::Snapshot("transaction has no snapshot".to_string())),
        };

        match outcome {
            Ok(()) => tx.transition(TxState::RolledBack),
            Err(e) => {
                let reason = format!("rollback of transaction {} failed: {}", tx.id, e);
                tracing::error!(tx_id = %tx.id, error = %e, "ROLLBACK FAILED, system may be inconsistent");
                self.halt.set(&reason)?;
                tx.reasons.push(FailureReason::new(FailureKind::Halted, reason));
                tx.transition(TxState::RollbackFailed)
            }
        }
    }

    /// Errors escaping `drive` terminate the transaction by where it stood
    async fn recover(&self, tx: &mut Transaction, err: PilotError) {
        tracing::error!(tx_id = %tx.id, state = %tx.state, error = %err, "transaction step errored");
        let result = match tx.state {
            state if state.is_cancellable() => {
                tx.reject(vec![FailureReason::new(FailureKind::Internal, err.to_string())])
            }
            TxState::Applying | TxState::Applied | TxState::Monitoring => {
                tx.reasons.push(FailureReason::new(FailureKind::ApplyFailed, err.to_string()));
                let moved = match tx.state {
                    TxState::Applying => tx.transition(TxState::ApplyFailed),
                    TxState::Applied => tx.transition(TxState::Monitoring),
                    _ => Ok(()),
                };
                match moved {
                    Ok(()) => self.roll_back(tx).await,
                    Err(e) => Err(e),
                }
            }
            TxState::ApplyFailed => self.roll_back(tx).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::error!(tx_id = %tx.id, error = %e, "could not settle transaction");
            if !tx.is_terminal() {
                if let Err(e) = self.halt.set(&format!("transaction {} left in {}: {}", tx.id, tx.state, e)) {
                    tracing::error!(error = %e, "failed to write halt latch");
                }
            }
        }
    }

    /// Mark the committed tree as baseline and record its generation.
    /// Bookkeeping failures are logged; the change itself is already live.
    fn record_commit(&self, tx: &Transaction) {
        if !self.activates(&tx.request) {
            return;
        }
        let result = (|| -> Result<()> {
            if self.generations.current()?.is_none() {
                if let Some(pre) = &tx.snapshot_id {
                    self.generations.record(pre, None)?;
                }
            }
            let post = self
                .snapshots
                .create(&format!("committed {}", tx.request.describe()), Some(&tx.id))?;
            self.snapshots.set_baseline(&post.id)?;
            self.generations.record(&post.id, Some(&tx.id))?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::error!(tx_id = %tx.id, error = %e, "commit bookkeeping failed");
        }
    }

    async fn restore_and_activate(&self, snapshot_id: &str, activate: bool) -> Result<()> {
        self.snapshots.restore(snapshot_id)?;
        if !activate {
            return Ok(());
        }
        match tokio::time::timeout(self.activate_timeout, self.toolchain.activate(&self.config_root)).await {
            Ok(outcome) => match outcome? {
                ToolOutcome::Ok => Ok(()),
                other => Err(PilotError::Toolchain(format!(
                    "reactivation failed: {}",
                    other.message()
                ))),
            },
            Err(_) => Err(PilotError::Toolchain(format!(
                "reactivation exceeded {}s",
                self.activate_timeout.as_secs()
            ))),
        }
    }

    /// Operator rollback, run between transactions
    pub async fn rollback(&self, target: RollbackTarget) -> Result<RollbackReport> {
        match target {
            RollbackTarget::Generation => {
                let previous = self.generations.previous()?;
                tracing::warn!(
                    generation = previous.number,
                    snapshot_id = %previous.snapshot_id,
                    "rolling back to previous generation"
                );
                self.restore_and_activate(&previous.snapshot_id, true).await?;
                self.generations.discard_current()?;
                self.snapshots.set_baseline(&previous.snapshot_id)?;
                Ok(RollbackReport {
                    snapshot_id: previous.snapshot_id,
                    generation: Some(previous.number),
                    activated: true,
                })
            }
            RollbackTarget::Backup { id, activate } => {
                let snapshot = self.snapshots.resolve(&id)?;
                tracing::warn!(snapshot_id = %snapshot.id, activate, "forced restore");
                self.restore_and_activate(&snapshot.id, activate).await?;
                Ok(RollbackReport {
                    snapshot_id: snapshot.id,
                    generation: None,
                    activated: activate,
                })
            }
        }
    }

    /// Swap the policy used by validation and execution
    pub fn swap_policy(&self, policy: Arc<SafetyPolicy>) -> PolicyReload {
        let old_digest = self.executor.policy().digest().to_string();
        let new_digest = policy.digest().to_string();
        self.executor.set_policy(policy);
        tracing::warn!(old_digest = %old_digest, new_digest = %new_digest, "safety policy reloaded");
        PolicyReload { old_digest, new_digest }
    }

    /// Patches and switch commands change the running system
    fn activates(&self, request: &ChangeRequest) -> bool {
        match &request.payload {
            Payload::Patch { .. } => true,
            Payload::Command { argv, .. } => is_switch_command(argv),
            Payload::Declined { .. } => false,
        }
    }

    /// Read-only commands skip the observation window
    fn needs_observation(&self, request: &ChangeRequest) -> bool {
        match &request.payload {
            Payload::Command { argv, .. } => {
                self.executor.policy().evaluate_command(argv).class != CommandClass::Safe
            }
            _ => true,
        }
    }

    fn step(&self, tx: &mut Transaction, state: TxState) -> Result<()> {
        tx.transition(state)?;
        self.publish(tx);
        Ok(())
    }

    fn publish(&self, tx: &Transaction) {
        self.progress.send_replace(Some(Progress {
            tx_id: tx.id.clone(),
            state: tx.state,
            description: tx.request.describe(),
            started_at: tx.started_at,
        }));
    }

    fn cancel_requested(&self, tx: &mut Transaction, cancel: &watch::Receiver<bool>) -> Result<bool> {
        if !*cancel.borrow() {
            return Ok(false);
        }
        let state = tx.state;
        tx.reject(vec![cancelled_reason(state)])?;
        Ok(true)
    }
}

fn apply_failure(message: String, execution: Option<crate::executor::CommandExecution>) -> ApplyResult {
    ApplyResult {
        ok: false,
        message: Some(message),
        execution,
    }
}

fn cancelled_reason(state: TxState) -> FailureReason {
    FailureReason::new(FailureKind::Cancelled, format!("cancelled while {}", state))
}

/// Resolves once cancellation is requested. Never resolves if the
/// submitter went away without cancelling.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

enum Job {
    Apply {
        tx_id: String,
        request: ChangeRequest,
        cancel: watch::Receiver<bool>,
        reply: oneshot::Sender<Transaction>,
    },
    Reload {
        policy: Arc<SafetyPolicy>,
        reply: oneshot::Sender<PolicyReload>,
    },
    Rollback {
        target: RollbackTarget,
        reply: oneshot::Sender<Result<RollbackReport>>,
    },
    Stop,
}

type CancelMap = Arc<Mutex<HashMap<String, watch::Sender<bool>>>>;

fn lock(cancels: &CancelMap) -> MutexGuard<'_, HashMap<String, watch::Sender<bool>>> {
    cancels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A queued transaction
pub struct Submission {
    pub tx_id: String,
    result: oneshot::Receiver<Transaction>,
    cancels: CancelMap,
}

impl Submission {
    pub fn cancel(&self) -> bool {
        match lock(&self.cancels).get(&self.tx_id) {
            Some(sender) => {
                sender.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Wait for the terminal transaction
    pub async fn wait(self) -> Result<Transaction> {
        self.result
            .await
            .map_err(|_| PilotError::Daemon("orchestrator worker stopped".to_string()))
    }
}

/// Handle to the single transaction worker
pub struct Orchestrator {
    engine: Arc<Engine>,
    queue: mpsc::UnboundedSender<Job>,
    cancels: CancelMap,
    progress: watch::Receiver<Option<Progress>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn start(engine: Engine) -> Self {
        let (queue, jobs) = mpsc::unbounded_channel();
        let progress = engine.progress.subscribe();
        let engine = Arc::new(engine);
        let cancels: CancelMap = Arc::new(Mutex::new(HashMap::new()));
        let worker = tokio::spawn(run_worker(Arc::clone(&engine), jobs, Arc::clone(&cancels)));
        Self {
            engine,
            queue,
            cancels,
            progress,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn submit(&self, request: ChangeRequest) -> Result<Submission> {
        let tx_id = Uuid::new_v4().to_string();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (reply, result) = oneshot::channel();
        lock(&self.cancels).insert(tx_id.clone(), cancel_tx);

        self.queue
            .send(Job::Apply {
                tx_id: tx_id.clone(),
                request,
                cancel: cancel_rx,
                reply,
            })
            .map_err(|_| PilotError::Daemon("orchestrator worker stopped".to_string()))?;
        tracing::debug!(tx_id = %tx_id, queued = self.pending(), "transaction queued");

        Ok(Submission {
            tx_id,
            result,
            cancels: Arc::clone(&self.cancels),
        })
    }

    /// Request cancellation by id or unique prefix. Refused once the
    /// transaction is past `BuildTesting`.
    pub fn cancel(&self, tx_id: &str) -> Result<String> {
        let cancels = lock(&self.cancels);
        let matches: Vec<&String> = cancels.keys().filter(|id| id.starts_with(tx_id)).collect();
        let id = match matches.as_slice() {
            [id] => (*id).clone(),
            [] => return Err(PilotError::Daemon(format!("no pending transaction {}", tx_id))),
            _ => return Err(PilotError::Daemon(format!("ambiguous transaction id {}", tx_id))),
        };

        if let Some(current) = self.progress.borrow().as_ref() {
            if current.tx_id == id && !current.state.is_cancellable() {
                return Err(PilotError::Daemon(format!(
                    "transaction {} is {} and cannot be cancelled",
                    id, current.state
                )));
            }
        }
        if let Some(sender) = cancels.get(&id) {
            sender.send_replace(true);
        }
        tracing::info!(tx_id = %id, "cancellation requested");
        Ok(id)
    }

    pub fn progress(&self) -> Option<Progress> {
        self.progress.borrow().clone()
    }

    /// Transactions queued or in flight
    pub fn pending(&self) -> usize {
        lock(&self.cancels).len()
    }

    pub async fn reload_policy(&self, policy: SafetyPolicy) -> Result<PolicyReload> {
        let (reply, result) = oneshot::channel();
        self.queue
            .send(Job::Reload {
                policy: Arc::new(policy),
                reply,
            })
            .map_err(|_| PilotError::Daemon("orchestrator worker stopped".to_string()))?;
        result
            .await
            .map_err(|_| PilotError::Daemon("orchestrator worker stopped".to_string()))
    }

    pub async fn rollback(&self, target: RollbackTarget) -> Result<RollbackReport> {
        let (reply, result) = oneshot::channel();
        self.queue
            .send(Job::Rollback { target, reply })
            .map_err(|_| PilotError::Daemon("orchestrator worker stopped".to_string()))?;
        result
            .await
            .map_err(|_| PilotError::Daemon("orchestrator worker stopped".to_string()))?
    }

    /// Clear the halt latch after operator intervention
    pub fn resume(&self) -> Result<bool> {
        self.engine.halt.clear()
    }

    /// Finish everything queued so far, then stop the worker
    pub async fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(worker) = worker else {
            return;
        };
        if self.queue.send(Job::Stop).is_err() {
            tracing::debug!("orchestrator worker already stopped");
        }
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "orchestrator worker panicked");
        }
    }
}

async fn run_worker(engine: Arc<Engine>, mut jobs: mpsc::UnboundedReceiver<Job>, cancels: CancelMap) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Apply {
                tx_id,
                request,
                mut cancel,
                reply,
            } => {
                let tx = engine.process(tx_id.clone(), request, &mut cancel).await;
                lock(&cancels).remove(&tx_id);
                if reply.send(tx).is_err() {
                    tracing::debug!(tx_id = %tx_id, "submitter went away before the result");
                }
            }
            Job::Reload { policy, reply } => {
                let _ = reply.send(engine.swap_policy(policy));
            }
            Job::Rollback { target, reply } => {
                let _ = reply.send(engine.rollback(target).await);
            }
            Job::Stop => break,
        }
    }
    tracing::debug!("orchestrator worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::health::tests::{fast_config, ScriptedProbe};
    use crate::patch::Patch;
    use crate::policy::PolicyFile;
    use crate::validator::tests::{FakeToolchain, CONFIG, ENABLE_NGINX};
    use std::fs;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        root: PathBuf,
        toolchain: Arc<FakeToolchain>,
        orchestrator: Orchestrator,
    }

    fn harness(toolchain: FakeToolchain, probe: ScriptedProbe) -> Harness {
        harness_with(toolchain, probe, fast_config(), None)
    }

    fn harness_with(
        toolchain: FakeToolchain,
        probe: ScriptedProbe,
        health: HealthConfig,
        policy: Option<PolicyFile>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("etc/app");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("configuration.nix"), CONFIG).unwrap();

        let config = Config {
            config_root: root.clone(),
            state_dir: dir.path().join("state"),
            policy_path: dir.path().join("policy.toml"),
            health: health.clone(),
            ..Default::default()
        };
        let file = policy.unwrap_or_else(|| SafetyPolicy::default_file(&root));
        let policy = SafetyPolicy::from_file(file, &[config.state_dir.clone()]).unwrap();
        let executor = Arc::new(CommandExecutor::new(Arc::new(policy), 4096));
        let snapshots = Arc::new(
            SnapshotStore::open(&root, &config.state_dir, &config.snapshot_excludes).unwrap(),
        );
        let monitor = Arc::new(HealthMonitor::new(Arc::new(probe), health));
        let toolchain = Arc::new(toolchain);
        let engine = Engine::new(
            &config,
            executor,
            toolchain.clone() as Arc<dyn Toolchain>,
            monitor,
            snapshots,
        )
        .unwrap();

        Harness {
            _dir: dir,
            root,
            toolchain,
            orchestrator: Orchestrator::start(engine),
        }
    }

    impl Harness {
        fn patch(&self, text: &str) -> ChangeRequest {
            let mut patch = Patch::parse(text).unwrap();
            patch.bind_base(&self.root).unwrap();
            ChangeRequest::patch(patch, &self.root)
        }

        async fn run(&self, request: ChangeRequest) -> Transaction {
            self.orchestrator.submit(request).unwrap().wait().await.unwrap()
        }

        fn live_config(&self) -> String {
            fs::read_to_string(self.root.join("configuration.nix")).unwrap()
        }

        fn snapshot_count(&self) -> usize {
            self.orchestrator.engine().snapshots().list().unwrap().len()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_a_forbidden_path_rejected() {
        let h = harness(FakeToolchain::default(), ScriptedProbe::healthy());
        let forbidden = h.root.parent().unwrap().join("forbidden/x");
        let text = format!("--- /dev/null\n+++ {}\n@@ -0,0 +1 @@\n+x\n", forbidden.display());
        let request = ChangeRequest::patch(Patch::parse(&text).unwrap(), &h.root);

        let tx = h.run(request).await;
        assert_eq!(tx.state, TxState::Rejected);
        assert_eq!(tx.first_reason(), Some(FailureKind::PathDenied));
        assert!(tx.snapshot_id.is_none());
        assert_eq!(h.snapshot_count(), 0);
        assert!(!forbidden.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_b_build_failure_leaves_tree_untouched() {
        let h = harness(
            FakeToolchain {
                test_fails: true,
                ..Default::default()
            },
            ScriptedProbe::healthy(),
        );
        let tx = h.run(h.patch(ENABLE_NGINX)).await;

        assert_eq!(tx.state, TxState::Rejected);
        assert_eq!(tx.first_reason(), Some(FailureKind::BuildTestFailed));
        assert_eq!(h.live_config(), CONFIG);
        assert_eq!(h.toolchain.activations.load(Ordering::SeqCst), 0);

        // Snapshot retained for audit
        let snapshot_id = tx.snapshot_id.unwrap();
        assert!(h.orchestrator.engine().snapshots().resolve(&snapshot_id).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_c_healthy_patch_commits() {
        let h = harness(FakeToolchain::default(), ScriptedProbe::healthy());
        let tx = h.run(h.patch(ENABLE_NGINX)).await;

        assert_eq!(tx.state, TxState::Committed, "{:?}", tx.reasons);
        assert!(h.live_config().contains("services.nginx.enable = true;"));
        assert_eq!(h.toolchain.activations.load(Ordering::SeqCst), 1);
        assert_eq!(tx.health_verdict, Some(HealthVerdict::Healthy));

        let engine = h.orchestrator.engine();
        let generations = engine.generations().list().unwrap();
        assert_eq!(generations.len(), 2);
        assert_eq!(generations[0].snapshot_id, tx.snapshot_id.clone().unwrap());
        assert_eq!(
            engine.snapshots().baseline().unwrap(),
            Some(generations[1].snapshot_id.clone())
        );

        let journal = engine.journal().load(10).unwrap();
        assert_eq!(journal[0].id, tx.id);
        assert_eq!(journal[0].state, TxState::Committed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_d_regression_rolls_back_exactly() {
        let h = harness(
            FakeToolchain::default(),
            ScriptedProbe::failing_after(3, "nginx.service"),
        );
        let tx = h.run(h.patch(ENABLE_NGINX)).await;

        assert_eq!(tx.state, TxState::RolledBack);
        assert_eq!(tx.first_reason(), Some(FailureKind::HealthRegression));
        assert_eq!(h.live_config(), CONFIG);
        // activate + reactivate
        assert_eq!(h.toolchain.activations.load(Ordering::SeqCst), 2);
        assert!(h.orchestrator.engine().generations().list().unwrap().is_empty());

        let snapshot_id = tx.snapshot_id.unwrap();
        assert!(h.orchestrator.engine().snapshots().matches_tree(&snapshot_id).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_e_no_prior_generation() {
        let h = harness(FakeToolchain::default(), ScriptedProbe::healthy());
        let err = h
            .orchestrator
            .rollback(RollbackTarget::Generation)
            .await
            .unwrap_err();
        assert!(matches!(err, PilotError::NoPriorGeneration));
        assert_eq!(h.live_config(), CONFIG);
        assert_eq!(h.toolchain.activations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_rollback_after_commit() {
        let h = harness(FakeToolchain::default(), ScriptedProbe::healthy());
        assert!(h.run(h.patch(ENABLE_NGINX)).await.committed());

        let report = h.orchestrator.rollback(RollbackTarget::Generation).await.unwrap();
        assert_eq!(report.generation, Some(1));
        assert_eq!(h.live_config(), CONFIG);
        assert_eq!(h.toolchain.activations.load(Ordering::SeqCst), 2);
        assert_eq!(
            h.orchestrator.engine().generations().current().unwrap().unwrap().number,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_failure_rolls_back_and_halts_when_reactivation_fails() {
        let h = harness(
            FakeToolchain {
                activate_fails: true,
                ..Default::default()
            },
            ScriptedProbe::healthy(),
        );
        let tx = h.run(h.patch(ENABLE_NGINX)).await;

        assert_eq!(tx.state, TxState::RollbackFailed);
        assert_eq!(tx.first_reason(), Some(FailureKind::ApplyFailed));
        assert!(tx.reasons.iter().any(|r| r.kind == FailureKind::Halted));
        // The tree itself was restored before reactivation failed
        assert_eq!(h.live_config(), CONFIG);

        let next = h.run(h.patch(ENABLE_NGINX)).await;
        assert_eq!(next.state, TxState::Rejected);
        assert_eq!(next.first_reason(), Some(FailureKind::Halted));

        assert!(h.orchestrator.resume().unwrap());
        assert!(h.orchestrator.engine().halt_latch().check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_queue() {
        let h = harness(FakeToolchain::default(), ScriptedProbe::healthy());
        let submission = h.orchestrator.submit(h.patch(ENABLE_NGINX)).unwrap();
        h.orchestrator.shutdown().await;

        assert!(submission.wait().await.unwrap().committed());
        assert!(h.orchestrator.submit(h.patch(ENABLE_NGINX)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_are_serialized() {
        let h = harness(FakeToolchain::default(), ScriptedProbe::healthy());
        // Both patches are bound to the same base
        let first = h.orchestrator.submit(h.patch(ENABLE_NGINX)).unwrap();
        let second = h.orchestrator.submit(h.patch(ENABLE_NGINX)).unwrap();
        assert_eq!(h.orchestrator.pending(), 2);

        let (first, second) = tokio::join!(first.wait(), second.wait());
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.state, TxState::Committed);
        assert_eq!(second.state, TxState::Rejected);
        assert_eq!(second.first_reason(), Some(FailureKind::StaleBase));
        assert!(first.ended_at.unwrap() <= second.started_at);
        assert_eq!(h.orchestrator.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_build_test() {
        let h = harness(
            FakeToolchain {
                test_delay: Some(Duration::from_secs(600)),
                ..Default::default()
            },
            ScriptedProbe::healthy(),
        );
        let submission = h.orchestrator.submit(h.patch(ENABLE_NGINX)).unwrap();
        while h.orchestrator.progress().map(|p| p.state) != Some(TxState::BuildTesting) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.orchestrator.cancel(&submission.tx_id[..8]).unwrap(), submission.tx_id);

        let tx = submission.wait().await.unwrap();
        assert_eq!(tx.state, TxState::Rejected);
        assert_eq!(tx.first_reason(), Some(FailureKind::Cancelled));
        assert_eq!(h.live_config(), CONFIG);
        assert_eq!(h.toolchain.activations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_processing() {
        let h = harness(FakeToolchain::default(), ScriptedProbe::healthy());
        let submission = h.orchestrator.submit(h.patch(ENABLE_NGINX)).unwrap();
        assert!(submission.cancel());

        let tx = submission.wait().await.unwrap();
        assert_eq!(tx.state, TxState::Rejected);
        assert_eq!(tx.first_reason(), Some(FailureKind::Cancelled));
        assert_eq!(h.snapshot_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_restore_is_idempotent() {
        let h = harness(FakeToolchain::default(), ScriptedProbe::healthy());
        let tx = h.run(h.patch(ENABLE_NGINX)).await;
        let pre = tx.snapshot_id.unwrap();

        for _ in 0..2 {
            let report = h
                .orchestrator
                .rollback(RollbackTarget::Backup {
                    id: pre.clone(),
                    activate: false,
                })
                .await
                .unwrap();
            assert_eq!(report.snapshot_id, pre);
            assert_eq!(h.live_config(), CONFIG);
        }
        assert_eq!(h.toolchain.activations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_applies_to_next_transaction() {
        let h = harness(FakeToolchain::default(), ScriptedProbe::healthy());
        let mut file = SafetyPolicy::default_file(&h.root);
        file.forbidden_path_prefixes.push(h.root.join("configuration.nix"));
        let before = h.orchestrator.engine().policy().digest().to_string();

        let reload = h
            .orchestrator
            .reload_policy(SafetyPolicy::from_file(file, &[]).unwrap())
            .await
            .unwrap();
        assert_eq!(reload.old_digest, before);
        assert_ne!(reload.new_digest, before);

        let tx = h.run(h.patch(ENABLE_NGINX)).await;
        assert_eq!(tx.first_reason(), Some(FailureKind::PathDenied));
    }

    #[tokio::test]
    async fn test_safe_command_skips_observation() {
        let h = harness_with(
            FakeToolchain::default(),
            ScriptedProbe::failing_after(0, "nginx.service"),
            fast_config(),
            None,
        );
        let tx = h.run(ChangeRequest::command(vec!["uname".to_string()], false)).await;

        assert_eq!(tx.state, TxState::Committed, "{:?}", tx.reasons);
        let execution = tx.apply_result.unwrap().execution.unwrap();
        assert_eq!(execution.exit_code, Some(0));
        assert_eq!(h.toolchain.activations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_command_rolls_back() {
        let health = HealthConfig {
            window_secs: 1,
            poll_interval_secs: 1,
            ..Default::default()
        };
        let h = harness_with(FakeToolchain::default(), ScriptedProbe::healthy(), health, None);
        let tx = h.run(ChangeRequest::command(vec!["false".to_string()], true)).await;

        assert_eq!(tx.state, TxState::RolledBack);
        assert_eq!(tx.first_reason(), Some(FailureKind::ApplyFailed));
        assert_eq!(tx.apply_result.unwrap().execution.unwrap().exit_code, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_failure_rolls_back_to_snapshot() {
        let h = harness(
            FakeToolchain {
                activate_fails_once: true,
                ..Default::default()
            },
            ScriptedProbe::healthy(),
        );
        let tx = h.run(h.patch(ENABLE_NGINX)).await;

        assert_eq!(tx.state, TxState::RolledBack, "{:?}", tx.reasons);
        assert_eq!(tx.first_reason(), Some(FailureKind::ApplyFailed));
        assert_eq!(h.live_config(), CONFIG);
        // Patch activation, then the snapshot's reactivation
        assert_eq!(h.toolchain.activations.load(Ordering::SeqCst), 2);
        assert_eq!(h.orchestrator.engine().halt_latch().reason().unwrap(), None);

        let next = h.run(h.patch(ENABLE_NGINX)).await;
        assert_eq!(next.state, TxState::Committed, "{:?}", next.reasons);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_applies_to_patch_targets_without_requested_paths() {
        let h = harness(FakeToolchain::default(), ScriptedProbe::healthy());
        let mut file = SafetyPolicy::default_file(&h.root);
        file.forbidden_path_prefixes.push(h.root.join("configuration.nix"));
        h.orchestrator
            .reload_policy(SafetyPolicy::from_file(file, &[]).unwrap())
            .await
            .unwrap();

        let mut request = h.patch(ENABLE_NGINX);
        request.requested_paths.clear();
        let tx = h.run(request).await;

        assert_eq!(tx.state, TxState::Rejected);
        assert_eq!(tx.first_reason(), Some(FailureKind::PathDenied));
        assert_eq!(h.live_config(), CONFIG);
        assert_eq!(h.toolchain.activations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absolute_escape_never_written_under_system_wide_access() {
        let h = harness(FakeToolchain::default(), ScriptedProbe::healthy());
        let mut file = SafetyPolicy::default_file(&h.root);
        file.system_wide_access = true;
        h.orchestrator
            .reload_policy(SafetyPolicy::from_file(file, &[]).unwrap())
            .await
            .unwrap();

        let text = format!(
            "--- /dev/null\n+++ {}/../escape.nix\n@@ -0,0 +1 @@\n+x\n",
            h.root.display()
        );
        let tx = h.run(h.patch(&text)).await;

        assert_eq!(tx.state, TxState::Rejected);
        assert_eq!(tx.first_reason(), Some(FailureKind::PathDenied));
        assert!(!h.root.parent().unwrap().join("escape.nix").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_dir_lock_held_for_engine_lifetime() {
        let h = harness(FakeToolchain::default(), ScriptedProbe::healthy());
        let state_dir = h._dir.path().join("state");
        assert!(matches!(lock_state_dir(&state_dir), Err(PilotError::Locked(_))));

        let Harness {
            _dir, orchestrator, ..
        } = h;
        orchestrator.shutdown().await;
        drop(orchestrator);
        assert!(lock_state_dir(&state_dir).is_ok());
    }
}
