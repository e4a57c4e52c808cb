pub mod runner;
pub mod strategy;

use crate::error::{PilotError, Result};
use crate::policy::{CommandClass, SafetyPolicy};
use chrono::{DateTime, Utc};
use runner::{truncate_output, CommandRunner, RawOutput};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub use strategy::{Strategy, StrategyAttempt, StrategyChain, StrategyFailure, StrategyOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Completed,
    TimedOut,
}

/// One finished subprocess, as recorded in the execution history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandExecution {
    pub command: String,
    pub argv: Vec<String>,
    pub classification: CommandClass,
    pub timeout_secs: u64,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub status: ExecutionStatus,
    pub duration_ms: u128,
    pub started_at: DateTime<Utc>,
}

impl CommandExecution {
    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Completed && self.exit_code == Some(0)
    }

    pub fn timed_out(&self) -> bool {
        self.status == ExecutionStatus::TimedOut
    }

    /// Last lines of stderr (or stdout), for failure messages
    pub fn error_tail(&self, lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let collected: Vec<&str> = source.lines().collect();
        let start = collected.len().saturating_sub(lines);
        collected[start..].join("\n")
    }

    fn from_raw(
        argv: &[String],
        classification: CommandClass,
        timeout: Duration,
        started_at: DateTime<Utc>,
        raw: RawOutput,
    ) -> Self {
        Self {
            command: argv.first().cloned().unwrap_or_default(),
            argv: argv.to_vec(),
            classification,
            timeout_secs: timeout.as_secs(),
            exit_code: raw.exit_code,
            stdout: raw.stdout,
            stderr: raw.stderr,
            status: if raw.timed_out {
                ExecutionStatus::TimedOut
            } else {
                ExecutionStatus::Completed
            },
            duration_ms: raw.duration.as_millis(),
            started_at,
        }
    }

    fn truncated(&self, max: usize) -> Self {
        let mut copy = self.clone();
        copy.stdout = truncate_output(&self.stdout, max);
        copy.stderr = truncate_output(&self.stderr, max);
        copy
    }
}

/// Runs classified commands with timeouts and logs every execution.
///
/// Policy-gated `run` serves imperative requests; `run_internal` serves the
/// toolchain's own invocations, which are fixed argv the operator configured.
pub struct CommandExecutor {
    policy: RwLock<Arc<SafetyPolicy>>,
    runner: CommandRunner,
    max_output_bytes: usize,
    history_path: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(policy: Arc<SafetyPolicy>, max_output_bytes: usize) -> Self {
        Self {
            policy: RwLock::new(policy),
            runner: CommandRunner::new(),
            max_output_bytes,
            history_path: None,
        }
    }

    /// Append every execution to a JSON-lines history file
    pub fn with_history(mut self, path: PathBuf) -> Self {
        self.history_path = Some(path);
        self
    }

    pub fn policy(&self) -> Arc<SafetyPolicy> {
        match self.policy.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Swap in a reloaded policy. Callers only do this between transactions.
    pub fn set_policy(&self, policy: Arc<SafetyPolicy>) {
        match self.policy.write() {
            Ok(mut guard) => *guard = policy,
            Err(poisoned) => *poisoned.into_inner() = policy,
        }
    }

    /// Run an imperative command. Forbidden commands are never spawned;
    /// Restricted ones need `confirmed`.
    pub async fn run(
        &self,
        argv: &[String],
        timeout: Duration,
        confirmed: bool,
    ) -> Result<CommandExecution> {
        let verdict = self.policy().evaluate_command(argv);
        match verdict.class {
            CommandClass::Forbidden => {
                tracing::warn!(
                    argv = ?argv,
                    pattern = verdict.matched.as_deref().unwrap_or(""),
                    "refusing forbidden command"
                );
                return Err(PilotError::CommandForbidden(argv.join(" ")));
            }
            CommandClass::Restricted if !confirmed => {
                tracing::warn!(argv = ?argv, "restricted command without confirmation");
                return Err(PilotError::ConfirmationRequired(argv.join(" ")));
            }
            _ => {}
        }

        self.spawn(argv, None, timeout, verdict.class).await
    }

    /// Run a toolchain invocation, bypassing command classification
    pub async fn run_internal(
        &self,
        argv: &[String],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<CommandExecution> {
        self.spawn(argv, cwd, timeout, CommandClass::Restricted).await
    }

    async fn spawn(
        &self,
        argv: &[String],
        cwd: Option<&Path>,
        timeout: Duration,
        classification: CommandClass,
    ) -> Result<CommandExecution> {
        tracing::info!(argv = ?argv, class = classification.as_str(), "executing command");
        let started_at = Utc::now();

        let raw = self.runner.execute(argv, cwd, timeout).await.map_err(|e| {
            tracing::error!(argv = ?argv, error = %e, "failed to spawn command");
            e
        })?;
        let execution = CommandExecution::from_raw(argv, classification, timeout, started_at, raw);

        let logged = execution.truncated(self.max_output_bytes);
        if execution.success() {
            tracing::info!(
                argv = ?argv,
                exit_code = ?execution.exit_code,
                duration_ms = execution.duration_ms as u64,
                stdout = %logged.stdout,
                "command succeeded"
            );
        } else if execution.timed_out() {
            tracing::error!(
                argv = ?argv,
                timeout_secs = execution.timeout_secs,
                stdout = %logged.stdout,
                stderr = %logged.stderr,
                "command timed out, process group terminated"
            );
        } else {
            tracing::error!(
                argv = ?argv,
                exit_code = ?execution.exit_code,
                stderr = %logged.stderr,
                "command failed"
            );
        }

        if let Err(e) = self.record(&logged) {
            tracing::warn!(error = %e, "failed to append execution history");
        }

        Ok(execution)
    }

    fn record(&self, execution: &CommandExecution) -> Result<()> {
        let Some(path) = &self.history_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", serde_json::to_string(execution)?)?;
        Ok(())
    }
}

/// Read the execution history, newest first
pub fn load_history(path: &Path, limit: usize) -> Result<Vec<CommandExecution>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let mut entries: Vec<CommandExecution> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    entries.reverse();
    entries.truncate(limit);
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> CommandExecutor {
        let file = SafetyPolicy::default_file(Path::new("/etc/nixos"));
        let policy = SafetyPolicy::from_file(file, &[]).unwrap();
        CommandExecutor::new(Arc::new(policy), 1024)
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_forbidden_command_is_never_spawned() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let history = dir.path().join("executions.jsonl");
        let executor = executor().with_history(history.clone());

        // Would create the marker if it ever ran
        let cmd = format!("touch {}; reboot", marker.display());
        let result = executor
            .run(&argv(&["sh", "-c", &cmd]), Duration::from_secs(5), true)
            .await;

        assert!(matches!(result, Err(PilotError::CommandForbidden(_))));
        assert!(!marker.exists());
        assert!(!history.exists());
    }

    #[tokio::test]
    async fn test_restricted_requires_confirmation() {
        let executor = executor();
        let result = executor
            .run(&argv(&["true"]), Duration::from_secs(5), false)
            .await;
        assert!(matches!(result, Err(PilotError::ConfirmationRequired(_))));

        let execution = executor
            .run(&argv(&["true"]), Duration::from_secs(5), true)
            .await
            .unwrap();
        assert!(execution.success());
        assert_eq!(execution.classification, CommandClass::Restricted);
    }

    #[tokio::test]
    async fn test_safe_command_runs_unconfirmed() {
        let executor = executor();
        let execution = executor
            .run(&argv(&["uname"]), Duration::from_secs(5), false)
            .await
            .unwrap();
        assert!(execution.success());
        assert_eq!(execution.classification, CommandClass::Safe);
    }

    #[tokio::test]
    async fn test_timeout_marks_execution() {
        let executor = executor();
        let execution = executor
            .run_internal(&argv(&["sleep", "10"]), None, Duration::from_millis(300))
            .await
            .unwrap();
        assert!(execution.timed_out());
        assert!(!execution.success());
    }

    #[tokio::test]
    async fn test_history_is_appended_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let history = dir.path().join("executions.jsonl");
        let executor = executor().with_history(history.clone());

        executor
            .run_internal(&argv(&["sh", "-c", "head -c 4000 /dev/zero | tr '\\0' x"]), None, Duration::from_secs(5))
            .await
            .unwrap();
        executor
            .run_internal(&argv(&["true"]), None, Duration::from_secs(5))
            .await
            .unwrap();

        let entries = load_history(&history, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].argv, argv(&["true"]));
        assert!(entries[1].stdout.contains("truncated"));
    }

    #[test]
    fn test_error_tail() {
        let execution = CommandExecution {
            command: "x".to_string(),
            argv: argv(&["x"]),
            classification: CommandClass::Restricted,
            timeout_secs: 1,
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "a\nb\nc\n".to_string(),
            status: ExecutionStatus::Completed,
            duration_ms: 1,
            started_at: Utc::now(),
        };
        assert_eq!(execution.error_tail(2), "b\nc");
    }
}
