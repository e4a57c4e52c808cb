//! The system materialization toolchain: syntax check, build test, activation.

pub mod generations;

use crate::error::{PilotError, Result};
use crate::executor::{CommandExecutor, Strategy, StrategyChain, StrategyFailure};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use generations::{Generation, GenerationLog};

/// Result of one toolchain operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Ok,
    Failed(String),
    TimedOut(String),
}

impl ToolOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutcome::Ok)
    }

    pub fn message(&self) -> &str {
        match self {
            ToolOutcome::Ok => "",
            ToolOutcome::Failed(m) | ToolOutcome::TimedOut(m) => m,
        }
    }
}

impl From<std::result::Result<(), StrategyFailure>> for ToolOutcome {
    fn from(result: std::result::Result<(), StrategyFailure>) -> Self {
        match result {
            Ok(()) => ToolOutcome::Ok,
            Err(StrategyFailure::TimedOut(m)) => ToolOutcome::TimedOut(m),
            Err(StrategyFailure::Failed(m)) => ToolOutcome::Failed(m),
            Err(StrategyFailure::Unavailable(m)) => {
                ToolOutcome::Failed(format!("no usable toolchain invocation: {}", m))
            }
        }
    }
}

#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Parse-level check of one file, no evaluation or build
    async fn check(&self, file: &Path) -> Result<ToolOutcome>;

    /// Full build of `tree` without activating it
    async fn test(&self, tree: &Path) -> Result<ToolOutcome>;

    /// Make `tree` the live system. Activating a restored tree is the
    /// rollback primitive.
    async fn activate(&self, tree: &Path) -> Result<ToolOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RebuildForm {
    Flake,
    Channel,
}

/// One `nixos-rebuild` invocation style
struct RebuildStrategy {
    name: String,
    form: RebuildForm,
    action: &'static str,
    flake_attr: Option<String>,
    executor: Arc<CommandExecutor>,
    timeout: Duration,
}

impl RebuildStrategy {
    fn argv(&self, tree: &Path) -> Option<Vec<String>> {
        let mut argv = vec!["nixos-rebuild".to_string(), self.action.to_string()];
        match self.form {
            RebuildForm::Flake => {
                let attr = self.flake_attr.as_ref()?;
                argv.push("--flake".to_string());
                argv.push(format!("{}#{}", tree.display(), attr));
            }
            RebuildForm::Channel => {
                argv.push("-I".to_string());
                argv.push(format!("nixos-config={}", tree.join("configuration.nix").display()));
            }
        }
        Some(argv)
    }
}

#[async_trait]
impl Strategy<Path, ()> for RebuildStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self, tree: &Path) -> std::result::Result<(), StrategyFailure> {
        let marker = match self.form {
            RebuildForm::Flake => "flake.nix",
            RebuildForm::Channel => "configuration.nix",
        };
        if !tree.join(marker).exists() {
            return Err(StrategyFailure::Unavailable(format!(
                "{} not found in {}",
                marker,
                tree.display()
            )));
        }
        let argv = self
            .argv(tree)
            .ok_or_else(|| StrategyFailure::Unavailable("no flake attribute configured".to_string()))?;

        run_tool(&self.executor, &argv, Some(tree), self.timeout).await
    }
}

/// Shared mapping from an execution to a strategy result
async fn run_tool(
    executor: &CommandExecutor,
    argv: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
) -> std::result::Result<(), StrategyFailure> {
    match executor.run_internal(argv, cwd, timeout).await {
        Ok(execution) if execution.success() => Ok(()),
        Ok(execution) if execution.timed_out() => Err(StrategyFailure::TimedOut(format!(
            "{} exceeded {}s",
            argv.join(" "),
            timeout.as_secs()
        ))),
        Ok(execution) => Err(StrategyFailure::Failed(format!(
            "{} exited with {:?}: {}",
            argv.join(" "),
            execution.exit_code,
            execution.error_tail(20)
        ))),
        Err(PilotError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StrategyFailure::Unavailable(format!("{} not installed", argv[0])))
        }
        Err(e) => Err(StrategyFailure::Failed(e.to_string())),
    }
}

/// `nix-instantiate` / `nixos-rebuild` backed toolchain
pub struct NixToolchain {
    executor: Arc<CommandExecutor>,
    flake_attr: Option<String>,
    check_timeout: Duration,
    build_timeout: Duration,
    activate_timeout: Duration,
}

impl NixToolchain {
    pub fn new(
        executor: Arc<CommandExecutor>,
        flake_attr: Option<String>,
        check_timeout: Duration,
        build_timeout: Duration,
        activate_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            flake_attr,
            check_timeout,
            build_timeout,
            activate_timeout,
        }
    }

    /// Flake form first when an attribute is configured, then channel form
    fn rebuild_chain(&self, action: &'static str, timeout: Duration) -> StrategyChain<Path, ()> {
        let mut chain = StrategyChain::new(format!("nixos-rebuild {}", action));
        let forms = if self.flake_attr.is_some() {
            vec![RebuildForm::Flake, RebuildForm::Channel]
        } else {
            vec![RebuildForm::Channel]
        };
        for form in forms {
            chain = chain.with(Box::new(RebuildStrategy {
                name: format!("{:?}", form).to_lowercase(),
                form,
                action,
                flake_attr: self.flake_attr.clone(),
                executor: Arc::clone(&self.executor),
                timeout,
            }));
        }
        chain
    }
}

#[async_trait]
impl Toolchain for NixToolchain {
    async fn check(&self, file: &Path) -> Result<ToolOutcome> {
        let argv = vec![
            "nix-instantiate".to_string(),
            "--parse".to_string(),
            file.display().to_string(),
        ];
        let result = run_tool(&self.executor, &argv, None, self.check_timeout).await;
        Ok(result.into())
    }

    async fn test(&self, tree: &Path) -> Result<ToolOutcome> {
        let outcome = self.rebuild_chain("build", self.build_timeout).run(tree).await;
        tracing::info!(attempts = ?outcome.attempts, "build test finished");
        Ok(outcome.result.into())
    }

    async fn activate(&self, tree: &Path) -> Result<ToolOutcome> {
        let outcome = self
            .rebuild_chain("switch", self.activate_timeout)
            .run(tree)
            .await;
        tracing::info!(attempts = ?outcome.attempts, "activation finished");
        Ok(outcome.result.into())
    }
}

/// Whether `argv` asks the toolchain to switch the live system
pub fn is_switch_command(argv: &[String]) -> bool {
    let args: Vec<&str> = argv
        .iter()
        .map(String::as_str)
        .skip_while(|a| *a == "sudo")
        .collect();
    args.first()
        .is_some_and(|p| p.rsplit('/').next() == Some("nixos-rebuild"))
        && args.iter().any(|a| matches!(*a, "switch" | "boot"))
}

/// `.nix` files are syntax-checked; anything else is opaque to the toolchain
pub fn is_checkable(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("nix")
}

/// Absolute path helper used when the tree root is a scratch copy
pub fn relocate(path: &Path, from: &Path, to: &Path) -> Option<PathBuf> {
    path.strip_prefix(from).ok().map(|rel| to.join(rel))
}
