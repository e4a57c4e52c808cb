use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nixpilot")]
#[command(version)]
#[command(about = "Validated, reversible changes to a NixOS configuration", long_about = None)]
pub struct Cli {
    /// Config file (default: $NIXPILOT_CONFIG or /etc/nixpilot/config.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one change through validation, build test, activation and health watch
    Apply(ApplyArgs),

    /// Restore an earlier state
    Rollback {
        #[command(flatten)]
        target: RollbackArgs,

        /// With --backup, also activate the restored tree
        #[arg(long, requires = "backup")]
        activate: bool,
    },

    /// Inspect and maintain snapshots
    Snapshots {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Show the transaction audit log
    History {
        /// Show command executions instead of transactions
        #[arg(long)]
        executions: bool,

        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Take one health sample
    Health,

    /// Inspect the safety policy
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Run or control the background agent
    Daemon {
        #[command(subcommand)]
        action: Option<DaemonAction>,
    },

    /// Clear the halt latch after a failed rollback was repaired
    Resume,
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Natural-language instruction handed to the patch generator
    pub instruction: Vec<String>,

    /// Apply a unified diff from a file instead of generating one
    #[arg(long, conflicts_with_all = ["instruction", "run"])]
    pub patch: Option<PathBuf>,

    /// Run an imperative command instead of applying a patch
    #[arg(long, num_args = 1.., allow_hyphen_values = true, conflicts_with = "instruction")]
    pub run: Option<Vec<String>>,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Validate and build-test only
    #[arg(long)]
    pub dry_run: bool,

    /// Fail rather than run locally when no daemon answers
    #[arg(long)]
    pub daemon: bool,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct RollbackArgs {
    /// Restore an arbitrary snapshot without validation
    #[arg(long, value_name = "ID")]
    pub backup: Option<String>,

    /// Restore and activate the previously activated generation
    #[arg(long)]
    pub generation: bool,

    /// List snapshots, newest first
    #[arg(long)]
    pub list: bool,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotAction {
    /// List snapshots, newest first
    List,
    /// Capture the current tree
    Create {
        #[arg(short, long, default_value = "manual")]
        label: String,
    },
    /// Unified diff between two snapshots
    Diff { from: String, to: String },
    /// Keep only the newest N snapshots (baseline and pinned ones survive)
    Prune {
        #[arg(short, long)]
        keep: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
pub enum PolicyAction {
    /// Print the effective policy
    Show,
    /// Evaluate paths and a command against the policy
    Check {
        /// Paths to evaluate
        #[arg(short, long)]
        path: Vec<PathBuf>,

        /// Command to classify
        #[arg(long, num_args = 1.., allow_hyphen_values = true)]
        command: Option<Vec<String>>,
    },
}

#[derive(Subcommand, Debug)]
pub enum DaemonAction {
    /// Run in the foreground (default)
    Start,
    Stop,
    Status,
    /// Re-read the policy file between transactions
    Reload,
    /// Cancel a queued or validating transaction
    Cancel { tx_id: String },
}
