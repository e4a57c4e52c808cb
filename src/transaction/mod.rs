//! Transactions and their state machine.
//!
//! A `Transaction` is created for each `ChangeRequest` and is only ever
//! mutated by the orchestrator worker through `transition`. Terminal
//! transactions are appended to the journal and never reopened.

pub mod journal;
pub mod orchestrator;

use crate::error::{FailureKind, FailureReason, PilotError, Result};
use crate::executor::CommandExecution;
use crate::health::HealthVerdict;
use crate::request::ChangeRequest;
use crate::validator::ValidationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub use journal::TransactionJournal;
pub use orchestrator::{
    Engine, Orchestrator, PolicyReload, Progress, RollbackReport, RollbackTarget, Submission,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxState {
    Received,
    Validating,
    Rejected,
    Staged,
    BuildTesting,
    Applying,
    ApplyFailed,
    Applied,
    Monitoring,
    Committed,
    RolledBack,
    /// Automatic rollback failed; processing is halted
    RollbackFailed,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Received => "Received",
            TxState::Validating => "Validating",
            TxState::Rejected => "Rejected",
            TxState::Staged => "Staged",
            TxState::BuildTesting => "BuildTesting",
            TxState::Applying => "Applying",
            TxState::ApplyFailed => "ApplyFailed",
            TxState::Applied => "Applied",
            TxState::Monitoring => "Monitoring",
            TxState::Committed => "Committed",
            TxState::RolledBack => "RolledBack",
            TxState::RollbackFailed => "RollbackFailed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxState::Rejected | TxState::Committed | TxState::RolledBack | TxState::RollbackFailed
        )
    }

    /// States that can be left without any effect on the live system
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            TxState::Received | TxState::Validating | TxState::Staged | TxState::BuildTesting
        )
    }

    pub fn can_transition(&self, to: TxState) -> bool {
        use TxState::*;
        matches!(
            (self, to),
            (Received, Validating)
                | (Received, Rejected)
                | (Validating, Rejected)
                | (Validating, Staged)
                | (Staged, BuildTesting)
                | (Staged, Rejected)
                | (BuildTesting, Rejected)
                | (BuildTesting, Applying)
                | (Applying, ApplyFailed)
                | (Applying, Applied)
                | (ApplyFailed, RolledBack)
                | (ApplyFailed, RollbackFailed)
                | (Applied, Monitoring)
                | (Monitoring, Committed)
                | (Monitoring, RolledBack)
                | (Monitoring, RollbackFailed)
        )
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the activation step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub ok: bool,
    pub message: Option<String>,
    /// Present when the request was an imperative command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<CommandExecution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: TxState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub request: ChangeRequest,
    pub state: TxState,
    pub snapshot_id: Option<String>,
    pub build_result: Option<ValidationResult>,
    pub apply_result: Option<ApplyResult>,
    pub health_verdict: Option<HealthVerdict>,
    pub reasons: Vec<FailureReason>,
    pub history: Vec<StateChange>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn new(id: impl Into<String>, request: ChangeRequest) -> Self {
        let started_at = Utc::now();
        Self {
            id: id.into(),
            request,
            state: TxState::Received,
            snapshot_id: None,
            build_result: None,
            apply_result: None,
            health_verdict: None,
            reasons: Vec::new(),
            history: vec![StateChange {
                state: TxState::Received,
                at: started_at,
            }],
            started_at,
            ended_at: None,
        }
    }

    pub fn transition(&mut self, to: TxState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(PilotError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        let at = Utc::now();
        tracing::info!(tx_id = %self.id, from = %self.state, state = %to, "transaction state change");
        self.state = to;
        self.history.push(StateChange { state: to, at });
        if to.is_terminal() {
            self.ended_at = Some(at);
        }
        Ok(())
    }

    /// Record reasons and move to `Rejected`
    pub fn reject(&mut self, reasons: Vec<FailureReason>) -> Result<()> {
        self.reasons.extend(reasons);
        self.transition(TxState::Rejected)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn committed(&self) -> bool {
        self.state == TxState::Committed
    }

    pub fn first_reason(&self) -> Option<FailureKind> {
        self.reasons.first().map(|r| r.kind)
    }
}

/// `<state_dir>/HALTED`: present while automatic processing is stopped
#[derive(Debug, Clone)]
pub struct HaltLatch {
    path: PathBuf,
}

impl HaltLatch {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("HALTED"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reason recorded when the latch was set
    pub fn reason(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(reason) => Ok(Some(reason.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn check(&self) -> Result<()> {
        match self.reason()? {
            Some(reason) => Err(PilotError::Halted(reason)),
            None => Ok(()),
        }
    }

    pub fn set(&self, reason: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("{}\n", reason))?;
        tracing::error!(reason, latch = %self.path.display(), "automatic processing halted");
        Ok(())
    }

    /// Returns whether a latch was cleared
    pub fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::warn!("halt latch cleared by operator");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
