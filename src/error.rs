use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PilotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid safety policy: {0}")]
    Policy(String),

    #[error("Malformed patch: {0}")]
    PatchParse(String),

    #[error("Patch does not apply to {path}: {message}")]
    PatchApply { path: String, message: String },

    #[error("Snapshot store error: {0}")]
    Snapshot(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Restore left the tree in an unknown state. Halts automatic processing.
    #[error("Restore failed, configuration tree may be inconsistent: {0}")]
    RestoreFailed(String),

    #[error("Command forbidden by safety policy: {0}")]
    CommandForbidden(String),

    #[error("Command requires explicit confirmation: {0}")]
    ConfirmationRequired(String),

    #[error("Command execution failed: {0}")]
    Execution(String),

    #[error("Toolchain error: {0}")]
    Toolchain(String),

    #[error("No prior generation recorded")]
    NoPriorGeneration,

    #[error("Automatic processing halted: {0}")]
    Halted(String),

    #[error("Daemon error: {0}")]
    Daemon(String),

    /// Another process owns the state directory
    #[error("State directory is locked: {0}")]
    Locked(String),

    #[error("Illegal transaction transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("User cancelled")]
    UserCancelled,
}

pub type Result<T> = std::result::Result<T, PilotError>;

/// Typed failure kinds a transaction can terminate with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    PathDenied,
    StaleBase,
    SyntaxInvalid,
    CommandForbidden,
    BuildTestFailed,
    ApplyFailed,
    HealthRegression,
    TimedOut,
    GenerationDeclined,
    Cancelled,
    Halted,
    NoPriorGeneration,
    /// Unexpected I/O or store error before anything live was touched
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::PathDenied => "PathDenied",
            FailureKind::StaleBase => "StaleBase",
            FailureKind::SyntaxInvalid => "SyntaxInvalid",
            FailureKind::CommandForbidden => "CommandForbidden",
            FailureKind::BuildTestFailed => "BuildTestFailed",
            FailureKind::ApplyFailed => "ApplyFailed",
            FailureKind::HealthRegression => "HealthRegression",
            FailureKind::TimedOut => "TimedOut",
            FailureKind::GenerationDeclined => "GenerationDeclined",
            FailureKind::Cancelled => "Cancelled",
            FailureKind::Halted => "Halted",
            FailureKind::NoPriorGeneration => "NoPriorGeneration",
            FailureKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure kind plus the human-readable detail behind it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_display() {
        let reason = FailureReason::new(FailureKind::StaleBase, "configuration.nix changed");
        assert_eq!(reason.to_string(), "StaleBase: configuration.nix changed");
    }

    #[test]
    fn test_failure_kind_serialization() {
        let json = serde_json::to_string(&FailureKind::PathDenied).unwrap();
        assert_eq!(json, "\"PathDenied\"");
    }
}
