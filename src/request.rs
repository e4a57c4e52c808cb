use crate::patch::Patch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// What a change request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Patch,
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    /// Structured diff against the configuration tree
    Patch { patch: Patch },
    /// Imperative action. `confirmed` carries the caller's earlier
    /// user confirmation for Restricted commands.
    Command { argv: Vec<String>, confirmed: bool },
    /// The patch generator declined to produce a patch
    Declined { message: String },
}

/// A proposed change. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: String,
    pub kind: RequestKind,
    pub payload: Payload,
    pub requested_paths: Vec<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeRequest {
    fn new(kind: RequestKind, payload: Payload, requested_paths: Vec<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            requested_paths,
            timestamp: Utc::now(),
        }
    }

    /// Patch request; touched paths are resolved against `root`
    pub fn patch(patch: Patch, root: &Path) -> Self {
        let paths = patch.touched_paths(root);
        Self::new(RequestKind::Patch, Payload::Patch { patch }, paths)
    }

    pub fn command(argv: Vec<String>, confirmed: bool) -> Self {
        Self::new(RequestKind::Command, Payload::Command { argv, confirmed }, Vec::new())
    }

    /// Stand-in request for a generator that returned its refusal sentinel
    pub fn declined(message: impl Into<String>, requested_paths: Vec<PathBuf>) -> Self {
        Self::new(
            RequestKind::Patch,
            Payload::Declined {
                message: message.into(),
            },
            requested_paths,
        )
    }

    pub fn patch_payload(&self) -> Option<&Patch> {
        match &self.payload {
            Payload::Patch { patch } => Some(patch),
            _ => None,
        }
    }

    pub fn argv(&self) -> Option<&[String]> {
        match &self.payload {
            Payload::Command { argv, .. } => Some(argv),
            _ => None,
        }
    }

    /// One-line description for logs and history listings
    pub fn describe(&self) -> String {
        match &self.payload {
            Payload::Patch { patch } => patch.summary().to_string(),
            Payload::Command { argv, .. } => format!("$ {}", argv.join(" ")),
            Payload::Declined { message } => format!("declined: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_request() {
        let request = ChangeRequest::command(vec!["ls".to_string(), "-la".to_string()], false);
        assert_eq!(request.kind, RequestKind::Command);
        assert_eq!(request.argv().unwrap(), &["ls".to_string(), "-la".to_string()]);
        assert_eq!(request.describe(), "$ ls -la");
    }

    #[test]
    fn test_patch_request_resolves_paths() {
        let patch = Patch::parse("--- a/x.nix\n+++ b/x.nix\n@@ -1 +1 @@\n-a\n+b\n").unwrap();
        let request = ChangeRequest::patch(patch, Path::new("/etc/nixos"));
        assert_eq!(request.requested_paths, vec![PathBuf::from("/etc/nixos/x.nix")]);
        assert!(request.patch_payload().is_some());
    }

    #[test]
    fn test_request_round_trips_through_json() {
        let request = ChangeRequest::command(vec!["true".to_string()], true);
        let json = serde_json::to_string(&request).unwrap();
        let back: ChangeRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }
}
