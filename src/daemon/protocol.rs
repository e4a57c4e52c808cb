use crate::request::ChangeRequest;
use crate::transaction::{Progress, RollbackReport, RollbackTarget, Transaction};
use serde::{Deserialize, Serialize};

/// Requests sent to the daemon, one JSON object per line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonRequest {
    /// Queue a change request. With `wait`, the reply is the terminal
    /// transaction instead of an acknowledgement.
    Submit { request: ChangeRequest, wait: bool },
    Status,
    Cancel { tx_id: String },
    /// Re-read the policy file and swap it in between transactions
    Reload,
    /// Clear the halt latch
    Resume,
    Rollback { target: RollbackTarget },
    Ping,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum DaemonResponse {
    Accepted {
        tx_id: String,
    },
    Finished {
        transaction: Box<Transaction>,
    },
    Status {
        current: Option<Progress>,
        pending: usize,
        halted: Option<String>,
    },
    Cancelling {
        tx_id: String,
    },
    Reloaded {
        old_digest: String,
        new_digest: String,
    },
    Resumed {
        cleared: bool,
    },
    RolledBack {
        report: RollbackReport,
    },
    Pong {
        uptime_seconds: u64,
        pending: usize,
    },
    Error {
        message: String,
    },
    ShuttingDown,
}

impl DaemonRequest {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl DaemonResponse {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_request_serialization() {
        let request = DaemonRequest::Submit {
            request: ChangeRequest::command(vec!["uname".to_string(), "-a".to_string()], false),
            wait: true,
        };

        let json = request.to_json().unwrap();
        assert!(json.contains("\"type\":\"Submit\""));

        match DaemonRequest::from_json(&json).unwrap() {
            DaemonRequest::Submit { request, wait } => {
                assert!(wait);
                assert_eq!(request.argv().unwrap()[1], "-a");
            }
            _ => panic!("Wrong request type"),
        }
    }

    #[test]
    fn test_rollback_request_wire_format() {
        let json = r#"{"type":"Rollback","target":{"target":"Backup","id":"2026","activate":false}}"#;
        match DaemonRequest::from_json(json).unwrap() {
            DaemonRequest::Rollback {
                target: RollbackTarget::Backup { id, activate },
            } => {
                assert_eq!(id, "2026");
                assert!(!activate);
            }
            _ => panic!("Wrong request type"),
        }
    }

    #[test]
    fn test_response_serialization() {
        let response = DaemonResponse::Status {
            current: None,
            pending: 0,
            halted: Some("restore failed".to_string()),
        };

        let json = response.to_json().unwrap();
        match DaemonResponse::from_json(&json).unwrap() {
            DaemonResponse::Status { pending, halted, .. } => {
                assert_eq!(pending, 0);
                assert_eq!(halted.as_deref(), Some("restore failed"));
            }
            _ => panic!("Wrong response type"),
        }
    }
}
