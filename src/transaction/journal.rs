//! Append-only audit log of terminal transactions.
//!
//! One line per transaction: `{checksum}|{json}` where the checksum is the
//! first 8 hex digits of the record's SHA-256. Every append is fsynced. A
//! torn last line (crash mid-append) is skipped when reading.

use super::Transaction;
use crate::error::{PilotError, Result};
use crate::hash::sha256_hex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub struct TransactionJournal {
    path: PathBuf,
}

impl TransactionJournal {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("transactions.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, tx: &Transaction) -> Result<()> {
        if !tx.is_terminal() {
            return Err(PilotError::InvalidTransition {
                from: tx.state.to_string(),
                to: "journal".to_string(),
            });
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string(tx)?;
        let checksum = &sha256_hex(json.as_bytes())[..8];
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}|{}", checksum, json)?;
        file.flush()?;
        file.sync_all()?;

        tracing::debug!(tx_id = %tx.id, state = %tx.state, "transaction journaled");
        Ok(())
    }

    /// Terminal transactions, newest first
    pub fn load(&self, limit: usize) -> Result<Vec<Transaction>> {
        let mut all = self.read_all()?;
        all.reverse();
        all.truncate(limit);
        Ok(all)
    }

    pub fn find(&self, id: &str) -> Result<Option<Transaction>> {
        Ok(self
            .read_all()?
            .into_iter()
            .rev()
            .find(|tx| tx.id == id || tx.id.starts_with(id)))
    }

    fn read_all(&self) -> Result<Vec<Transaction>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let Some((checksum, json)) = line.split_once('|') else {
                tracing::warn!(line = line_num + 1, "malformed journal line");
                continue;
            };
            if sha256_hex(json.as_bytes())[..8] != *checksum {
                tracing::warn!(line = line_num + 1, "journal checksum mismatch, skipping record");
                continue;
            }
            match serde_json::from_str::<Transaction>(json) {
                Ok(tx) => records.push(tx),
                Err(e) => tracing::warn!(line = line_num + 1, error = %e, "unreadable journal record"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureKind, FailureReason};
    use crate::request::ChangeRequest;
    use crate::transaction::TxState;

    fn rejected(id: &str) -> Transaction {
        let mut tx = Transaction::new(id, ChangeRequest::command(vec!["reboot".to_string()], false));
        tx.transition(TxState::Validating).unwrap();
        tx.reject(vec![FailureReason::new(FailureKind::CommandForbidden, "reboot")])
            .unwrap();
        tx
    }

    #[test]
    fn test_append_and_load_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TransactionJournal::new(dir.path());
        assert!(journal.load(10).unwrap().is_empty());

        journal.append(&rejected("tx-a")).unwrap();
        journal.append(&rejected("tx-b")).unwrap();

        let loaded = journal.load(10).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "tx-b");
        assert_eq!(loaded[1].reasons[0].kind, FailureKind::CommandForbidden);
        assert_eq!(journal.load(1).unwrap().len(), 1);
        assert_eq!(journal.find("tx-a").unwrap().unwrap().id, "tx-a");
    }

    #[test]
    fn test_non_terminal_transaction_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TransactionJournal::new(dir.path());
        let tx = Transaction::new("tx-open", ChangeRequest::command(vec!["ls".to_string()], false));
        assert!(journal.append(&tx).is_err());
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TransactionJournal::new(dir.path());
        journal.append(&rejected("tx-a")).unwrap();

        let mut file = OpenOptions::new().append(true).open(journal.path()).unwrap();
        write!(file, "deadbeef|{{\"id\":\"tx-").unwrap();

        let loaded = journal.load(10).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "tx-a");
    }
}
