use crate::error::{PilotError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One activated system state, tied to the snapshot it was built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub number: u64,
    pub snapshot_id: String,
    #[serde(default)]
    pub tx_id: Option<String>,
    pub activated_at: DateTime<Utc>,
}

/// `<state_dir>/generations.json`, oldest first
pub struct GenerationLog {
    path: PathBuf,
}

impl GenerationLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("generations.json"),
        }
    }

    pub fn list(&self) -> Result<Vec<Generation>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, generations: &[Generation]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(generations)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn current(&self) -> Result<Option<Generation>> {
        Ok(self.list()?.pop())
    }

    /// Generation before the current one
    pub fn previous(&self) -> Result<Generation> {
        let generations = self.list()?;
        if generations.len() < 2 {
            return Err(PilotError::NoPriorGeneration);
        }
        Ok(generations[generations.len() - 2].clone())
    }

    /// Append a newly activated generation
    pub fn record(&self, snapshot_id: &str, tx_id: Option<&str>) -> Result<Generation> {
        let mut generations = self.list()?;
        let number = generations.last().map(|g| g.number + 1).unwrap_or(1);
        let generation = Generation {
            number,
            snapshot_id: snapshot_id.to_string(),
            tx_id: tx_id.map(str::to_string),
            activated_at: Utc::now(),
        };
        generations.push(generation.clone());
        self.save(&generations)?;

        tracing::info!(generation = number, snapshot_id, "generation recorded");
        Ok(generation)
    }

    /// Drop the current generation once the previous one is live again
    pub fn discard_current(&self) -> Result<Option<Generation>> {
        let mut generations = self.list()?;
        let dropped = generations.pop();
        self.save(&generations)?;
        Ok(dropped)
    }
}
