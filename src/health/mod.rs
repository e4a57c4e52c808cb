//! Post-apply health observation.
//!
//! A background poller samples the service manager on a fixed interval and
//! publishes each sample on a watch channel; the observer compares every
//! sample to the pre-apply baseline until the window closes.

use crate::config::HealthConfig;
use crate::error::{PilotError, Result};
use crate::executor::CommandExecutor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Consecutive probe errors that count as a regression
const MAX_CONSECUTIVE_PROBE_ERRORS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSample {
    pub taken_at: DateTime<Utc>,
    pub failed_units: BTreeSet<String>,
    /// `NRestarts` per watched unit
    pub restarts: BTreeMap<String, u32>,
}

impl HealthSample {
    pub fn empty() -> Self {
        Self {
            taken_at: Utc::now(),
            failed_units: BTreeSet::new(),
            restarts: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthVerdict {
    Healthy,
    Regression(String),
}

impl HealthVerdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthVerdict::Healthy)
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn sample(&self) -> Result<HealthSample>;
}

/// Reads unit state from `systemctl`
pub struct SystemdProbe {
    executor: Arc<CommandExecutor>,
    watched_units: Vec<String>,
    timeout: Duration,
}

impl SystemdProbe {
    pub fn new(executor: Arc<CommandExecutor>, watched_units: Vec<String>) -> Self {
        Self {
            executor,
            watched_units,
            timeout: Duration::from_secs(10),
        }
    }

    async fn systemctl(&self, args: &[&str]) -> Result<String> {
        let mut argv = vec!["systemctl".to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        let execution = self.executor.run_internal(&argv, None, self.timeout).await?;
        if !execution.success() {
            return Err(PilotError::Execution(format!(
                "{} failed: {}",
                argv.join(" "),
                execution.error_tail(3)
            )));
        }
        Ok(execution.stdout)
    }
}

#[async_trait]
impl HealthProbe for SystemdProbe {
    async fn sample(&self) -> Result<HealthSample> {
        let listing = self
            .systemctl(&[
                "list-units",
                "--type=service",
                "--state=failed",
                "--plain",
                "--no-legend",
                "--no-pager",
            ])
            .await?;

        let counts = try_join_all(
            self.watched_units
                .iter()
                .map(|unit| async move {
                    self.systemctl(&["show", "-p", "NRestarts", "--value", unit.as_str()])
                        .await
                }),
        )
        .await?;
        let restarts: BTreeMap<String, u32> = self
            .watched_units
            .iter()
            .cloned()
            .zip(counts.iter().map(|value| value.trim().parse().unwrap_or(0)))
            .collect();

        Ok(HealthSample {
            taken_at: Utc::now(),
            failed_units: parse_failed_units(&listing),
            restarts,
        })
    }
}

/// First column of `systemctl list-units --plain --no-legend`
pub fn parse_failed_units(listing: &str) -> BTreeSet<String> {
    listing
        .lines()
        .filter_map(|line| line.trim_start().trim_start_matches('●').split_whitespace().next())
        .map(str::to_string)
        .collect()
}

pub struct HealthMonitor {
    probe: Arc<dyn HealthProbe>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, config: HealthConfig) -> Self {
        Self { probe, config }
    }

    pub async fn sample(&self) -> Result<HealthSample> {
        self.probe.sample().await
    }

    /// Pre-apply reference sample. A probe that cannot answer yields an
    /// empty baseline, so every failed unit afterwards counts as new.
    pub async fn baseline(&self) -> HealthSample {
        match self.probe.sample().await {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!(error = %e, "baseline health sample failed");
                HealthSample::empty()
            }
        }
    }

    /// Compare one sample against the baseline
    pub fn judge(&self, baseline: &HealthSample, current: &HealthSample) -> Option<String> {
        let newly_failed: Vec<&str> = current
            .failed_units
            .difference(&baseline.failed_units)
            .filter(|unit| !self.config.ignore_units.contains(*unit))
            .map(String::as_str)
            .collect();
        if !newly_failed.is_empty() {
            return Some(format!("units entered failed state: {}", newly_failed.join(", ")));
        }

        for (unit, count) in &current.restarts {
            let before = baseline.restarts.get(unit).copied().unwrap_or(0);
            let delta = count.saturating_sub(before);
            if delta >= self.config.restart_threshold {
                return Some(format!("{} restarted {} times in the observation window", unit, delta));
            }
        }
        None
    }

    /// Poll for the configured window, stopping early on a regression
    pub async fn observe(&self, baseline: &HealthSample) -> HealthVerdict {
        let (tx, mut rx) = watch::channel::<Option<std::result::Result<HealthSample, String>>>(None);
        let probe = Arc::clone(&self.probe);
        let interval = self.config.poll_interval();

        let poller = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let sample = probe.sample().await.map_err(|e| e.to_string());
                if tx.send(Some(sample)).is_err() {
                    break;
                }
            }
        });

        let deadline = tokio::time::Instant::now() + self.config.window();
        let mut consecutive_errors = 0;
        let verdict = loop {
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Err(_) => break HealthVerdict::Healthy,
                Ok(Err(_)) => break HealthVerdict::Regression("health poller stopped".to_string()),
                Ok(Ok(())) => {}
            }

            let latest = rx.borrow_and_update().clone();
            match latest {
                Some(Ok(sample)) => {
                    consecutive_errors = 0;
                    if let Some(why) = self.judge(baseline, &sample) {
                        break HealthVerdict::Regression(why);
                    }
                }
                Some(Err(e)) => {
                    consecutive_errors += 1;
                    tracing::warn!(error = %e, consecutive_errors, "health probe failed");
                    if consecutive_errors >= MAX_CONSECUTIVE_PROBE_ERRORS {
                        break HealthVerdict::Regression(format!("health probe failing: {}", e));
                    }
                }
                None => {}
            }
        };

        poller.abort();
        tracing::info!(verdict = ?verdict, "observation window closed");
        verdict
    }
}
