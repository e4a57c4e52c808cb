use crate::error::{PilotError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/nixpilot/config.toml";

/// nixpilot settings
///
/// Looked up from `--config`, then `$NIXPILOT_CONFIG`, then the user's
/// `nixpilot/config.toml` if present, then `/etc/nixpilot/config.toml`.
/// A missing file means defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Declarative configuration tree
    #[serde(default = "default_config_root")]
    pub config_root: PathBuf,

    /// Snapshots, audit logs, generation records, halt latch
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_policy_path")]
    pub policy_path: PathBuf,

    /// Flake output name (`#desktop`). Channel-style rebuilds when unset.
    #[serde(default)]
    pub flake_attr: Option<String>,

    /// Glob patterns (relative to `config_root`) left out of snapshots
    #[serde(default = "default_snapshot_excludes")]
    pub snapshot_excludes: Vec<String>,

    /// Snapshots kept by `prune`
    #[serde(default = "default_retention_keep")]
    pub retention_keep: usize,

    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,

    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    #[serde(default = "default_activate_timeout")]
    pub activate_timeout_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Per-stream cap on captured output kept in logs
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub generator: GeneratorConfig,
}

/// Post-apply observation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_window")]
    pub window_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Restarts of a watched unit within the window that count as a crash loop
    #[serde(default = "default_restart_threshold")]
    pub restart_threshold: u32,

    #[serde(default)]
    pub watched_units: Vec<String>,

    /// Units whose failure never counts as a regression
    #[serde(default)]
    pub ignore_units: Vec<String>,
}

/// External patch generator invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_generator_command")]
    pub command: String,

    /// Extra arguments placed before the prompt
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_generator_timeout")]
    pub timeout_secs: u64,
}

fn default_config_root() -> PathBuf {
    PathBuf::from("/etc/nixos")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/nixpilot")
}

fn default_policy_path() -> PathBuf {
    PathBuf::from("/etc/nixpilot/policy.toml")
}

fn default_snapshot_excludes() -> Vec<String> {
    vec![".git".to_string(), ".git/**".to_string()]
}

fn default_retention_keep() -> usize {
    20
}

fn default_check_timeout() -> u64 {
    30
}

fn default_build_timeout() -> u64 {
    1800
}

fn default_activate_timeout() -> u64 {
    1800
}

fn default_command_timeout() -> u64 {
    300
}

fn default_max_output_bytes() -> usize {
    16 * 1024
}

fn default_window() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    5
}

fn default_restart_threshold() -> u32 {
    3
}

fn default_generator_command() -> String {
    "gemini".to_string()
}

fn default_generator_timeout() -> u64 {
    120
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window(),
            poll_interval_secs: default_poll_interval(),
            restart_threshold: default_restart_threshold(),
            watched_units: Vec::new(),
            ignore_units: Vec::new(),
        }
    }
}

impl HealthConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: default_generator_command(),
            args: Vec::new(),
            timeout_secs: default_generator_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_root: default_config_root(),
            state_dir: default_state_dir(),
            policy_path: default_policy_path(),
            flake_attr: None,
            snapshot_excludes: default_snapshot_excludes(),
            retention_keep: default_retention_keep(),
            check_timeout_secs: default_check_timeout(),
            build_timeout_secs: default_build_timeout(),
            activate_timeout_secs: default_activate_timeout(),
            command_timeout_secs: default_command_timeout(),
            max_output_bytes: default_max_output_bytes(),
            socket_path: None,
            health: HealthConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl Config {
    /// Resolve which config file to read
    pub fn config_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Some(path) = std::env::var_os("NIXPILOT_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .map(|dir| dir.join("nixpilot").join("config.toml"))
            .filter(|path| path.exists())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load from file (defaults when the file does not exist)
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_path = Self::config_path(explicit);

        if !config_path.exists() {
            if explicit.is_some() {
                return Err(PilotError::Config(format!(
                    "config file not found: {}",
                    config_path.display()
                )));
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&content)?;
        config.check()?;

        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if !self.config_root.is_absolute() {
            return Err(PilotError::Config("config_root must be absolute".to_string()));
        }
        if !self.state_dir.is_absolute() {
            return Err(PilotError::Config("state_dir must be absolute".to_string()));
        }
        if self.state_dir.starts_with(&self.config_root) {
            return Err(PilotError::Config(
                "state_dir must live outside config_root".to_string(),
            ));
        }
        Ok(())
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("nixpilot.sock"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn activate_timeout(&self) -> Duration {
        Duration::from_secs(self.activate_timeout_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.config_root, PathBuf::from("/etc/nixos"));
        assert_eq!(config.retention_keep, 20);
        assert_eq!(config.health.window_secs, 30);
        assert_eq!(config.generator.command, "gemini");
        assert_eq!(config.socket_path(), PathBuf::from("/var/lib/nixpilot/nixpilot.sock"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            config_root = "/etc/app"
            state_dir = "/var/lib/app-pilot"
            flake_attr = "desktop"
            retention_keep = 5

            [health]
            window_secs = 60
            watched_units = ["nginx.service"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.config_root, PathBuf::from("/etc/app"));
        assert_eq!(config.flake_attr.as_deref(), Some("desktop"));
        assert_eq!(config.retention_keep, 5);
        assert_eq!(config.health.window_secs, 60);
        assert_eq!(config.health.poll_interval_secs, 5);
        assert_eq!(config.health.watched_units, vec!["nginx.service".to_string()]);
        assert_eq!(config.build_timeout_secs, 1800);
    }

    #[test]
    fn test_state_dir_inside_root_rejected() {
        let config = Config {
            config_root: PathBuf::from("/etc/nixos"),
            state_dir: PathBuf::from("/etc/nixos/state"),
            ..Default::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        assert!(Config::load(Some(Path::new("/nonexistent/nixpilot.toml"))).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "config_root = \"/srv/cfg\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.config_root, PathBuf::from("/srv/cfg"));
    }
}
