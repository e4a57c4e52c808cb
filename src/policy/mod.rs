//! Static safety rules: which paths may be touched and which commands may run.
//!
//! The policy is loaded once at startup and shared as `Arc<SafetyPolicy>`.
//! Evaluation is a pure function of the policy and its input.

use crate::error::{PilotError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Result of evaluating a path against the policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathVerdict {
    Allowed,
    Denied(String),
}

impl PathVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PathVerdict::Allowed)
    }
}

/// Command classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandClass {
    /// Read-only, runs without confirmation
    Safe,
    /// Needs an explicit confirmation flag from the caller
    Restricted,
    /// Never spawned
    Forbidden,
}

impl CommandClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandClass::Safe => "Safe",
            CommandClass::Restricted => "Restricted",
            CommandClass::Forbidden => "Forbidden",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandVerdict {
    pub class: CommandClass,
    /// Description of the pattern that decided the class, if any
    pub matched: Option<String>,
}

/// On-disk policy format (`policy.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub allowed_path_prefixes: Vec<PathBuf>,

    #[serde(default)]
    pub forbidden_path_prefixes: Vec<PathBuf>,

    /// Regular expressions matched against the space-joined argv
    #[serde(default)]
    pub forbidden_command_patterns: Vec<String>,

    #[serde(default)]
    pub safe_command_patterns: Vec<String>,

    #[serde(default)]
    pub system_wide_access: bool,
}

const DEFAULT_FORBIDDEN_PATHS: &[&str] = &[
    "/etc/shadow",
    "/etc/gshadow",
    "/etc/sudoers",
    "/etc/sudoers.d",
    "/etc/ssh",
    "/root/.ssh",
    "/boot",
];

const DEFAULT_FORBIDDEN_PATTERNS: &[&str] = &[
    // Recursive rm of / or ~, whatever other flags surround it and in any order
    r"\brm\s+(?:-{1,2}\S+\s+)*(?:-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)\s+(?:-{1,2}\S+\s+)*(?:/|/\*|~)(?:\s|$)",
    r"\bmkfs(\.\w+)?\b",
    r"\bdd\s+.*\bof=/dev/",
    r"\bdd\s+if=/dev/(zero|random|urandom)\b",
    r"\b(fdisk|parted|wipefs|sgdisk)\b",
    r"\b(shutdown|reboot|halt|poweroff)\b",
    r"\bsystemctl\s+(reboot|poweroff|halt|kexec)\b",
    r">\s*/dev/(sd|nvme|vd|hd)",
    r"\bch(mod|own)\s+-R\s+\S+\s+/(\s|$)",
    r":\(\)\s*\{\s*:\|:&\s*\};:",
    r"\b(curl|wget)\b.*\|\s*(ba|z)?sh\b",
    r"\busermod\s+.*-a?G\s*\S*\bwheel\b",
    r"\b(passwd|visudo)\b",
    r"\bsystemctl\s+(stop|disable|mask|kill)\s+nixpilot",
];

const DEFAULT_SAFE_PATTERNS: &[&str] = &[
    r"^(ls|cat|head|tail|wc|stat|uname|df|free|uptime|whoami|id|date|nixos-version)(\s|$)",
    r"^systemctl\s+(status|list-units|list-failed|show|is-active|is-failed)(\s|$)",
    r"^journalctl(\s|$)",
    r"^nix\s+search(\s|$)",
    r"^nix-instantiate\s+--parse(\s|$)",
];

#[derive(Debug, Clone)]
struct CommandPattern {
    source: String,
    regex: Regex,
}

impl CommandPattern {
    fn compile(source: &str) -> Result<Self> {
        let regex = Regex::new(source)
            .map_err(|e| PilotError::Policy(format!("bad pattern '{}': {}", source, e)))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }
}

/// Process-wide immutable safety policy
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    allowed_path_prefixes: Vec<PathBuf>,
    forbidden_path_prefixes: Vec<PathBuf>,
    forbidden_patterns: Vec<CommandPattern>,
    safe_patterns: Vec<CommandPattern>,
    system_wide_access: bool,
    digest: String,
}

impl SafetyPolicy {
    /// Build a policy from its file form. `protected` paths (the policy file
    /// itself, the state directory) are always forbidden.
    pub fn from_file(file: PolicyFile, protected: &[PathBuf]) -> Result<Self> {
        let digest = {
            let serialized = toml::to_string(&file)
                .map_err(|e| PilotError::Policy(e.to_string()))?;
            let mut hasher = Sha256::new();
            hasher.update(serialized.as_bytes());
            format!("{:x}", hasher.finalize())
        };

        let mut forbidden_path_prefixes: Vec<PathBuf> = file
            .forbidden_path_prefixes
            .iter()
            .map(|p| normalize(p))
            .collect();
        for path in protected {
            let path = normalize(path);
            if !forbidden_path_prefixes.contains(&path) {
                forbidden_path_prefixes.push(path);
            }
        }

        let forbidden_patterns = file
            .forbidden_command_patterns
            .iter()
            .map(|p| CommandPattern::compile(p))
            .collect::<Result<Vec<_>>>()?;
        let safe_patterns = file
            .safe_command_patterns
            .iter()
            .map(|p| CommandPattern::compile(p))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            allowed_path_prefixes: file.allowed_path_prefixes.iter().map(|p| normalize(p)).collect(),
            forbidden_path_prefixes,
            forbidden_patterns,
            safe_patterns,
            system_wide_access: file.system_wide_access,
            digest,
        })
    }

    /// Built-in policy: only `config_root` is writable
    pub fn default_file(config_root: &Path) -> PolicyFile {
        PolicyFile {
            allowed_path_prefixes: vec![config_root.to_path_buf()],
            forbidden_path_prefixes: DEFAULT_FORBIDDEN_PATHS.iter().map(PathBuf::from).collect(),
            forbidden_command_patterns: DEFAULT_FORBIDDEN_PATTERNS.iter().map(|s| s.to_string()).collect(),
            safe_command_patterns: DEFAULT_SAFE_PATTERNS.iter().map(|s| s.to_string()).collect(),
            system_wide_access: false,
        }
    }

    /// Load the policy file, falling back to the built-in policy when absent
    pub fn load(policy_path: &Path, config_root: &Path, state_dir: &Path) -> Result<Self> {
        let file = if policy_path.exists() {
            let content = fs::read_to_string(policy_path)?;
            toml::from_str::<PolicyFile>(&content)?
        } else {
            tracing::warn!(path = %policy_path.display(), "policy file missing, using built-in policy");
            Self::default_file(config_root)
        };

        let protected = [policy_path.to_path_buf(), state_dir.to_path_buf()];
        let policy = Self::from_file(file, &protected)?;
        tracing::info!(
            digest = %policy.digest,
            system_wide = policy.system_wide_access,
            "safety policy loaded"
        );
        Ok(policy)
    }

    /// SHA-256 of the policy file contents, for audit records
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn system_wide_access(&self) -> bool {
        self.system_wide_access
    }

    pub fn allowed_path_prefixes(&self) -> &[PathBuf] {
        &self.allowed_path_prefixes
    }

    pub fn forbidden_path_prefixes(&self) -> &[PathBuf] {
        &self.forbidden_path_prefixes
    }

    pub fn forbidden_patterns(&self) -> impl Iterator<Item = &str> {
        self.forbidden_patterns.iter().map(|p| p.source.as_str())
    }

    pub fn safe_patterns(&self) -> impl Iterator<Item = &str> {
        self.safe_patterns.iter().map(|p| p.source.as_str())
    }

    /// Allowed iff under an allowed prefix (or system-wide access is on) and
    /// under no forbidden prefix. Forbidden always wins.
    pub fn evaluate_path(&self, path: &Path) -> PathVerdict {
        if !path.is_absolute() {
            return PathVerdict::Denied(format!("{} is not an absolute path", path.display()));
        }
        let path = normalize(path);

        if let Some(prefix) = self
            .forbidden_path_prefixes
            .iter()
            .find(|prefix| path.starts_with(prefix))
        {
            return PathVerdict::Denied(format!(
                "{} is under forbidden prefix {}",
                path.display(),
                prefix.display()
            ));
        }

        if self.system_wide_access {
            return PathVerdict::Allowed;
        }

        if self
            .allowed_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix))
        {
            PathVerdict::Allowed
        } else {
            PathVerdict::Denied(format!("{} is outside the allowed paths", path.display()))
        }
    }

    /// Denylist first, then the safe list; anything unmatched is Restricted.
    pub fn evaluate_command(&self, argv: &[String]) -> CommandVerdict {
        let joined = argv.join(" ");
        let joined = joined.trim();

        if joined.is_empty() {
            return CommandVerdict {
                class: CommandClass::Forbidden,
                matched: Some("empty command".to_string()),
            };
        }

        if let Some(pattern) = self.forbidden_patterns.iter().find(|p| p.regex.is_match(joined)) {
            return CommandVerdict {
                class: CommandClass::Forbidden,
                matched: Some(pattern.source.clone()),
            };
        }

        // Chained commands never count as safe
        let chained = ["&&", "||", ";", "|", "`", "$("].iter().any(|op| joined.contains(op));
        if !chained {
            if let Some(pattern) = self.safe_patterns.iter().find(|p| p.regex.is_match(joined)) {
                return CommandVerdict {
                    class: CommandClass::Safe,
                    matched: Some(pattern.source.clone()),
                };
            }
        }

        CommandVerdict {
            class: CommandClass::Restricted,
            matched: None,
        }
    }
}

/// Lexical normalization: drops `.` and resolves `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
