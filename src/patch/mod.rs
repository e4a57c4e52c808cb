//! Structured multi-file unified diffs.
//!
//! Generated diffs are parsed leniently: hunk line counts in `@@` headers are
//! recomputed from the body, since patch generators frequently get them wrong.
//! Application is delegated to `diffy` one file at a time.

use crate::error::{PilotError, Result};
use crate::hash::{file_hash, is_sha256_hex};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

static HUNK_HEADER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("static regex")
});

const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HunkLine {
    Context(String),
    Delete(String),
    Insert(String),
    NoNewlineAtEof,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    fn recount(&mut self) {
        self.old_len = self
            .lines
            .iter()
            .filter(|l| matches!(l, HunkLine::Context(_) | HunkLine::Delete(_)))
            .count();
        self.new_len = self
            .lines
            .iter()
            .filter(|l| matches!(l, HunkLine::Context(_) | HunkLine::Insert(_)))
            .count();
    }

    fn render(&self, out: &mut String) {
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            self.old_start, self.old_len, self.new_start, self.new_len
        ));
        for line in &self.lines {
            match line {
                HunkLine::Context(s) => out.push_str(&format!(" {}\n", s)),
                HunkLine::Delete(s) => out.push_str(&format!("-{}\n", s)),
                HunkLine::Insert(s) => out.push_str(&format!("+{}\n", s)),
                HunkLine::NoNewlineAtEof => {
                    out.push_str(NO_NEWLINE_MARKER);
                    out.push('\n');
                }
            }
        }
    }
}

/// All hunks against one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHunk {
    /// Path relative to the configuration root (or absolute)
    pub target_path: PathBuf,
    /// SHA-256 of the file the patch was produced against.
    /// `None` on a new file means the target must not exist.
    pub original_hash: Option<String>,
    pub new_file: bool,
    pub deleted: bool,
    pub hunks: Vec<Hunk>,
}

impl FileHunk {
    /// Resolve the target against the configuration root
    pub fn resolve(&self, root: &Path) -> PathBuf {
        if let Some(rel) = self.relative_to(root) {
            root.join(rel)
        } else if self.target_path.is_absolute() {
            self.target_path.clone()
        } else {
            root.join(&self.target_path)
        }
    }

    /// Normalized path relative to `root`, if the target lies inside it.
    /// Any `..` component disqualifies the target, absolute or not.
    pub fn relative_to(&self, root: &Path) -> Option<PathBuf> {
        let rel = if self.target_path.is_absolute() {
            self.target_path.strip_prefix(root).ok()?
        } else {
            self.target_path.as_path()
        };

        let mut clean = PathBuf::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        if clean.as_os_str().is_empty() {
            None
        } else {
            Some(clean)
        }
    }

    /// Unified diff text for this file alone
    pub fn to_unified(&self) -> String {
        let path = self.target_path.display();
        let mut out = String::new();
        if self.new_file {
            out.push_str("--- /dev/null\n");
        } else {
            out.push_str(&format!("--- a/{}\n", path));
        }
        if self.deleted {
            out.push_str("+++ /dev/null\n");
        } else {
            out.push_str(&format!("+++ b/{}\n", path));
        }
        for hunk in &self.hunks {
            hunk.render(&mut out);
        }
        out
    }

    /// Apply to `base` content. Returns `None` when the file is deleted.
    pub fn apply(&self, base: Option<&str>) -> Result<Option<String>> {
        let err = |message: String| PilotError::PatchApply {
            path: self.target_path.display().to_string(),
            message,
        };

        let base = match (base, self.new_file) {
            (Some(_), true) => return Err(err("file already exists".to_string())),
            (None, false) => return Err(err("file does not exist".to_string())),
            (Some(content), false) => content,
            (None, true) => "",
        };

        let text = self.to_unified();
        let patch = diffy::Patch::from_str(&text).map_err(|e| err(e.to_string()))?;
        let result = diffy::apply(base, &patch).map_err(|e| err(e.to_string()))?;

        if self.deleted {
            if !result.is_empty() {
                return Err(err("deletion leaves content behind".to_string()));
            }
            return Ok(None);
        }
        Ok(Some(result))
    }
}

/// Ordered sequence of per-file changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub files: Vec<FileHunk>,
}

/// Preview of what a patch will change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSummary {
    pub files_modified: Vec<PathBuf>,
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl fmt::Display for PatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let files: Vec<String> = self
            .files_modified
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        write!(
            f,
            "Modified {} files: {} (+{} -{})",
            files.len(),
            files.join(", "),
            self.lines_added,
            self.lines_removed
        )
    }
}

#[derive(Default)]
struct FileBuilder {
    git_path: Option<String>,
    old_path: Option<String>,
    new_path: Option<String>,
    headers_seen: bool,
    index_hash: Option<String>,
    hunks: Vec<Hunk>,
    current: Option<Hunk>,
    // Body lines still announced by the open hunk's `@@` header
    pending_old: usize,
    pending_new: usize,
    trailing_blank: usize,
}

impl FileBuilder {
    /// Inside a hunk whose header counts are not yet used up, `--- `/`+++ `
    /// lines are body lines rather than the next file's headers
    fn expects_body(&self) -> bool {
        self.current.is_some() && (self.pending_old > 0 || self.pending_new > 0)
    }

    fn count_body_line(&mut self, line: &HunkLine) {
        let (old, new) = match line {
            HunkLine::Context(_) => (1, 1),
            HunkLine::Delete(_) => (1, 0),
            HunkLine::Insert(_) => (0, 1),
            HunkLine::NoNewlineAtEof => (0, 0),
        };
        self.pending_old = self.pending_old.saturating_sub(old);
        self.pending_new = self.pending_new.saturating_sub(new);
    }

    fn close_hunk(&mut self) {
        self.pending_old = 0;
        self.pending_new = 0;
        if let Some(mut hunk) = self.current.take() {
            // Blank lines after the last real hunk line are separators, not context
            for _ in 0..self.trailing_blank {
                hunk.lines.pop();
            }
            self.trailing_blank = 0;
            hunk.recount();
            if !hunk.lines.is_empty() {
                self.hunks.push(hunk);
            }
        }
    }

    fn finish(mut self) -> Result<FileHunk> {
        self.close_hunk();

        let new_file = self.headers_seen && self.old_path.is_none();
        let deleted = self.headers_seen && self.new_path.is_none();
        let target = self
            .new_path
            .or(self.old_path)
            .or(self.git_path)
            .ok_or_else(|| PilotError::PatchParse("file section without a path".to_string()))?;

        if self.hunks.is_empty() {
            return Err(PilotError::PatchParse(format!("no hunks for {}", target)));
        }

        Ok(FileHunk {
            target_path: PathBuf::from(target),
            original_hash: if new_file { None } else { self.index_hash },
            new_file,
            deleted,
            hunks: self.hunks,
        })
    }
}

/// `a/foo.nix\t2024-01-01` -> `Some("foo.nix")`, `/dev/null` -> `None`
fn header_path(raw: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    if raw == "/dev/null" {
        return None;
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(stripped.to_string())
}

impl Patch {
    /// Parse a (possibly multi-file) unified diff
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(PilotError::PatchParse("empty patch".to_string()));
        }

        let lines: Vec<&str> = text.lines().collect();
        let mut files = Vec::new();
        let mut current: Option<FileBuilder> = None;
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];

            if let Some(rest) = line.strip_prefix("diff --git ") {
                if let Some(builder) = current.take() {
                    files.push(builder.finish()?);
                }
                let git_path = rest.split_whitespace().nth(1).and_then(header_path);
                current = Some(FileBuilder {
                    git_path,
                    ..Default::default()
                });
                i += 1;
                continue;
            }

            let next_is_new_header = lines.get(i + 1).is_some_and(|n| n.starts_with("+++ "));
            let in_body = current.as_ref().is_some_and(FileBuilder::expects_body);
            if line.starts_with("--- ") && next_is_new_header && !in_body {
                let start_new = match &current {
                    None => true,
                    Some(b) => b.headers_seen || !b.hunks.is_empty() || b.current.is_some(),
                };
                if start_new {
                    if let Some(builder) = current.take() {
                        files.push(builder.finish()?);
                    }
                    current = Some(FileBuilder::default());
                }
                if let Some(builder) = current.as_mut() {
                    builder.old_path = header_path(&line[4..]);
                    builder.new_path = header_path(&lines[i + 1][4..]);
                    builder.headers_seen = true;
                }
                i += 2;
                continue;
            }

            let Some(builder) = current.as_mut() else {
                // Prose before the first file header
                i += 1;
                continue;
            };

            if line.starts_with("@@") {
                builder.close_hunk();
                let caps = HUNK_HEADER_REGEX
                    .captures(line)
                    .ok_or_else(|| PilotError::PatchParse(format!("bad hunk header: {}", line)))?;
                let num = |idx: usize, default: usize| {
                    caps.get(idx)
                        .and_then(|m| m.as_str().parse::<usize>().ok())
                        .unwrap_or(default)
                };
                builder.current = Some(Hunk {
                    old_start: num(1, 0),
                    old_len: 0,
                    new_start: num(3, 0),
                    new_len: 0,
                    lines: Vec::new(),
                });
                builder.pending_old = num(2, 1);
                builder.pending_new = num(4, 1);
                i += 1;
                continue;
            }

            if builder.current.is_some() {
                let parsed = if line.is_empty() {
                    Some(HunkLine::Context(String::new()))
                } else if let Some(s) = line.strip_prefix(' ') {
                    Some(HunkLine::Context(s.to_string()))
                } else if let Some(s) = line.strip_prefix('-') {
                    Some(HunkLine::Delete(s.to_string()))
                } else if let Some(s) = line.strip_prefix('+') {
                    Some(HunkLine::Insert(s.to_string()))
                } else if line.starts_with('\\') {
                    Some(HunkLine::NoNewlineAtEof)
                } else {
                    None
                };

                match parsed {
                    Some(hunk_line) => {
                        builder.trailing_blank = if line.is_empty() {
                            builder.trailing_blank + 1
                        } else {
                            0
                        };
                        builder.count_body_line(&hunk_line);
                        if let Some(hunk) = builder.current.as_mut() {
                            hunk.lines.push(hunk_line);
                        }
                    }
                    None => builder.close_hunk(),
                }
                i += 1;
                continue;
            }

            // Extended git headers
            if let Some(rest) = line.strip_prefix("index ") {
                let old = rest.split("..").next().unwrap_or("");
                if is_sha256_hex(old) {
                    builder.index_hash = Some(old.to_lowercase());
                }
            }
            i += 1;
        }

        if let Some(builder) = current.take() {
            files.push(builder.finish()?);
        }

        if files.is_empty() {
            return Err(PilotError::PatchParse("no file sections found".to_string()));
        }

        Ok(Self { files })
    }

    /// Fill in missing base hashes from the current tree
    pub fn bind_base(&mut self, root: &Path) -> Result<()> {
        for file in &mut self.files {
            if file.new_file || file.original_hash.is_some() {
                continue;
            }
            file.original_hash = file_hash(&file.resolve(root))?;
        }
        Ok(())
    }

    pub fn touched_paths(&self, root: &Path) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.resolve(root)).collect()
    }

    pub fn summary(&self) -> PatchSummary {
        let mut summary = PatchSummary {
            files_modified: Vec::new(),
            lines_added: 0,
            lines_removed: 0,
        };
        for file in &self.files {
            summary.files_modified.push(file.target_path.clone());
            for hunk in &file.hunks {
                for line in &hunk.lines {
                    match line {
                        HunkLine::Insert(_) => summary.lines_added += 1,
                        HunkLine::Delete(_) => summary.lines_removed += 1,
                        _ => {}
                    }
                }
            }
        }
        summary
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn to_unified(&self) -> String {
        self.files.iter().map(FileHunk::to_unified).collect()
    }
}
