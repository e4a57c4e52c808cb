//! Pre-mutation checks for a change request.
//!
//! Steps run in a fixed order and stop at the first failure. Nothing here
//! writes to the live configuration tree: patches are applied to a scratch
//! copy, which is also what gets build-tested.

use crate::error::{FailureKind, FailureReason, PilotError, Result};
use crate::hash::file_hash;
use crate::policy::{CommandClass, PathVerdict, SafetyPolicy};
use crate::request::{ChangeRequest, Payload};
use crate::snapshot::store::TreeScanner;
use crate::toolchain::{is_checkable, is_switch_command, ToolOutcome, Toolchain};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub reasons: Vec<FailureReason>,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            ok: true,
            reasons: Vec::new(),
        }
    }

    pub fn fail(reason: FailureReason) -> Self {
        Self {
            ok: false,
            reasons: vec![reason],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    PathPolicy,
    BaseHash,
    Syntax,
    CommandPolicy,
    BuildTest,
}

/// Steps that never build anything
pub const CHEAP_STEPS: [Step; 4] = [Step::PathPolicy, Step::BaseHash, Step::Syntax, Step::CommandPolicy];

/// One file's new content, computed in the scratch tree
#[derive(Debug, Clone)]
pub struct StagedChange {
    pub live_path: PathBuf,
    /// `None` deletes the file
    pub content: Option<String>,
}

/// Scratch copy of the configuration tree with the request applied
pub struct StagedTree {
    _dir: TempDir,
    root: PathBuf,
    changes: Vec<StagedChange>,
}

impl StagedTree {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn changes(&self) -> &[StagedChange] {
        &self.changes
    }

    /// Write the staged changes into the live tree (temp file + rename per file)
    pub fn apply_to_live(&self) -> Result<()> {
        for change in &self.changes {
            match &change.content {
                Some(content) => {
                    let parent = change.live_path.parent().ok_or_else(|| PilotError::PatchApply {
                        path: change.live_path.display().to_string(),
                        message: "no parent directory".to_string(),
                    })?;
                    fs::create_dir_all(parent)?;
                    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
                    tmp.write_all(content.as_bytes())?;
                    tmp.as_file().sync_all()?;
                    if let Ok(meta) = fs::metadata(&change.live_path) {
                        fs::set_permissions(tmp.path(), meta.permissions())?;
                    }
                    tmp.persist(&change.live_path).map_err(|e| PilotError::Io(e.error))?;
                }
                None => {
                    if change.live_path.exists() {
                        fs::remove_file(&change.live_path)?;
                    }
                }
            }
            tracing::debug!(path = %change.live_path.display(), "wrote staged change");
        }
        Ok(())
    }
}

pub struct Validator {
    policy: Arc<SafetyPolicy>,
    toolchain: Arc<dyn Toolchain>,
    scanner: TreeScanner,
    build_timeout: Duration,
}

impl Validator {
    pub fn new(
        policy: Arc<SafetyPolicy>,
        toolchain: Arc<dyn Toolchain>,
        scanner: TreeScanner,
        build_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            toolchain,
            scanner,
            build_timeout,
        }
    }

    fn config_root(&self) -> &Path {
        self.scanner.root()
    }

    /// Run every step, including the build test, and report the outcome
    pub async fn validate(&self, request: &ChangeRequest) -> Result<ValidationResult> {
        let (result, staged) = self.validate_cheap(request).await?;
        if !result.ok {
            return Ok(result);
        }
        match staged {
            Some(staged) => self.build_test(&staged).await,
            None => Ok(result),
        }
    }

    /// Steps 1-4. On success, returns the staged tree the build test needs
    /// (patches, and commands that switch the system).
    pub async fn validate_cheap(
        &self,
        request: &ChangeRequest,
    ) -> Result<(ValidationResult, Option<StagedTree>)> {
        if let Payload::Declined { message } = &request.payload {
            return Ok((
                ValidationResult::fail(FailureReason::new(FailureKind::GenerationDeclined, message.clone())),
                None,
            ));
        }

        let mut staged = None;
        for step in CHEAP_STEPS {
            let failure = match step {
                Step::PathPolicy => self.check_paths(request)?,
                Step::BaseHash => self.check_base(request)?,
                Step::Syntax => {
                    let (failure, tree) = self.check_syntax(request).await?;
                    staged = tree;
                    failure
                }
                Step::CommandPolicy => self.check_command(request),
                Step::BuildTest => None,
            };
            if let Some(reason) = failure {
                tracing::info!(request_id = %request.id, ?step, reason = %reason, "validation failed");
                return Ok((ValidationResult::fail(reason), None));
            }
        }

        if staged.is_none() && request.argv().is_some_and(is_switch_command) {
            staged = Some(self.stage(&[])?);
        }
        Ok((ValidationResult::pass(), staged))
    }

    /// Step 1: every file the patch writes must be inside the tree, reachable
    /// without leaving it through a symlink, and allowed by the policy.
    /// `requested_paths` are checked too, on top of the patch's own targets.
    pub fn check_paths(&self, request: &ChangeRequest) -> Result<Option<FailureReason>> {
        let root = self.config_root();
        let denied = |message: String| -> Result<Option<FailureReason>> {
            Ok(Some(FailureReason::new(FailureKind::PathDenied, message)))
        };

        let mut paths = Vec::new();
        if let Some(patch) = request.patch_payload() {
            for file in &patch.files {
                let Some(rel) = file.relative_to(root) else {
                    return denied(format!(
                        "{} is outside the configuration tree {}",
                        file.target_path.display(),
                        root.display()
                    ));
                };
                if rel.ancestors().any(|a| !a.as_os_str().is_empty() && self.scanner.is_excluded(a)) {
                    return denied(format!("{} is excluded from snapshots", rel.display()));
                }
                let live = root.join(&rel);
                if escapes_root(root, &live)? {
                    return denied(format!(
                        "{} leaves the configuration tree through a symlink",
                        live.display()
                    ));
                }
                paths.push(live);
            }
        }
        paths.extend(request.requested_paths.iter().cloned());

        for path in &paths {
            if let PathVerdict::Denied(why) = self.policy.evaluate_path(path) {
                return denied(why);
            }
        }
        Ok(None)
    }

    /// Step 2: each file's base hash must match what is on disk now
    pub fn check_base(&self, request: &ChangeRequest) -> Result<Option<FailureReason>> {
        let Some(patch) = request.patch_payload() else {
            return Ok(None);
        };
        for file in &patch.files {
            let path = file.resolve(self.config_root());
            let current = file_hash(&path)?;
            let stale = match (&file.original_hash, &current, file.new_file) {
                (_, Some(_), true) => Some("file already exists".to_string()),
                (_, None, true) => None,
                (None, _, false) => Some("patch carries no base hash".to_string()),
                (Some(_), None, false) => Some("file no longer exists".to_string()),
                (Some(expected), Some(actual), false) if expected != actual => {
                    Some(format!(
                        "content changed since the patch was made ({} != {})",
                        expected.get(..12).unwrap_or(expected),
                        actual.get(..12).unwrap_or(actual)
                    ))
                }
                _ => None,
            };
            if let Some(why) = stale {
                return Ok(Some(FailureReason::new(
                    FailureKind::StaleBase,
                    format!("{}: {}", path.display(), why),
                )));
            }
        }
        Ok(None)
    }

    /// Step 3: apply the patch in a scratch copy and parse every changed `.nix` file
    pub async fn check_syntax(
        &self,
        request: &ChangeRequest,
    ) -> Result<(Option<FailureReason>, Option<StagedTree>)> {
        let Some(patch) = request.patch_payload() else {
            return Ok((None, None));
        };

        let mut changes = Vec::new();
        for file in &patch.files {
            let live_path = file.resolve(self.config_root());
            let base = match fs::read_to_string(&live_path) {
                Ok(text) => Some(text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            match file.apply(base.as_deref()) {
                Ok(content) => changes.push(StagedChange { live_path, content }),
                Err(e) => {
                    return Ok((Some(FailureReason::new(FailureKind::SyntaxInvalid, e.to_string())), None));
                }
            }
        }

        let staged = self.stage(&changes)?;
        for change in staged.changes() {
            if change.content.is_none() || !is_checkable(&change.live_path) {
                continue;
            }
            let Some(scratch) =
                crate::toolchain::relocate(&change.live_path, self.config_root(), staged.root())
            else {
                continue;
            };
            match self.toolchain.check(&scratch).await? {
                ToolOutcome::Ok => {}
                ToolOutcome::Failed(message) => {
                    return Ok((
                        Some(FailureReason::new(
                            FailureKind::SyntaxInvalid,
                            format!("{}: {}", change.live_path.display(), message),
                        )),
                        None,
                    ));
                }
                ToolOutcome::TimedOut(message) => {
                    return Ok((Some(FailureReason::new(FailureKind::TimedOut, message)), None));
                }
            }
        }
        Ok((None, Some(staged)))
    }

    /// Step 4: imperative commands must not be Forbidden, and Restricted
    /// ones must carry a confirmation
    pub fn check_command(&self, request: &ChangeRequest) -> Option<FailureReason> {
        let Payload::Command { argv, confirmed } = &request.payload else {
            return None;
        };
        let verdict = self.policy.evaluate_command(argv);
        match verdict.class {
            CommandClass::Forbidden => Some(FailureReason::new(
                FailureKind::CommandForbidden,
                format!(
                    "'{}' matches {}",
                    argv.join(" "),
                    verdict.matched.unwrap_or_else(|| "the denylist".to_string())
                ),
            )),
            CommandClass::Restricted if !confirmed => Some(FailureReason::new(
                FailureKind::CommandForbidden,
                format!("'{}' is restricted and was not confirmed", argv.join(" ")),
            )),
            _ => None,
        }
    }

    /// Step 5: full build of the staged tree, bounded by the build timeout
    pub async fn build_test(&self, staged: &StagedTree) -> Result<ValidationResult> {
        let outcome = match tokio::time::timeout(self.build_timeout, self.toolchain.test(staged.root())).await {
            Ok(outcome) => outcome?,
            Err(_) => ToolOutcome::TimedOut(format!(
                "build test exceeded {}s",
                self.build_timeout.as_secs()
            )),
        };
        Ok(match outcome {
            ToolOutcome::Ok => ValidationResult::pass(),
            ToolOutcome::Failed(message) => {
                ValidationResult::fail(FailureReason::new(FailureKind::BuildTestFailed, message))
            }
            ToolOutcome::TimedOut(message) => {
                ValidationResult::fail(FailureReason::new(FailureKind::TimedOut, message))
            }
        })
    }

    /// Copy the live tree into a scratch directory and lay `changes` over it
    fn stage(&self, changes: &[StagedChange]) -> Result<StagedTree> {
        let dir = tempfile::Builder::new().prefix("nixpilot-stage-").tempdir()?;
        let root = dir.path().join("tree");
        copy_tree(&self.scanner, &root)?;

        for change in changes {
            let Some(scratch) = crate::toolchain::relocate(&change.live_path, self.config_root(), &root)
            else {
                continue;
            };
            match &change.content {
                Some(content) => {
                    if let Some(parent) = scratch.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&scratch, content)?;
                }
                None => {
                    if scratch.exists() {
                        fs::remove_file(&scratch)?;
                    }
                }
            }
        }

        Ok(StagedTree {
            _dir: dir,
            root,
            changes: changes.to_vec(),
        })
    }
}

/// Whether writing `live` would land outside `root` once the symlinks on
/// its way are followed. Missing directories are judged by their nearest
/// existing ancestor.
fn escapes_root(root: &Path, live: &Path) -> Result<bool> {
    let canonical_root = match root.canonicalize() {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    if fs::symlink_metadata(live).is_ok_and(|m| m.file_type().is_symlink()) {
        return Ok(match live.canonicalize() {
            Ok(target) => !target.starts_with(&canonical_root),
            Err(_) => true,
        });
    }

    let mut ancestor = live.parent();
    while let Some(dir) = ancestor {
        match dir.canonicalize() {
            Ok(real) => return Ok(!real.starts_with(&canonical_root)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ancestor = dir.parent(),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(false)
}

fn copy_tree(scanner: &TreeScanner, dest: &Path) -> Result<()> {
    let src = scanner.root();
    fs::create_dir_all(dest)?;
    if !src.exists() {
        return Ok(());
    }
    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.path()
                .strip_prefix(src)
                .map(|rel| !scanner.is_excluded(rel))
                .unwrap_or(false)
        });
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| PilotError::Snapshot(e.to_string()))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::patch::Patch;
    use crate::policy::PolicyFile;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const CONFIG: &str = "{ pkgs, ... }:\n{\n  services.nginx.enable = false;\n}\n";
    pub(crate) const ENABLE_NGINX: &str = concat!(
        "--- a/configuration.nix\n",
        "+++ b/configuration.nix\n",
        "@@ -1,4 +1,4 @@\n",
        " { pkgs, ... }:\n",
        " {\n",
        "-  services.nginx.enable = false;\n",
        "+  services.nginx.enable = true;\n",
        " }\n",
    );

    /// Toolchain double with scripted outcomes
    #[derive(Default)]
    pub(crate) struct FakeToolchain {
        pub check_fails: bool,
        pub test_fails: bool,
        pub activate_fails: bool,
        /// Fail the first activation only, so reactivating the snapshot works
        pub activate_fails_once: bool,
        pub test_delay: Option<Duration>,
        pub checks: AtomicUsize,
        pub tests: AtomicUsize,
        pub activations: AtomicUsize,
    }

    #[async_trait]
    impl Toolchain for FakeToolchain {
        async fn check(&self, file: &Path) -> Result<ToolOutcome> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            assert!(file.exists());
            Ok(if self.check_fails {
                ToolOutcome::Failed("syntax error, unexpected '}'".to_string())
            } else {
                ToolOutcome::Ok
            })
        }

        async fn test(&self, _tree: &Path) -> Result<ToolOutcome> {
            self.tests.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.test_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(if self.test_fails {
                ToolOutcome::Failed("error: attribute 'nginx' missing".to_string())
            } else {
                ToolOutcome::Ok
            })
        }

        async fn activate(&self, _tree: &Path) -> Result<ToolOutcome> {
            let previous = self.activations.fetch_add(1, Ordering::SeqCst);
            Ok(if self.activate_fails || (self.activate_fails_once && previous == 0) {
                ToolOutcome::Failed("switch-to-configuration failed".to_string())
            } else {
                ToolOutcome::Ok
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        toolchain: Arc<FakeToolchain>,
        validator: Validator,
    }

    fn fixture(toolchain: FakeToolchain) -> Fixture {
        fixture_with(toolchain, |_, _| {})
    }

    fn fixture_with(toolchain: FakeToolchain, edit: impl FnOnce(&mut PolicyFile, &Path)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nixos");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("configuration.nix"), CONFIG).unwrap();

        let mut file = SafetyPolicy::default_file(&root);
        edit(&mut file, &root);
        let policy = Arc::new(SafetyPolicy::from_file(file, &[]).unwrap());
        let toolchain = Arc::new(toolchain);
        let scanner = TreeScanner::new(root.clone(), &[".git".to_string()]).unwrap();
        let validator = Validator::new(
            policy,
            toolchain.clone() as Arc<dyn Toolchain>,
            scanner,
            Duration::from_secs(5),
        );
        Fixture {
            _dir: dir,
            root,
            toolchain,
            validator,
        }
    }

    fn patch_request(root: &Path, text: &str) -> ChangeRequest {
        let mut patch = Patch::parse(text).unwrap();
        patch.bind_base(root).unwrap();
        ChangeRequest::patch(patch, root)
    }

    #[tokio::test]
    async fn test_valid_patch_passes_all_steps() {
        let f = fixture(FakeToolchain::default());
        let request = patch_request(&f.root, ENABLE_NGINX);

        let result = f.validator.validate(&request).await.unwrap();
        assert!(result.ok, "{:?}", result.reasons);
        assert_eq!(f.toolchain.checks.load(Ordering::SeqCst), 1);
        assert_eq!(f.toolchain.tests.load(Ordering::SeqCst), 1);
        // Live tree untouched
        assert_eq!(fs::read_to_string(f.root.join("configuration.nix")).unwrap(), CONFIG);
    }

    #[tokio::test]
    async fn test_stale_base_short_circuits() {
        let f = fixture(FakeToolchain::default());
        let request = patch_request(&f.root, ENABLE_NGINX);
        fs::write(f.root.join("configuration.nix"), "{ }\n").unwrap();

        let result = f.validator.validate(&request).await.unwrap();
        assert!(!result.ok);
        assert_eq!(result.reasons[0].kind, FailureKind::StaleBase);
        assert_eq!(f.toolchain.checks.load(Ordering::SeqCst), 0);
        assert_eq!(f.toolchain.tests.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_base_hash_is_stale() {
        let f = fixture(FakeToolchain::default());
        let patch = Patch::parse(ENABLE_NGINX).unwrap();
        let request = ChangeRequest::patch(patch, &f.root);

        let reason = f.validator.check_base(&request).unwrap().unwrap();
        assert_eq!(reason.kind, FailureKind::StaleBase);
    }

    #[test]
    fn test_path_outside_tree_denied() {
        let f = fixture(FakeToolchain::default());
        let text = "--- a/../../etc/shadow\n+++ b/../../etc/shadow\n@@ -1 +1 @@\n-a\n+b\n";
        let request = ChangeRequest::patch(Patch::parse(text).unwrap(), &f.root);

        let reason = f.validator.check_paths(&request).unwrap().unwrap();
        assert_eq!(reason.kind, FailureKind::PathDenied);
    }

    #[tokio::test]
    async fn test_syntax_failure() {
        let f = fixture(FakeToolchain {
            check_fails: true,
            ..Default::default()
        });
        let request = patch_request(&f.root, ENABLE_NGINX);

        let result = f.validator.validate(&request).await.unwrap();
        assert_eq!(result.reasons[0].kind, FailureKind::SyntaxInvalid);
        assert_eq!(f.toolchain.tests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_build_failure() {
        let f = fixture(FakeToolchain {
            test_fails: true,
            ..Default::default()
        });
        let request = patch_request(&f.root, ENABLE_NGINX);

        let result = f.validator.validate(&request).await.unwrap();
        assert_eq!(result.reasons[0].kind, FailureKind::BuildTestFailed);
    }

    #[tokio::test]
    async fn test_build_timeout() {
        let mut f = fixture(FakeToolchain {
            test_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        f.validator.build_timeout = Duration::from_millis(100);
        let request = patch_request(&f.root, ENABLE_NGINX);

        let result = f.validator.validate(&request).await.unwrap();
        assert_eq!(result.reasons[0].kind, FailureKind::TimedOut);
    }

    #[tokio::test]
    async fn test_staged_tree_carries_patched_content() {
        let f = fixture(FakeToolchain::default());
        let request = patch_request(&f.root, ENABLE_NGINX);

        let (result, staged) = f.validator.validate_cheap(&request).await.unwrap();
        assert!(result.ok);
        let staged = staged.unwrap();
        let scratch = fs::read_to_string(staged.root().join("configuration.nix")).unwrap();
        assert!(scratch.contains("enable = true"));

        staged.apply_to_live().unwrap();
        assert!(fs::read_to_string(f.root.join("configuration.nix"))
            .unwrap()
            .contains("enable = true"));
    }

    #[tokio::test]
    async fn test_forbidden_and_unconfirmed_commands() {
        let f = fixture(FakeToolchain::default());
        let forbidden = ChangeRequest::command(vec!["reboot".to_string()], true);
        let result = f.validator.validate(&forbidden).await.unwrap();
        assert_eq!(result.reasons[0].kind, FailureKind::CommandForbidden);

        let unconfirmed = ChangeRequest::command(vec!["systemctl".into(), "restart".into(), "nginx".into()], false);
        assert!(f.validator.check_command(&unconfirmed).is_some());

        let safe = ChangeRequest::command(vec!["uname".to_string()], false);
        assert!(f.validator.validate(&safe).await.unwrap().ok);
    }

    #[tokio::test]
    async fn test_switch_command_is_build_tested_first() {
        let f = fixture(FakeToolchain {
            test_fails: true,
            ..Default::default()
        });
        let request = ChangeRequest::command(
            vec!["nixos-rebuild".to_string(), "switch".to_string()],
            true,
        );

        let result = f.validator.validate(&request).await.unwrap();
        assert_eq!(result.reasons[0].kind, FailureKind::BuildTestFailed);
        assert_eq!(f.toolchain.tests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_declined_request() {
        let f = fixture(FakeToolchain::default());
        let request = ChangeRequest::declined("UNABLE_TO_GENERATE_PATCH", Vec::new());
        let result = f.validator.validate(&request).await.unwrap();
        assert_eq!(result.reasons[0].kind, FailureKind::GenerationDeclined);
    }

    #[tokio::test]
    async fn test_policy_judges_patch_targets_not_requested_paths() {
        let f = fixture_with(FakeToolchain::default(), |file, root| {
            file.forbidden_path_prefixes.push(root.join("configuration.nix"));
        });
        let mut request = patch_request(&f.root, ENABLE_NGINX);
        request.requested_paths.clear();

        let reason = f.validator.check_paths(&request).unwrap().unwrap();
        assert_eq!(reason.kind, FailureKind::PathDenied);
        assert!(reason.message.contains("forbidden prefix"));

        let result = f.validator.validate(&request).await.unwrap();
        assert_eq!(result.reasons[0].kind, FailureKind::PathDenied);
        assert_eq!(f.toolchain.checks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_requested_paths_are_checked_as_well() {
        let f = fixture(FakeToolchain::default());
        let mut request = patch_request(&f.root, ENABLE_NGINX);
        request.requested_paths.push(PathBuf::from("/etc/shadow"));

        let reason = f.validator.check_paths(&request).unwrap().unwrap();
        assert_eq!(reason.kind, FailureKind::PathDenied);
        assert!(reason.message.contains("/etc/shadow"));
    }

    #[test]
    fn test_absolute_escape_denied_under_system_wide_access() {
        let f = fixture_with(FakeToolchain::default(), |file, _| {
            file.system_wide_access = true;
        });
        let text = format!(
            "--- /dev/null\n+++ {}/../escape.nix\n@@ -0,0 +1 @@\n+x\n",
            f.root.display()
        );
        let mut request = patch_request(&f.root, &text);
        request.requested_paths.clear();

        let reason = f.validator.check_paths(&request).unwrap().unwrap();
        assert_eq!(reason.kind, FailureKind::PathDenied);
        assert!(reason.message.contains("outside the configuration tree"));
    }

    #[test]
    fn test_symlinked_directory_leading_out_of_tree_denied() {
        let f = fixture(FakeToolchain::default());
        let outside = f._dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, f.root.join("hosts")).unwrap();

        let text = "--- /dev/null\n+++ b/hosts/evil.nix\n@@ -0,0 +1 @@\n+x\n";
        let request = patch_request(&f.root, text);

        let reason = f.validator.check_paths(&request).unwrap().unwrap();
        assert_eq!(reason.kind, FailureKind::PathDenied);
        assert!(reason.message.contains("symlink"));

        // A directory that does not exist yet is judged by its existing parent
        let nested = "--- /dev/null\n+++ b/modules/new/web.nix\n@@ -0,0 +1 @@\n+x\n";
        assert!(f.validator.check_paths(&patch_request(&f.root, nested)).unwrap().is_none());
    }

    #[test]
    fn test_excluded_target_denied() {
        let f = fixture(FakeToolchain::default());
        let text = "--- /dev/null\n+++ b/.git/hooks/pre-commit\n@@ -0,0 +1 @@\n+x\n";
        let reason = f.validator.check_paths(&patch_request(&f.root, text)).unwrap().unwrap();
        assert_eq!(reason.kind, FailureKind::PathDenied);
    }

    #[test]
    fn test_stale_base_with_non_ascii_hash_does_not_panic() {
        let f = fixture(FakeToolchain::default());
        let mut patch = Patch::parse(ENABLE_NGINX).unwrap();
        // Byte 12 falls inside a two-byte character
        let odd = format!("a{}", "é".repeat(8));
        patch.files[0].original_hash = Some(odd.clone());
        let request = ChangeRequest::patch(patch, &f.root);

        let reason = f.validator.check_base(&request).unwrap().unwrap();
        assert_eq!(reason.kind, FailureKind::StaleBase);
        assert!(reason.message.contains(&odd));
    }
}
