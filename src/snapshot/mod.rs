//! Restore points for the configuration tree.
//!
//! Layout under `<state_dir>/snapshots/`:
//!
//! ```text
//! objects/ab/cdef...     file contents, content-addressed
//! manifests/<id>.json    snapshot metadata + tree manifest
//! pins/<id>              held by an in-flight transaction
//! BASELINE               id of the last committed snapshot
//! ```

pub mod store;

use crate::error::{PilotError, Result};
use crate::patch::Patch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use store::{EntryKind, Manifest, ObjectStore, TreeScanner};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Digest of the tree manifest
    pub content_ref: String,
    pub label: String,
    #[serde(default)]
    pub tx_id: Option<String>,
    pub file_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    snapshot: Snapshot,
    manifest: Manifest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub objects_removed: usize,
}

pub struct SnapshotStore {
    dir: PathBuf,
    objects: ObjectStore,
    scanner: TreeScanner,
}

impl SnapshotStore {
    pub fn open(config_root: &Path, state_dir: &Path, excludes: &[String]) -> Result<Self> {
        let dir = state_dir.join("snapshots");
        fs::create_dir_all(dir.join("manifests"))?;
        fs::create_dir_all(dir.join("pins"))?;
        Ok(Self {
            objects: ObjectStore::new(dir.join("objects"))?,
            scanner: TreeScanner::new(config_root.to_path_buf(), excludes)?,
            dir,
        })
    }

    pub fn root(&self) -> &Path {
        self.scanner.root()
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.dir.join("manifests").join(format!("{}.json", id))
    }

    /// Capture the current tree
    pub fn create(&self, label: &str, tx_id: Option<&str>) -> Result<Snapshot> {
        let manifest = self.scanner.capture(&self.objects)?;
        let created_at = Utc::now();
        let uuid = Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", created_at.format("%Y%m%d%H%M%S%6f"), &uuid[..8]);
        let parent_id = self.list()?.first().map(|s| s.id.clone());

        let snapshot = Snapshot {
            id: id.clone(),
            parent_id,
            created_at,
            content_ref: manifest.digest()?,
            label: label.to_string(),
            tx_id: tx_id.map(str::to_string),
            file_count: manifest.files.len(),
        };

        let record = SnapshotRecord {
            snapshot: snapshot.clone(),
            manifest,
        };
        let path = self.manifest_path(&id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&record)?)?;
        fs::rename(&tmp, &path)?;

        tracing::info!(
            snapshot_id = %id,
            label,
            files = snapshot.file_count,
            "snapshot created"
        );
        Ok(snapshot)
    }

    fn load(&self, id: &str) -> Result<SnapshotRecord> {
        let path = self.manifest_path(id);
        if !path.exists() {
            return Err(PilotError::SnapshotNotFound(id.to_string()));
        }
        let content = fs::read(&path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Look up by full id or unique prefix
    pub fn resolve(&self, id: &str) -> Result<Snapshot> {
        if self.manifest_path(id).exists() {
            return Ok(self.load(id)?.snapshot);
        }
        let mut matches: Vec<Snapshot> = self
            .list()?
            .into_iter()
            .filter(|s| s.id.starts_with(id))
            .collect();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(PilotError::SnapshotNotFound(id.to_string())),
            n => Err(PilotError::Snapshot(format!("'{}' matches {} snapshots", id, n))),
        }
    }

    /// All snapshots, newest first
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(self.dir.join("manifests"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read(&path)?;
            match serde_json::from_slice::<SnapshotRecord>(&content) {
                Ok(record) => snapshots.push(record.snapshot),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable snapshot"),
            }
        }
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    /// Unified diff from snapshot `a` to snapshot `b`. Binary files are skipped.
    pub fn diff(&self, a: &str, b: &str) -> Result<Patch> {
        let old = self.load(&self.resolve(a)?.id)?.manifest;
        let new = self.load(&self.resolve(b)?.id)?.manifest;

        let paths: BTreeSet<&PathBuf> = old.files.keys().chain(new.files.keys()).collect();
        let mut text = String::new();

        for path in paths {
            let before = old.files.get(path);
            let after = new.files.get(path);
            if before.map(|e| &e.hash) == after.map(|e| &e.hash) {
                continue;
            }

            let read = |entry: Option<&store::Entry>| -> Result<Option<String>> {
                match entry {
                    Some(e) if e.kind == EntryKind::File => {
                        Ok(String::from_utf8(self.objects.retrieve(&e.hash)?).ok())
                    }
                    Some(_) => Ok(None),
                    None => Ok(Some(String::new())),
                }
            };
            let (Some(old_text), Some(new_text)) = (read(before)?, read(after)?) else {
                tracing::debug!(path = %path.display(), "skipping non-text file in diff");
                continue;
            };

            let rendered = diffy::create_patch(&old_text, &new_text).to_string();
            let body: Vec<&str> = rendered.lines().skip(2).collect();
            if body.is_empty() {
                continue;
            }

            let display = path.display();
            text.push_str(&match before {
                Some(_) => format!("--- a/{}\n", display),
                None => "--- /dev/null\n".to_string(),
            });
            text.push_str(&match after {
                Some(_) => format!("+++ b/{}\n", display),
                None => "+++ /dev/null\n".to_string(),
            });
            for line in body {
                text.push_str(line);
                text.push('\n');
            }
        }

        if text.is_empty() {
            return Ok(Patch { files: Vec::new() });
        }
        Patch::parse(&text)
    }

    /// Whether the live tree currently equals snapshot `id`
    pub fn matches_tree(&self, id: &str) -> Result<bool> {
        let record = self.load(id)?;
        Ok(self.scanner.fingerprint()? == record.manifest)
    }

    /// Make the tree byte-identical to snapshot `id`.
    ///
    /// Every object is read and verified before the tree is touched. If
    /// writing fails partway, the pre-restore state is written back; only
    /// when that also fails is `RestoreFailed` returned.
    pub fn restore(&self, id: &str) -> Result<()> {
        let snapshot = self.resolve(id)?;
        let target = self.load(&snapshot.id)?.manifest;
        let mut blobs = self.load_blobs(&target)?;

        let undo = self.scanner.capture(&self.objects)?;
        if undo == target {
            tracing::info!(snapshot_id = %snapshot.id, "tree already matches snapshot");
            return Ok(());
        }
        blobs.extend(self.load_blobs(&undo)?);

        let attempt = self
            .scanner
            .write(&target, &blobs)
            .and_then(|_| self.verify(&target));
        match attempt {
            Ok(()) => {
                tracing::info!(snapshot_id = %snapshot.id, "snapshot restored");
                Ok(())
            }
            Err(e) => {
                tracing::error!(snapshot_id = %snapshot.id, error = %e, "restore failed, reverting");
                match self.scanner.write(&undo, &blobs).and_then(|_| self.verify(&undo)) {
                    Ok(()) => Err(PilotError::Snapshot(format!(
                        "restore of {} failed, tree left unchanged: {}",
                        snapshot.id, e
                    ))),
                    Err(undo_err) => Err(PilotError::RestoreFailed(format!(
                        "restore of {} failed ({}) and reverting failed ({})",
                        snapshot.id, e, undo_err
                    ))),
                }
            }
        }
    }

    fn load_blobs(&self, manifest: &Manifest) -> Result<HashMap<String, Vec<u8>>> {
        manifest
            .hashes()
            .map(|h| Ok((h.to_string(), self.objects.retrieve(h)?)))
            .collect()
    }

    fn verify(&self, expected: &Manifest) -> Result<()> {
        if self.scanner.fingerprint()? == *expected {
            Ok(())
        } else {
            Err(PilotError::Snapshot("tree does not match manifest after write".to_string()))
        }
    }

    pub fn baseline(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.dir.join("BASELINE")) {
            Ok(id) => Ok(Some(id.trim().to_string()).filter(|s| !s.is_empty())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_baseline(&self, id: &str) -> Result<()> {
        let path = self.dir.join("BASELINE");
        let tmp = self.dir.join("BASELINE.tmp");
        fs::write(&tmp, id)?;
        fs::rename(&tmp, &path)?;
        tracing::info!(snapshot_id = id, "baseline updated");
        Ok(())
    }

    /// Protect a snapshot from pruning while a transaction uses it
    pub fn pin(&self, id: &str) -> Result<()> {
        fs::write(self.dir.join("pins").join(id), b"")?;
        Ok(())
    }

    pub fn unpin(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.dir.join("pins").join(id)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn pinned(&self) -> Result<HashSet<String>> {
        let mut pins = HashSet::new();
        for entry in fs::read_dir(self.dir.join("pins"))? {
            pins.insert(entry?.file_name().to_string_lossy().to_string());
        }
        Ok(pins)
    }

    /// Keep the newest `keep` snapshots plus the baseline and any pinned ones
    pub fn prune(&self, keep: usize) -> Result<PruneReport> {
        let baseline = self.baseline()?;
        let pinned = self.pinned()?;
        let mut report = PruneReport::default();

        for snapshot in self.list()?.into_iter().skip(keep) {
            if baseline.as_deref() == Some(snapshot.id.as_str()) || pinned.contains(&snapshot.id) {
                continue;
            }
            fs::remove_file(self.manifest_path(&snapshot.id))?;
            report.removed.push(snapshot.id);
        }

        let mut live = HashSet::new();
        for snapshot in self.list()? {
            let record = self.load(&snapshot.id)?;
            live.extend(record.manifest.hashes().map(str::to_string));
        }
        report.objects_removed = self.objects.gc(&live)?;

        tracing::info!(
            removed = report.removed.len(),
            objects_removed = report.objects_removed,
            "snapshots pruned"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        store: SnapshotStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("etc-nixos");
        let state = dir.path().join("state");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("configuration.nix"), "{ pkgs, ... }:\n{\n  services.nginx.enable = false;\n}\n").unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();

        let store = SnapshotStore::open(&root, &state, &[".git".to_string()]).unwrap();
        Fixture {
            _dir: dir,
            root,
            store,
        }
    }

    #[test]
    fn test_restore_of_fresh_snapshot_is_noop() {
        let f = fixture();
        let snapshot = f.store.create("pre", None).unwrap();
        let before = fs::read(f.root.join("configuration.nix")).unwrap();

        f.store.restore(&snapshot.id).unwrap();
        assert_eq!(fs::read(f.root.join("configuration.nix")).unwrap(), before);
        assert!(f.store.matches_tree(&snapshot.id).unwrap());
    }

    #[test]
    fn test_restore_is_exact_and_idempotent() {
        let f = fixture();
        let snapshot = f.store.create("pre", Some("tx-1")).unwrap();
        let original = fs::read(f.root.join("configuration.nix")).unwrap();

        fs::write(f.root.join("configuration.nix"), "broken").unwrap();
        fs::write(f.root.join("extra.nix"), "{ }").unwrap();

        f.store.restore(&snapshot.id).unwrap();
        assert_eq!(fs::read(f.root.join("configuration.nix")).unwrap(), original);
        assert!(!f.root.join("extra.nix").exists());

        f.store.restore(&snapshot.id).unwrap();
        assert_eq!(fs::read(f.root.join("configuration.nix")).unwrap(), original);
        assert!(f.store.matches_tree(&snapshot.id).unwrap());
        // Excluded paths survive
        assert!(f.root.join(".git/HEAD").exists());
    }

    #[test]
    fn test_restore_with_corrupt_object_leaves_tree_untouched() {
        let f = fixture();
        let snapshot = f.store.create("pre", None).unwrap();
        fs::write(f.root.join("configuration.nix"), "changed").unwrap();

        let record = f.store.load(&snapshot.id).unwrap();
        let hash = record.manifest.hashes().next().unwrap().to_string();
        fs::write(f.store.objects.hash_to_path(&hash), "corrupt").unwrap();

        assert!(f.store.restore(&snapshot.id).is_err());
        assert_eq!(fs::read_to_string(f.root.join("configuration.nix")).unwrap(), "changed");
    }

    #[test]
    fn test_list_newest_first_with_parents() {
        let f = fixture();
        let first = f.store.create("one", None).unwrap();
        let second = f.store.create("two", None).unwrap();

        let list = f.store.list().unwrap();
        assert_eq!(list[0].id, second.id);
        assert_eq!(list[1].id, first.id);
        assert_eq!(second.parent_id.as_deref(), Some(first.id.as_str()));
    }

    #[test]
    fn test_resolve_prefix_and_missing() {
        let f = fixture();
        let snapshot = f.store.create("one", None).unwrap();
        assert_eq!(f.store.resolve(&snapshot.id[..20]).unwrap().id, snapshot.id);
        assert!(matches!(
            f.store.resolve("nope"),
            Err(PilotError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_diff_between_snapshots() {
        let f = fixture();
        let a = f.store.create("a", None).unwrap();
        fs::write(
            f.root.join("configuration.nix"),
            "{ pkgs, ... }:\n{\n  services.nginx.enable = true;\n}\n",
        )
        .unwrap();
        fs::write(f.root.join("new.nix"), "{ }\n").unwrap();
        let b = f.store.create("b", None).unwrap();

        let patch = f.store.diff(&a.id, &b.id).unwrap();
        assert_eq!(patch.files.len(), 2);
        let summary = patch.summary();
        assert_eq!(summary.lines_added, 2);
        assert_eq!(summary.lines_removed, 1);
        assert!(patch.files.iter().any(|f| f.new_file));

        assert!(f.store.diff(&a.id, &a.id).unwrap().is_empty());
    }

    #[test]
    fn test_prune_keeps_baseline_and_pinned() {
        let f = fixture();
        let base = f.store.create("base", None).unwrap();
        f.store.set_baseline(&base.id).unwrap();
        fs::write(f.root.join("a.nix"), "a").unwrap();
        let pinned = f.store.create("pinned", Some("tx")).unwrap();
        f.store.pin(&pinned.id).unwrap();
        fs::write(f.root.join("b.nix"), "b").unwrap();
        let dropped = f.store.create("dropped", None).unwrap();
        fs::write(f.root.join("c.nix"), "c").unwrap();
        let newest = f.store.create("newest", None).unwrap();

        let report = f.store.prune(1).unwrap();
        assert_eq!(report.removed, vec![dropped.id.clone()]);

        let ids: Vec<String> = f.store.list().unwrap().into_iter().map(|s| s.id).collect();
        assert!(ids.contains(&base.id));
        assert!(ids.contains(&pinned.id));
        assert!(ids.contains(&newest.id));

        // Objects shared with surviving snapshots stay readable
        f.store.restore(&base.id).unwrap();
        assert!(!f.root.join("a.nix").exists());
    }
}
