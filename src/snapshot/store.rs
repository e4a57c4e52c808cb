//! Change-history primitives: a content-addressed object store plus the
//! scanner that commits a tree into it and checks a tree back out.
//!
//! Objects live at `objects/{first2}/{rest}` keyed by SHA-256, the same
//! layout git uses for loose objects.

use crate::error::{PilotError, Result};
use crate::hash::sha256_hex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    /// Content is the link target
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    pub hash: String,
    pub mode: u32,
}

/// Captured tree state: every file (relative path) plus every directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub files: BTreeMap<PathBuf, Entry>,
    pub dirs: BTreeSet<PathBuf>,
}

impl Manifest {
    /// Content reference: hash of the canonical manifest
    pub fn digest(&self) -> Result<String> {
        Ok(sha256_hex(&serde_json::to_vec(self)?))
    }

    pub fn hashes(&self) -> impl Iterator<Item = &str> {
        self.files.values().map(|e| e.hash.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ObjectStore {
    dir: PathBuf,
}

impl ObjectStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Store content and return its hash. Existing objects are not rewritten.
    pub fn store(&self, content: &[u8]) -> Result<String> {
        let hash = sha256_hex(content);
        let path = self.hash_to_path(&hash);
        if path.exists() {
            return Ok(hash);
        }

        let parent = path
            .parent()
            .ok_or_else(|| PilotError::Snapshot(format!("bad object path {}", path.display())))?;
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| PilotError::Io(e.error))?;

        tracing::trace!(hash = %hash, bytes = content.len(), "stored object");
        Ok(hash)
    }

    /// Read an object back, verifying its hash
    pub fn retrieve(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.hash_to_path(hash);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PilotError::Snapshot(format!("object {} is missing", hash)));
            }
            Err(e) => return Err(e.into()),
        };

        let actual = sha256_hex(&content);
        if actual != hash {
            return Err(PilotError::Snapshot(format!(
                "object {} is corrupt (hashes to {})",
                hash, actual
            )));
        }
        Ok(content)
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.hash_to_path(hash).exists()
    }

    pub fn hash_to_path(&self, hash: &str) -> PathBuf {
        if hash.len() < 2 {
            return self.dir.join(hash);
        }
        let (prefix, rest) = hash.split_at(2);
        self.dir.join(prefix).join(rest)
    }

    /// Delete every object not in `live`. Returns how many were removed.
    pub fn gc(&self, live: &HashSet<String>) -> Result<usize> {
        let mut removed = 0;
        for entry in WalkDir::new(&self.dir).min_depth(2).max_depth(2) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let prefix = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let hash = format!("{}{}", prefix, entry.file_name().to_string_lossy());
            if !live.contains(&hash) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Walks the configuration tree, honoring exclude globs
#[derive(Debug, Clone)]
pub struct TreeScanner {
    root: PathBuf,
    excludes: Vec<glob::Pattern>,
}

struct Found {
    rel: PathBuf,
    abs: PathBuf,
    kind: EntryKind,
}

impl TreeScanner {
    pub fn new(root: PathBuf, excludes: &[String]) -> Result<Self> {
        let excludes = excludes
            .iter()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| PilotError::Config(format!("bad exclude pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { root, excludes })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_excluded(&self, rel: &Path) -> bool {
        self.excludes.iter().any(|p| p.matches_path(rel))
    }

    fn walk(&self) -> Result<(Vec<Found>, BTreeSet<PathBuf>)> {
        let mut files = Vec::new();
        let mut dirs = BTreeSet::new();
        if !self.root.exists() {
            return Ok((files, dirs));
        }

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| {
                e.path()
                    .strip_prefix(&self.root)
                    .map(|rel| !self.is_excluded(rel))
                    .unwrap_or(false)
            });

        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| PilotError::Snapshot(e.to_string()))?
                .to_path_buf();
            let file_type = entry.file_type();
            if file_type.is_dir() {
                dirs.insert(rel);
            } else if file_type.is_symlink() {
                files.push(Found {
                    rel,
                    abs: entry.path().to_path_buf(),
                    kind: EntryKind::Symlink,
                });
            } else if file_type.is_file() {
                files.push(Found {
                    rel,
                    abs: entry.path().to_path_buf(),
                    kind: EntryKind::File,
                });
            }
        }
        Ok((files, dirs))
    }

    /// Hash every file in parallel, passing each content through `sink`
    fn scan<F>(&self, sink: F) -> Result<Manifest>
    where
        F: Fn(&[u8]) -> Result<String> + Sync,
    {
        let (found, dirs) = self.walk()?;
        let files = found
            .par_iter()
            .map(|f| -> Result<(PathBuf, Entry)> {
                let content = match f.kind {
                    EntryKind::File => fs::read(&f.abs)?,
                    EntryKind::Symlink => fs::read_link(&f.abs)?.as_os_str().as_bytes().to_vec(),
                };
                let mode = fs::symlink_metadata(&f.abs)?.permissions().mode() & 0o7777;
                let hash = sink(&content)?;
                Ok((
                    f.rel.clone(),
                    Entry {
                        kind: f.kind,
                        hash,
                        mode,
                    },
                ))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Manifest { files, dirs })
    }

    /// Commit the current tree into `objects`
    pub fn capture(&self, objects: &ObjectStore) -> Result<Manifest> {
        self.scan(|content| objects.store(content))
    }

    /// Current tree state without storing anything
    pub fn fingerprint(&self) -> Result<Manifest> {
        self.scan(|content| Ok(sha256_hex(content)))
    }

    /// Check out `manifest`: write its files (temp file + rename each),
    /// delete files and directories it does not list. Excluded paths are
    /// left alone.
    pub fn write(&self, manifest: &Manifest, blobs: &HashMap<String, Vec<u8>>) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let (current, current_dirs) = self.walk()?;

        // Make room where a directory now has to become a file
        for dir in current_dirs.iter().rev() {
            if manifest.files.contains_key(dir) {
                fs::remove_dir_all(self.root.join(dir))?;
            }
        }
        for dir in &manifest.dirs {
            let path = self.root.join(dir);
            if path.symlink_metadata().is_ok_and(|m| !m.is_dir()) {
                fs::remove_file(&path)?;
            }
            fs::create_dir_all(path)?;
        }

        for (rel, entry) in &manifest.files {
            let dest = self.root.join(rel);
            let content = blobs.get(&entry.hash).ok_or_else(|| {
                PilotError::Snapshot(format!("no content loaded for {}", rel.display()))
            })?;
            let parent = dest
                .parent()
                .ok_or_else(|| PilotError::Snapshot(format!("bad path {}", dest.display())))?;
            fs::create_dir_all(parent)?;

            match entry.kind {
                EntryKind::File => {
                    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
                    tmp.write_all(content)?;
                    tmp.as_file().sync_all()?;
                    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(entry.mode))?;
                    tmp.persist(&dest).map_err(|e| PilotError::Io(e.error))?;
                }
                EntryKind::Symlink => {
                    if dest.symlink_metadata().is_ok() {
                        fs::remove_file(&dest)?;
                    }
                    let target = PathBuf::from(std::ffi::OsStr::from_bytes(content));
                    std::os::unix::fs::symlink(target, &dest)?;
                }
            }
        }

        for found in current {
            if !manifest.files.contains_key(&found.rel) && found.abs.symlink_metadata().is_ok() {
                fs::remove_file(&found.abs)?;
            }
        }

        for dir in current_dirs.iter().rev() {
            if manifest.dirs.contains(dir) || manifest.files.contains_key(dir) {
                continue;
            }
            // Still holds excluded files: keep it
            if let Err(e) = fs::remove_dir(self.root.join(dir)) {
                tracing::debug!(dir = %dir.display(), error = %e, "leaving directory in place");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_store_dedup_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path().join("objects")).unwrap();

        let a = store.store(b"hello").unwrap();
        let b = store.store(b"hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.retrieve(&a).unwrap(), b"hello");

        fs::write(store.hash_to_path(&a), b"tampered").unwrap();
        assert!(store.retrieve(&a).is_err());
    }

    #[test]
    fn test_gc_removes_unreferenced() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path().join("objects")).unwrap();
        let keep = store.store(b"keep").unwrap();
        let drop = store.store(b"drop").unwrap();

        let live: HashSet<String> = [keep.clone()].into_iter().collect();
        assert_eq!(store.gc(&live).unwrap(), 1);
        assert!(store.exists(&keep));
        assert!(!store.exists(&drop));
    }

    #[test]
    fn test_capture_skips_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::create_dir_all(root.join("hosts")).unwrap();
        fs::write(root.join(".git/HEAD"), "ref").unwrap();
        fs::write(root.join("configuration.nix"), "{ }\n").unwrap();
        fs::write(root.join("hosts/desktop.nix"), "{ }\n").unwrap();

        let scanner = TreeScanner::new(root, &[".git".to_string()]).unwrap();
        let manifest = scanner.fingerprint().unwrap();

        assert_eq!(manifest.files.len(), 2);
        assert!(manifest.files.contains_key(Path::new("hosts/desktop.nix")));
        assert!(manifest.dirs.contains(Path::new("hosts")));
        assert!(!manifest.dirs.contains(Path::new(".git")));
    }

    #[test]
    fn test_write_restores_exact_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir_all(root.join("modules")).unwrap();
        fs::write(root.join("configuration.nix"), "original\n").unwrap();
        fs::write(root.join("modules/a.nix"), "a\n").unwrap();

        let objects = ObjectStore::new(dir.path().join("objects")).unwrap();
        let scanner = TreeScanner::new(root.clone(), &[]).unwrap();
        let manifest = scanner.capture(&objects).unwrap();

        fs::write(root.join("configuration.nix"), "changed\n").unwrap();
        fs::remove_file(root.join("modules/a.nix")).unwrap();
        fs::create_dir_all(root.join("extra")).unwrap();
        fs::write(root.join("extra/new.nix"), "new\n").unwrap();

        let blobs: HashMap<String, Vec<u8>> = manifest
            .hashes()
            .map(|h| (h.to_string(), objects.retrieve(h).unwrap()))
            .collect();
        scanner.write(&manifest, &blobs).unwrap();

        assert_eq!(scanner.fingerprint().unwrap(), manifest);
        assert!(!root.join("extra").exists());
    }
}
