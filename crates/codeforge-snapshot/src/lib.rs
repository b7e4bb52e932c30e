//! Content-addressed copies of a workspace under named labels.
//!
//! A snapshot is a label plus a directory of copied files, stored in a
//! sibling `backups/` directory next to the workspace. Equivalence against
//! the most recent snapshot is checked before committing a new one so that
//! consecutive no-op turns don't grow the backup chain.

use codeforge_core::SnapshotResult;
use codeforge_errors::SnapshotError;
use codeforge_observe::Observer;
use codeforge_workspace::{IgnoreRules, WorkspaceReader};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub struct SnapshotStore<'a> {
    workspace: PathBuf,
    backups_dir: PathBuf,
    rules: IgnoreRules,
    observer: Option<&'a Observer>,
}

/// Content fingerprint of a tracked file set: sorted `(path, sha256)` pairs
/// hashed together. Used only as a cheap equivalence comparator — the
/// persisted artifact is always the plain file copy, never this hash.
fn workspace_state_digest(files: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = files
        .iter()
        .map(|(path, text)| (path.clone(), hex_sha256(text.as_bytes())))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (path, hash) in &pairs {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

impl<'a> SnapshotStore<'a> {
    pub fn new(workspace: PathBuf, rules: IgnoreRules, observer: Option<&'a Observer>) -> Self {
        let backups_dir = sibling_backups_dir(&workspace);
        Self {
            workspace,
            backups_dir,
            rules,
            observer,
        }
    }

    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    fn current_files(&self) -> Vec<(String, String)> {
        let reader =
            WorkspaceReader::new(self.workspace.clone(), self.rules.clone(), self.observer);
        reader.read().files
    }

    fn latest_label(&self) -> Result<Option<String>, SnapshotError> {
        let mut labels = self.list()?;
        Ok(labels.pop())
    }

    /// Lists existing snapshot labels, sorted lexicographically (which
    /// sorts by time given the ISO-prefixed label convention).
    pub fn list(&self) -> Result<Vec<String>, SnapshotError> {
        if !self.backups_dir.exists() {
            return Ok(Vec::new());
        }
        let entries =
            fs::read_dir(&self.backups_dir).map_err(|source| SnapshotError::CreateDir {
                path: self.backups_dir.clone(),
                source,
            })?;
        let mut labels = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            if entry.path().is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                labels.push(name.to_string());
            }
        }
        labels.sort();
        Ok(labels)
    }

    /// Creates a new snapshot labeled `label`. When `force` is false and a
    /// prior snapshot exists with an identical tracked file set and content,
    /// no directory is written and `{created: false}` is returned.
    pub fn create(&self, label: &str, force: bool) -> Result<SnapshotResult, SnapshotError> {
        let current = self.current_files();

        if !force
            && let Some(latest) = self.latest_label()?
        {
            let latest_files = self.read_snapshot_files(&latest)?;
            if files_equivalent(&current, &latest_files) {
                return Ok(SnapshotResult {
                    created: false,
                    label: latest,
                });
            }
        }

        let dest = self.backups_dir.join(label);
        fs::create_dir_all(&dest).map_err(|source| SnapshotError::CreateDir {
            path: dest.clone(),
            source,
        })?;

        for (rel_path, text) in &current {
            let target = dest.join(rel_path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|source| SnapshotError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            fs::write(&target, text).map_err(|source| SnapshotError::Copy {
                from: self.workspace.join(rel_path),
                to: target,
                source,
            })?;
        }

        Ok(SnapshotResult {
            created: true,
            label: label.to_string(),
        })
    }

    /// Restores `label`: removes every currently-tracked workspace file,
    /// then copies every file from the snapshot directory back. There is no
    /// transaction across the two phases; an I/O error midway is reported
    /// and the workspace may be left partially restored.
    pub fn restore(&self, label: &str) -> Result<(), SnapshotError> {
        let snapshot_dir = self.backups_dir.join(label);
        if !snapshot_dir.exists() {
            return Err(SnapshotError::NotFound {
                label: label.to_string(),
            });
        }

        for (rel_path, _) in self.current_files() {
            let target = self.workspace.join(&rel_path);
            if target.exists() {
                fs::remove_file(&target).map_err(|source| {
                    SnapshotError::RemoveDuringRestore {
                        path: target,
                        source,
                    }
                })?;
            }
        }

        let snapshot_files = self.read_snapshot_files(label)?;
        for (rel_path, text) in snapshot_files {
            let target = self.workspace.join(&rel_path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|source| SnapshotError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            fs::write(&target, text).map_err(|source| SnapshotError::Copy {
                from: snapshot_dir.join(&rel_path),
                to: target,
                source,
            })?;
        }

        Ok(())
    }

    fn read_snapshot_files(&self, label: &str) -> Result<Vec<(String, String)>, SnapshotError> {
        let dir = self.backups_dir.join(label);
        let mut out = Vec::new();
        collect_files(&dir, &dir, &mut out)?;
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

fn collect_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, String)>,
) -> Result<(), SnapshotError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(source) => {
            return Err(SnapshotError::Copy {
                from: dir.to_path_buf(),
                to: dir.to_path_buf(),
                source,
            });
        }
    };
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .expect("entry under root")
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let text = fs::read_to_string(&path).map_err(|source| SnapshotError::Copy {
            from: path.clone(),
            to: path.clone(),
            source,
        })?;
        out.push((rel, text));
    }
    Ok(())
}

fn files_equivalent(a: &[(String, String)], b: &[(String, String)]) -> bool {
    let mut a_paths: Vec<&String> = a.iter().map(|(p, _)| p).collect();
    let mut b_paths: Vec<&String> = b.iter().map(|(p, _)| p).collect();
    a_paths.sort();
    b_paths.sort();
    if a_paths != b_paths {
        return false;
    }
    workspace_state_digest(a) == workspace_state_digest(b)
}

/// Per §6: "Sibling directory of the workspace named `backups/`" — a single
/// fixed name next to the workspace root, not one scoped to the workspace's
/// own name.
fn sibling_backups_dir(workspace: &Path) -> PathBuf {
    let parent = workspace.parent().unwrap_or(workspace);
    parent.join("backups")
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeforge_workspace::{DEFAULT_PRIMARY_IGNORE_FILE, DEFAULT_SECONDARY_IGNORE_FILE};
    use std::fs;

    fn temp_workspace(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("codeforge-snapshot-{tag}-{}", now_nanos()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn now_nanos() -> u128 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    }

    fn rules_for(ws: &Path) -> IgnoreRules {
        IgnoreRules::load(ws, DEFAULT_PRIMARY_IGNORE_FILE, DEFAULT_SECONDARY_IGNORE_FILE).unwrap()
    }

    #[test]
    fn create_then_elide_no_op() {
        let ws = temp_workspace("elide");
        fs::write(ws.join("a.ts"), "hello").unwrap();
        let store = SnapshotStore::new(ws.clone(), rules_for(&ws), None);

        let a = store.create("A", false).unwrap();
        assert!(a.created);
        let b = store.create("B", false).unwrap();
        assert!(!b.created);
        assert!(store.backups_dir().join("A").exists());
        assert!(!store.backups_dir().join("B").exists());
    }

    #[test]
    fn force_always_creates() {
        let ws = temp_workspace("force");
        fs::write(ws.join("a.ts"), "hello").unwrap();
        let store = SnapshotStore::new(ws.clone(), rules_for(&ws), None);
        store.create("A", false).unwrap();
        let b = store.create("B", true).unwrap();
        assert!(b.created);
        assert!(store.backups_dir().join("B").exists());
    }

    #[test]
    fn create_detects_change_and_snapshots_again() {
        let ws = temp_workspace("change");
        fs::write(ws.join("a.ts"), "hello").unwrap();
        let store = SnapshotStore::new(ws.clone(), rules_for(&ws), None);
        store.create("A", false).unwrap();

        fs::write(ws.join("a.ts"), "changed").unwrap();
        let b = store.create("B", false).unwrap();
        assert!(b.created);
    }

    #[test]
    fn restore_brings_back_snapshot_contents() {
        let ws = temp_workspace("restore");
        fs::write(ws.join("a.ts"), "version one").unwrap();
        let store = SnapshotStore::new(ws.clone(), rules_for(&ws), None);
        store.create("A", false).unwrap();

        fs::write(ws.join("a.ts"), "version two").unwrap();
        fs::write(ws.join("b.ts"), "new file").unwrap();

        store.restore("A").unwrap();

        assert_eq!(fs::read_to_string(ws.join("a.ts")).unwrap(), "version one");
        assert!(!ws.join("b.ts").exists());
    }

    #[test]
    fn restore_missing_label_errors() {
        let ws = temp_workspace("missing");
        let store = SnapshotStore::new(ws.clone(), rules_for(&ws), None);
        let err = store.restore("nope").unwrap_err();
        assert!(matches!(err, SnapshotError::NotFound { .. }));
    }

    #[test]
    fn list_returns_sorted_labels() {
        let ws = temp_workspace("list");
        fs::write(ws.join("a.ts"), "1").unwrap();
        let store = SnapshotStore::new(ws.clone(), rules_for(&ws), None);
        store.create("2024-01-01T00:00:00_ai_change", false).unwrap();
        fs::write(ws.join("a.ts"), "2").unwrap();
        store.create("2024-01-02T00:00:00_ai_change", true).unwrap();

        let labels = store.list().unwrap();
        assert_eq!(
            labels,
            vec![
                "2024-01-01T00:00:00_ai_change".to_string(),
                "2024-01-02T00:00:00_ai_change".to_string(),
            ]
        );
    }
}
