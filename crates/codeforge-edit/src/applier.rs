//! Executes a parsed edit list against a workspace: full-file write,
//! AST-directed block replace, or delete. Triggers a post-apply snapshot
//! when at least one edit actually changed the workspace.

use codeforge_core::{EditKind, FULLFILE_PATH, FileEdit};
use codeforge_observe::Observer;
use codeforge_structure::{ReplaceOutcome, is_parsable_extension, replace_block};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Outcome of one [`FileEdit`] as applied to the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyStatus {
    Applied,
    Deleted,
    /// File targeted by a `delete` edit did not exist; not an error.
    AlreadyAbsent,
    /// Block path could not be resolved or its `$line:` suffix no longer
    /// matched the live file; the file was left untouched.
    Skipped(String),
    /// Filesystem read/write error isolated to this one edit.
    Io(String),
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub path: String,
    pub kind: EditKind,
    pub status: ApplyStatus,
}

impl ApplyOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, ApplyStatus::Applied | ApplyStatus::Deleted)
    }
}

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub outcomes: Vec<ApplyOutcome>,
}

impl ApplyReport {
    pub fn any_succeeded(&self) -> bool {
        self.outcomes.iter().any(ApplyOutcome::succeeded)
    }
}

pub struct EditApplier<'a> {
    workspace: PathBuf,
    observer: Option<&'a Observer>,
}

impl<'a> EditApplier<'a> {
    pub fn new(workspace: PathBuf, observer: Option<&'a Observer>) -> Self {
        Self { workspace, observer }
    }

    /// Applies `edits` in the given order. Per-file errors (including a
    /// `$line:` content mismatch) are logged and isolated; sibling edits
    /// still run. Multiple block edits targeting the same file compose: the
    /// file is read once into an in-memory cache and only flushed to disk
    /// after its last edit in the batch.
    pub fn apply(&self, edits: &[FileEdit]) -> ApplyReport {
        let mut cache: HashMap<String, String> = HashMap::new();
        let mut dirty: Vec<String> = Vec::new();
        let mut outcomes = Vec::with_capacity(edits.len());

        for edit in edits {
            let status = match edit.kind {
                EditKind::Delete => self.apply_delete(edit),
                EditKind::Update if edit.is_full_file() => {
                    cache.remove(&edit.path);
                    self.apply_full_file(edit)
                }
                EditKind::Update => self.apply_block(edit, &mut cache, &mut dirty),
            };
            outcomes.push(ApplyOutcome {
                path: edit.path.clone(),
                kind: edit.kind,
                status,
            });
        }

        for path in dirty {
            if let Some(text) = cache.get(&path) {
                let target = self.workspace.join(&path);
                if let Err(err) = write_all(&target, text) {
                    self.log_warn(&format!("failed to write {path}: {err}"));
                }
            }
        }

        ApplyReport { outcomes }
    }

    fn apply_delete(&self, edit: &FileEdit) -> ApplyStatus {
        let target = self.workspace.join(&edit.path);
        if !target.exists() {
            self.log_warn(&format!(
                "delete for {} skipped: file does not exist",
                edit.path
            ));
            return ApplyStatus::AlreadyAbsent;
        }
        match fs::remove_file(&target) {
            Ok(()) => ApplyStatus::Deleted,
            Err(err) => {
                self.log_warn(&format!("failed to delete {}: {err}", edit.path));
                ApplyStatus::Io(err.to_string())
            }
        }
    }

    fn apply_full_file(&self, edit: &FileEdit) -> ApplyStatus {
        let Some(content) = edit.content.as_deref() else {
            self.log_warn(&format!("update for {} has no content, skipped", edit.path));
            return ApplyStatus::Skipped("missing content".to_string());
        };
        let target = self.workspace.join(&edit.path);
        match write_all(&target, content) {
            Ok(()) => ApplyStatus::Applied,
            Err(err) => {
                self.log_warn(&format!("failed to write {}: {err}", edit.path));
                ApplyStatus::Io(err.to_string())
            }
        }
    }

    fn apply_block(
        &self,
        edit: &FileEdit,
        cache: &mut HashMap<String, String>,
        dirty: &mut Vec<String>,
    ) -> ApplyStatus {
        let Some(new_block) = edit.content.as_deref() else {
            return ApplyStatus::Skipped("missing content".to_string());
        };
        let block_path = edit.block_path.as_deref().unwrap_or(FULLFILE_PATH);

        if !cache.contains_key(&edit.path) {
            let target = self.workspace.join(&edit.path);
            match fs::read_to_string(&target) {
                Ok(text) => {
                    cache.insert(edit.path.clone(), text);
                }
                Err(err) => {
                    self.log_warn(&format!("failed to read {} for block edit: {err}", edit.path));
                    return ApplyStatus::Io(err.to_string());
                }
            }
        }

        let ext = extension_of(&edit.path);
        if !is_parsable_extension(&ext) {
            self.log_warn(&format!(
                "{} has no parsable structural index, treating block edit as full-file write",
                edit.path
            ));
            cache.insert(edit.path.clone(), new_block.to_string());
            if !dirty.contains(&edit.path) {
                dirty.push(edit.path.clone());
            }
            return ApplyStatus::Applied;
        }

        let current = cache.get(&edit.path).expect("just populated").clone();
        match replace_block(&current, &ext, block_path, new_block) {
            Ok(ReplaceOutcome::Applied(rewritten)) => {
                cache.insert(edit.path.clone(), rewritten);
                if !dirty.contains(&edit.path) {
                    dirty.push(edit.path.clone());
                }
                ApplyStatus::Applied
            }
            Ok(ReplaceOutcome::Skipped(reason)) => {
                self.log_warn(&format!(
                    "block edit for {} ({block_path}) skipped: {reason}",
                    edit.path
                ));
                ApplyStatus::Skipped(reason)
            }
            Err(err) => {
                self.log_warn(&format!(
                    "block edit for {} ({block_path}) failed to parse: {err}",
                    edit.path
                ));
                ApplyStatus::Skipped(err.to_string())
            }
        }
    }

    fn log_warn(&self, msg: &str) {
        if let Some(observer) = self.observer {
            observer.warn(msg);
        }
    }
}

fn extension_of(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn write_all(target: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(target, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeforge_core::EditKind;
    use std::fs;

    fn temp_workspace(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("codeforge-applier-{tag}-{}", now_nanos()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn now_nanos() -> u128 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()
    }

    fn update(path: &str, block_path: Option<&str>, content: &str) -> FileEdit {
        FileEdit {
            kind: EditKind::Update,
            path: path.to_string(),
            description: String::new(),
            block_path: block_path.map(str::to_string),
            content: Some(content.to_string()),
        }
    }

    fn delete(path: &str) -> FileEdit {
        FileEdit {
            kind: EditKind::Delete,
            path: path.to_string(),
            description: String::new(),
            block_path: None,
            content: None,
        }
    }

    #[test]
    fn full_file_update_writes_and_creates_dirs() {
        let ws = temp_workspace("full");
        let applier = EditApplier::new(ws.clone(), None);
        let edit = update("src/new.ts", None, "export const a = 1;\n");
        let report = applier.apply(&[edit]);
        assert!(report.any_succeeded());
        assert_eq!(
            fs::read_to_string(ws.join("src/new.ts")).unwrap(),
            "export const a = 1;\n"
        );
    }

    #[test]
    fn delete_removes_existing_file() {
        let ws = temp_workspace("delete");
        fs::write(ws.join("a.ts"), "x").unwrap();
        let applier = EditApplier::new(ws.clone(), None);
        let report = applier.apply(&[delete("a.ts")]);
        assert!(report.any_succeeded());
        assert!(!ws.join("a.ts").exists());
    }

    #[test]
    fn delete_missing_file_is_not_an_error() {
        let ws = temp_workspace("delete-missing");
        let applier = EditApplier::new(ws.clone(), None);
        let report = applier.apply(&[delete("gone.ts")]);
        assert!(!report.any_succeeded());
        assert_eq!(report.outcomes[0].status, ApplyStatus::AlreadyAbsent);
    }

    #[test]
    fn block_edit_s1_replaces_named_function() {
        let ws = temp_workspace("block-s1");
        fs::write(
            ws.join("a.ts"),
            "export function greet() { return \"hi\"; }\nexport const X = 1;\n",
        )
        .unwrap();
        let applier = EditApplier::new(ws.clone(), None);
        let edit = update(
            "a.ts",
            Some("greet"),
            "export function greet() { return \"hello\"; }",
        );
        let report = applier.apply(&[edit]);
        assert!(report.any_succeeded());
        assert_eq!(
            fs::read_to_string(ws.join("a.ts")).unwrap(),
            "export function greet() { return \"hello\"; }\n\nexport const X = 1;\n"
        );
    }

    #[test]
    fn block_edit_s3_mismatch_is_skipped_and_file_untouched() {
        let ws = temp_workspace("block-s3");
        fs::write(ws.join("a.js"), "console.log(\"old\");\n").unwrap();
        let applier = EditApplier::new(ws.clone(), None);
        let edit = update(
            "a.js",
            Some("$line:1:console.log(\"different\")"),
            "console.log(\"new\");",
        );
        let report = applier.apply(&[edit]);
        assert!(!report.any_succeeded());
        assert!(matches!(report.outcomes[0].status, ApplyStatus::Skipped(_)));
        assert_eq!(fs::read_to_string(ws.join("a.js")).unwrap(), "console.log(\"old\");\n");
    }

    #[test]
    fn multiple_block_edits_on_one_file_compose() {
        let ws = temp_workspace("compose");
        fs::write(
            ws.join("a.ts"),
            "export function greet() { return 1; }\nexport const X = 1;\n",
        )
        .unwrap();
        let applier = EditApplier::new(ws.clone(), None);
        let edits = vec![
            update("a.ts", Some("greet"), "export function greet() { return 2; }"),
            update("a.ts", Some("X"), "export const X = 99;"),
        ];
        let report = applier.apply(&edits);
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.any_succeeded());
        let result = fs::read_to_string(ws.join("a.ts")).unwrap();
        assert!(result.contains("return 2;"));
        assert!(result.contains("X = 99;"));
    }

    #[test]
    fn sibling_edit_errors_do_not_stop_the_batch() {
        let ws = temp_workspace("sibling");
        fs::write(ws.join("b.ts"), "export const b = 1;\n").unwrap();
        let applier = EditApplier::new(ws.clone(), None);
        let edits = vec![
            update("does/not/exist.ts", Some("missing"), "x"),
            update("b.ts", None, "export const b = 2;\n"),
        ];
        let report = applier.apply(&edits);
        assert!(report.any_succeeded());
        assert_eq!(
            fs::read_to_string(ws.join("b.ts")).unwrap(),
            "export const b = 2;\n"
        );
    }
}
