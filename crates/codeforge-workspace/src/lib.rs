//! Walks a project tree honoring ignore rules and produces an ordered digest
//! of relative path → file text.

use codeforge_core::WorkspaceDigest;
use codeforge_errors::WorkspaceError;
use codeforge_observe::Observer;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::fs;
use std::path::{Path, PathBuf};

/// Default ignore-file names, mirroring `Config::workspace_ignore_files`.
pub const DEFAULT_PRIMARY_IGNORE_FILE: &str = ".codeforgeignore";
pub const DEFAULT_SECONDARY_IGNORE_FILE: &str = ".gitignore";

/// Union of gitignore-style rules loaded from the two optional ignore files
/// at a workspace root.
#[derive(Clone)]
pub struct IgnoreRules {
    matcher: Gitignore,
}

impl IgnoreRules {
    /// Loads and merges `<root>/<primary>` and `<root>/<secondary>`. A
    /// missing file contributes no rules; a present file is read line by
    /// line, skipping blank lines and `#` comments, the rest parsed with
    /// gitignore matching semantics (leading `/` anchors to root, no `/`
    /// matches at any depth, trailing `/` is directory-only).
    pub fn load(root: &Path, primary: &str, secondary: &str) -> Result<Self, WorkspaceError> {
        let mut builder = GitignoreBuilder::new(root);
        for file_name in [primary, secondary] {
            let path = root.join(file_name);
            if !path.exists() {
                continue;
            }
            let contents =
                fs::read_to_string(&path).map_err(|source| WorkspaceError::FileUnreadable {
                    path: path.clone(),
                    source,
                })?;
            for line in contents.lines() {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                if let Err(source) = builder.add_line(Some(path.clone()), line) {
                    return Err(WorkspaceError::InvalidIgnorePattern {
                        path,
                        pattern: line.to_string(),
                        source,
                    });
                }
            }
        }
        let matcher = builder
            .build()
            .map_err(|source| WorkspaceError::InvalidIgnorePattern {
                path: root.to_path_buf(),
                pattern: String::new(),
                source,
            })?;
        Ok(Self { matcher })
    }

    pub fn empty(root: &Path) -> Self {
        Self {
            matcher: GitignoreBuilder::new(root).build().expect("empty builder"),
        }
    }

    pub fn is_ignored(&self, rel_path: &Path, is_dir: bool) -> bool {
        self.matcher.matched(rel_path, is_dir).is_ignore()
    }
}

/// Recursively enumerates files under `root`, skipping anything matched by
/// `rules` (a matched directory prunes its whole subtree), and reads each
/// survivor as UTF-8 text.
pub struct WorkspaceReader<'a> {
    root: PathBuf,
    rules: IgnoreRules,
    observer: Option<&'a Observer>,
}

impl<'a> WorkspaceReader<'a> {
    pub fn new(root: PathBuf, rules: IgnoreRules, observer: Option<&'a Observer>) -> Self {
        Self {
            root,
            rules,
            observer,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rules(&self) -> &IgnoreRules {
        &self.rules
    }

    /// Produces the ordered digest. Failure to read the root itself yields
    /// an empty digest and a logged error, per §4.1; failures on individual
    /// files abort that file but not the walk.
    pub fn read(&self) -> WorkspaceDigest {
        if !self.root.exists() {
            self.log_warn(&format!(
                "workspace root unreadable: {}",
                self.root.display()
            ));
            return WorkspaceDigest::default();
        }

        let mut files = Vec::new();
        self.walk(&self.root, &mut files);
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let included_files: Vec<String> = files.iter().map(|(p, _)| p.clone()).collect();
        let summary = render_summary(&files);

        WorkspaceDigest {
            files,
            included_files,
            summary,
        }
    }

    fn walk(&self, dir: &Path, out: &mut Vec<(String, String)>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(source) => {
                self.log_warn(&format!(
                    "failed to list directory {}: {source}",
                    dir.display()
                ));
                return;
            }
        };

        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let Ok(rel) = path.strip_prefix(&self.root) else {
                continue;
            };
            let is_dir = path.is_dir();
            if self.rules.is_ignored(rel, is_dir) {
                continue;
            }
            if is_dir {
                self.walk(&path, out);
                continue;
            }
            if !path.is_file() {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(text) => {
                    out.push((to_forward_slashes(rel), text));
                }
                Err(source) => {
                    self.log_warn(&format!("failed to read {}: {source}", path.display()));
                }
            }
        }
    }

    fn log_warn(&self, msg: &str) {
        if let Some(observer) = self.observer {
            observer.warn(msg);
        }
    }
}

fn to_forward_slashes(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn render_summary(files: &[(String, String)]) -> String {
    let mut out = String::from("These are the existing files in the app:\n");
    for (path, text) in files {
        out.push('\n');
        out.push_str(&format!("--- START OF FILE {path} ---\n"));
        out.push_str(text);
        if !text.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}
