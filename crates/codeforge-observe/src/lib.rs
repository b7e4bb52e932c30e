//! Ambient logging for every other component.
//!
//! Every "log and continue" path in the edit pipeline routes through an
//! [`Observer`] instead of calling `eprintln!` directly, so log output is
//! centralized in one append-only file per workspace and is testable without
//! capturing process stdio.

use anyhow::Result;
use chrono::Utc;
use codeforge_core::runtime_dir;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Appends timestamped lines to `.codeforge/<fileName>` and, when verbose
/// mode is on, echoes them to stderr too. Constructed once per workspace.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path, file_name: &str, verbose: bool) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join(file_name),
            verbose,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Informational line: always written to the log, echoed to stderr only
    /// when verbose.
    pub fn info(&self, msg: &str) {
        let _ = self.append("INFO", msg);
        if self.verbose {
            eprintln!("[codeforge] {msg}");
        }
    }

    /// A "log and continue" diagnostic for an isolated failure (one file in a
    /// walk, one edit in a batch, one snapshot restore). Always written to
    /// the log and always echoed, since these are the errors §7 says must
    /// never be silent even outside verbose mode.
    pub fn warn(&self, msg: &str) {
        eprintln!("[codeforge WARN] {msg}");
        let _ = self.append("WARN", msg);
    }

    /// A fatal error for the current turn (envelope parse failure, gateway
    /// error). Logged the same way as `warn`; callers still propagate the
    /// error themselves.
    pub fn error(&self, msg: &str) {
        eprintln!("[codeforge ERROR] {msg}");
        let _ = self.append("ERROR", msg);
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn append(&self, level: &str, msg: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{} {level} {msg}", Utc::now().to_rfc3339())?;
        Ok(())
    }
}
