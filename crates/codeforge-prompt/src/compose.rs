//! Builds the single string passed to the Model Gateway: the workspace
//! digest (with navigational block paths when the strategy calls for
//! them), followed by the user's instruction.

use codeforge_core::{CodeChangeStrategy, Config, FULLFILE_PATH, WorkspaceDigest};
use codeforge_errors::ConfigError;
use codeforge_observe::Observer;
use codeforge_structure::{is_parsable_extension, navigational_paths};
use codeforge_workspace::{IgnoreRules, WorkspaceReader};
use std::fs;
use std::path::{Path, PathBuf};

pub const USER_INSTRUCTION_HEADER: &str = "\n\n---User Instruction---\n";
pub const BLOCK_PATHS_HEADER_PREFIX: &str = "--- AVAILABLE CODE BLOCK PATHS for ";
pub const BLOCK_PATHS_HEADER_SUFFIX: &str = " ---\n";

const DEFAULT_SYSTEM_PROMPT_FULL: &str = include_str!("../prompts/system.full.default.txt");
const DEFAULT_SYSTEM_PROMPT_BLOCK: &str = include_str!("../prompts/system.block.default.txt");

pub struct ComposedPrompt {
    pub prompt: String,
    pub included_files: Vec<String>,
    /// The digest this prompt was built from, kept around so a caller can
    /// feed it straight into [`crate::prepare_history`] for the next turn.
    pub digest: WorkspaceDigest,
}

/// Per-file navigational paths advertised to the model for `block` strategy:
/// the real outline for parsable sources, `$fullfile` for anything else.
/// Computed once so both the Prompt Composer and the History Optimizer
/// agree on what "current" looks like for a given digest.
pub fn block_paths_for_digest(digest: &WorkspaceDigest) -> Vec<(String, Vec<String>)> {
    digest
        .files
        .iter()
        .map(|(path, text)| {
            let ext = extension_of(path);
            let paths = if is_parsable_extension(&ext) {
                navigational_paths(text, &ext)
                    .unwrap_or_else(|_| vec![FULLFILE_PATH.to_string()])
            } else {
                vec![FULLFILE_PATH.to_string()]
            };
            (path.clone(), paths)
        })
        .collect()
}

pub fn extension_of(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Assembles the full user-turn prompt from a digest and the user's text,
/// per §4.4: digest summary, then (for `block`) one block-paths section per
/// file, then the user instruction marker.
pub fn compose_user_prompt(
    digest: &WorkspaceDigest,
    strategy: CodeChangeStrategy,
    user_text: &str,
) -> String {
    let mut out = digest.summary.clone();

    if strategy == CodeChangeStrategy::Block {
        for (path, paths) in block_paths_for_digest(digest) {
            out.push('\n');
            out.push_str(BLOCK_PATHS_HEADER_PREFIX);
            out.push_str(&path);
            out.push_str(BLOCK_PATHS_HEADER_SUFFIX);
            for p in paths {
                out.push_str(&p);
                out.push('\n');
            }
        }
    }

    out.push_str(USER_INSTRUCTION_HEADER);
    out.push_str(user_text);
    out
}

/// Reads the workspace digest and composes the full prompt in one call.
pub fn compose(
    workspace: &Path,
    rules: IgnoreRules,
    strategy: CodeChangeStrategy,
    user_text: &str,
    observer: Option<&Observer>,
) -> ComposedPrompt {
    let reader = WorkspaceReader::new(workspace.to_path_buf(), rules, observer);
    let digest = reader.read();
    let prompt = compose_user_prompt(&digest, strategy, user_text);
    ComposedPrompt {
        prompt,
        included_files: digest.included_files.clone(),
        digest,
    }
}

/// Relative path (from the workspace root) of the system prompt file for
/// the active `(apiProvider, strategy)` pair, per the `modelParameters`/
/// `openaiParameters` config surface (§6).
pub fn system_prompt_relative_path(cfg: &Config) -> &str {
    let prompts = match cfg.api_provider {
        codeforge_core::ApiProvider::Gemini => &cfg.model_parameters.prompts,
        codeforge_core::ApiProvider::Openai => &cfg.openai_parameters.prompts,
    };
    match cfg.code_change_strategy {
        CodeChangeStrategy::Full => &prompts.full,
        CodeChangeStrategy::Block => &prompts.block,
    }
}

fn default_system_prompt(strategy: CodeChangeStrategy) -> &'static str {
    match strategy {
        CodeChangeStrategy::Full => DEFAULT_SYSTEM_PROMPT_FULL,
        CodeChangeStrategy::Block => DEFAULT_SYSTEM_PROMPT_BLOCK,
    }
}

/// Reads the system prompt once from the path named by `(apiProvider,
/// strategy)`. A missing file is a Config error: logged once and the
/// compiled-in default for the active strategy is used instead.
pub fn load_system_prompt(cfg: &Config, workspace: &Path, observer: Option<&Observer>) -> String {
    let rel = system_prompt_relative_path(cfg);
    let path: PathBuf = workspace.join(rel);
    match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(source) => {
            let err = ConfigError::Io {
                path: path.clone(),
                source,
            };
            if let Some(observer) = observer {
                observer.warn(&format!(
                    "{err}; falling back to compiled-in default system prompt"
                ));
            }
            default_system_prompt(cfg.code_change_strategy).to_string()
        }
    }
}
