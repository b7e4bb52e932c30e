//! Rewrites earlier turns of a conversation to collapse code the model has
//! already seen and that still matches the live workspace into a short
//! placeholder, bounding how much of the digest gets re-sent on every turn.
//!
//! Walks `newest -> oldest`. The newest turn is always sent verbatim — it
//! carries the digest the model is about to act on. Each older turn is
//! collapsed only if every file (and, for model turns, every proposed edit)
//! it references still matches the current workspace; the first turn where
//! that is not true stops the walk, leaving it and everything older intact.

use crate::compose::{BLOCK_PATHS_HEADER_PREFIX, USER_INSTRUCTION_HEADER, extension_of};
use codeforge_core::{CodeChangeStrategy, EditKind, FULLFILE_PATH, History, Message, MessageRole, WorkspaceDigest};
use codeforge_edit::parser;
use codeforge_structure::{ReplaceOutcome, is_parsable_extension, replace_block};
use std::collections::HashMap;
use std::ops::Range;

pub const FILE_BODY_PLACEHOLDER: &str = "[code is identical to current context]";
const ENVELOPE_PLACEHOLDER: &str = "<changes><!-- unchanged from current workspace --></changes>";
const FILE_SECTION_PREFIX: &str = "--- START OF FILE ";
const SECTION_MARKER_SUFFIX: &str = " ---";

/// Returns a new history with every collapsible older turn replaced by a
/// placeholder. `digest` is the current workspace state; `strategy`
/// determines whether block-path listings are also checked and collapsed.
pub fn optimize(history: &History, digest: &WorkspaceDigest, strategy: CodeChangeStrategy) -> History {
    let current_files: HashMap<&str, &str> = digest
        .files
        .iter()
        .map(|(path, text)| (path.as_str(), text.as_str()))
        .collect();
    let current_block_paths: HashMap<String, Vec<String>> = crate::compose::block_paths_for_digest(digest)
        .into_iter()
        .collect();

    let mut out = history.clone();
    if out.is_empty() {
        return out;
    }

    // The newest turn always stays verbatim.
    for i in (0..out.len() - 1).rev() {
        let collapsed = match out[i].role {
            MessageRole::Model => try_collapse_model_message(&out[i].text, &current_files),
            MessageRole::User => try_collapse_user_message(
                &out[i],
                &current_files,
                &current_block_paths,
                strategy,
            ),
        };
        match collapsed {
            Some(message) => out[i] = message,
            None => break,
        }
    }

    out
}

fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

fn try_collapse_model_message(text: &str, current_files: &HashMap<&str, &str>) -> Option<Message> {
    let envelope = parser::locate_envelope(text)?;
    let edits = parser::parse_envelope(envelope).ok()?;

    let all_match = edits
        .iter()
        .filter(|edit| edit.kind == EditKind::Update)
        .all(|edit| edit_matches_current(edit, current_files));
    if !all_match {
        return None;
    }

    let new_text = text.replacen(envelope, ENVELOPE_PLACEHOLDER, 1);
    Some(Message {
        role: MessageRole::Model,
        text: new_text,
        full_text: None,
    })
}

fn edit_matches_current(edit: &codeforge_core::FileEdit, current_files: &HashMap<&str, &str>) -> bool {
    let Some(live) = current_files.get(edit.path.as_str()) else {
        return false;
    };
    let content = edit.content.as_deref().unwrap_or("");

    match edit.block_path.as_deref() {
        None | Some(FULLFILE_PATH) => normalize(live) == normalize(content),
        Some(block_path) => {
            let ext = extension_of(&edit.path);
            if !is_parsable_extension(&ext) {
                return normalize(live) == normalize(content);
            }
            match replace_block(live, &ext, block_path, content) {
                // A proposed block edit "matches" the live file when applying
                // it is a no-op: the live file already reflects it.
                Ok(ReplaceOutcome::Applied(rewritten)) => normalize(&rewritten) == normalize(live),
                _ => false,
            }
        }
    }
}

fn try_collapse_user_message(
    msg: &Message,
    current_files: &HashMap<&str, &str>,
    current_block_paths: &HashMap<String, Vec<String>>,
    strategy: CodeChangeStrategy,
) -> Option<Message> {
    let source = msg.full_text.as_deref().unwrap_or(&msg.text);

    let file_sections = parse_sections(source, FILE_SECTION_PREFIX, &[BLOCK_PATHS_HEADER_PREFIX]);
    if file_sections.is_empty() {
        return None;
    }
    let referenced: std::collections::HashSet<&str> =
        file_sections.iter().map(|s| s.path.as_str()).collect();
    let current: std::collections::HashSet<&str> = current_files.keys().copied().collect();
    if referenced != current {
        return None;
    }
    for section in &file_sections {
        let live = current_files.get(section.path.as_str())?;
        let body = &source[section.body_range.clone()];
        if normalize(body) != normalize(live) {
            return None;
        }
    }

    let mut replacements: Vec<(Range<usize>, String)> = file_sections
        .iter()
        .map(|s| (s.body_range.clone(), format!("{FILE_BODY_PLACEHOLDER}\n")))
        .collect();

    if strategy == CodeChangeStrategy::Block {
        let block_sections = parse_sections(source, BLOCK_PATHS_HEADER_PREFIX, &[]);
        let block_referenced: std::collections::HashSet<&str> =
            block_sections.iter().map(|s| s.path.as_str()).collect();
        if block_referenced != current {
            return None;
        }
        for section in &block_sections {
            let listed: Vec<&str> = source[section.body_range.clone()]
                .lines()
                .filter(|l| !l.trim().is_empty())
                .collect();
            let Some(expected) = current_block_paths.get(section.path.as_str()) else {
                return None;
            };
            if listed != expected.as_slice() {
                return None;
            }
        }
        replacements.extend(
            block_sections
                .iter()
                .map(|s| (s.body_range.clone(), format!("{FILE_BODY_PLACEHOLDER}\n"))),
        );
    }

    let new_text = apply_replacements(source, replacements);
    Some(Message {
        role: MessageRole::User,
        text: new_text,
        full_text: None,
    })
}

struct Section {
    path: String,
    body_range: Range<usize>,
}

/// Scans `text` for headers of the form `<prefix><path> ---\n` and returns
/// one [`Section`] per header, with `body_range` spanning from just after the
/// header's trailing newline to the start of whichever comes first: the next
/// header sharing `prefix`, the next occurrence of one of `other_boundaries`
/// (e.g. the block-paths sections that follow every file section when the
/// strategy is `block`), the user-instruction footer, or the end of the
/// text. Without those boundaries the last section's body would swallow
/// whatever follows it and could never compare equal to the live file.
fn parse_sections(text: &str, prefix: &str, other_boundaries: &[&str]) -> Vec<Section> {
    let hard_stop = text.find(USER_INSTRUCTION_HEADER).unwrap_or(text.len());
    let mut sections = Vec::new();
    let mut search_from = 0usize;

    while let Some(rel_start) = text[search_from..].find(prefix) {
        let start = search_from + rel_start;
        let after_prefix = start + prefix.len();
        let Some(rel_suffix) = text[after_prefix..].find(SECTION_MARKER_SUFFIX) else {
            break;
        };
        let path_end = after_prefix + rel_suffix;
        let path = text[after_prefix..path_end].to_string();

        let mut body_start = path_end + SECTION_MARKER_SUFFIX.len();
        if let Some(newline_offset) = text[body_start..].find('\n') {
            body_start += newline_offset + 1;
        }

        let next = std::iter::once(prefix)
            .chain(other_boundaries.iter().copied())
            .filter_map(|marker| text[body_start..].find(marker).map(|rel| body_start + rel))
            .min()
            .unwrap_or(text.len())
            .min(hard_stop.max(body_start));

        sections.push(Section {
            path,
            body_range: body_start..next,
        });
        search_from = next;
    }

    sections
}

fn apply_replacements(text: &str, mut replacements: Vec<(Range<usize>, String)>) -> String {
    replacements.sort_by_key(|(range, _)| range.start);
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;
    for (range, replacement) in replacements {
        out.push_str(&text[cursor..range.start]);
        out.push_str(&replacement);
        cursor = range.end;
    }
    out.push_str(&text[cursor..]);
    out
}
