//! Prompt Composer and History Optimizer: turns a workspace plus a
//! conversation into the single string handed to the Model Gateway.

pub mod compose;
pub mod history;

pub use compose::{ComposedPrompt, block_paths_for_digest, compose, load_system_prompt};
pub use history::{FILE_BODY_PLACEHOLDER, optimize};

use codeforge_core::{Config, History, Message, MessageRole, WorkspaceDigest};

/// Applies the `optimizeCodeContext` / `maxContextHistoryTurns` config knobs
/// (§6) ahead of composing a prompt: first windows history to the most
/// recent `maxContextHistoryTurns` user turns (`-1` unbounded, `0` none),
/// then runs the history rewrite over what remains, unless optimization is
/// disabled.
pub fn prepare_history(history: &History, digest: &WorkspaceDigest, cfg: &Config) -> History {
    let windowed = window_history(history, cfg.max_context_history_turns);
    if cfg.optimize_code_context {
        history::optimize(&windowed, digest, cfg.code_change_strategy)
    } else {
        windowed
    }
}

/// Keeps only the trailing `max_turns` user turns (a user message plus every
/// message that follows it up to the next user message). `-1` means
/// unbounded, `0` means drop all history.
fn window_history(history: &History, max_turns: i64) -> History {
    if max_turns < 0 {
        return history.clone();
    }
    if max_turns == 0 {
        return Vec::new();
    }

    let user_indices: Vec<usize> = history
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == MessageRole::User)
        .map(|(i, _)| i)
        .collect();

    let keep_from = if (max_turns as usize) >= user_indices.len() {
        0
    } else {
        user_indices[user_indices.len() - max_turns as usize]
    };

    history[keep_from..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeforge_core::CodeChangeStrategy;

    fn user(text: &str) -> Message {
        Message {
            role: MessageRole::User,
            text: text.to_string(),
            full_text: None,
        }
    }

    fn model(text: &str) -> Message {
        Message {
            role: MessageRole::Model,
            text: text.to_string(),
            full_text: None,
        }
    }

    #[test]
    fn negative_window_keeps_everything() {
        let history = vec![user("a"), model("b"), user("c"), model("d")];
        assert_eq!(window_history(&history, -1), history);
    }

    #[test]
    fn zero_window_drops_everything() {
        let history = vec![user("a"), model("b")];
        assert!(window_history(&history, 0).is_empty());
    }

    #[test]
    fn window_keeps_trailing_n_user_turns() {
        let history = vec![
            user("turn1"),
            model("reply1"),
            user("turn2"),
            model("reply2"),
            user("turn3"),
            model("reply3"),
        ];
        let windowed = window_history(&history, 2);
        assert_eq!(
            windowed.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(),
            vec!["turn2", "reply2", "turn3", "reply3"]
        );
    }

    #[test]
    fn disabled_optimization_returns_windowed_history_verbatim() {
        let digest = WorkspaceDigest::default();
        let mut cfg = Config::default();
        cfg.optimize_code_context = false;
        cfg.max_context_history_turns = -1;
        let history = vec![user("--- START OF FILE a.ts ---\nfoo\n")];
        let prepared = prepare_history(&history, &digest, &cfg);
        assert_eq!(prepared, history);
    }

    #[test]
    fn enabled_optimization_collapses_matching_older_turn() {
        let digest = WorkspaceDigest {
            files: vec![("a.ts".to_string(), "foo\n".to_string())],
            included_files: vec!["a.ts".to_string()],
            summary: String::new(),
        };
        let mut cfg = Config::default();
        cfg.optimize_code_context = true;
        cfg.max_context_history_turns = -1;
        cfg.code_change_strategy = CodeChangeStrategy::Full;
        let history = vec![
            user("--- START OF FILE a.ts ---\nfoo\n\n---User Instruction---\nfirst"),
            model("ack"),
            user("--- START OF FILE a.ts ---\nfoo\n\n---User Instruction---\nsecond"),
        ];
        let prepared = prepare_history(&history, &digest, &cfg);
        assert!(prepared[0].text.contains(FILE_BODY_PLACEHOLDER));
    }
}
