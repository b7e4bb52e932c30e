use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub type Result<T> = anyhow::Result<T>;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".codeforge")
}

// ── Navigational paths ─────────────────────────────────────────────────

pub const IMPORTS_PATH: &str = "$imports";
pub const FULLFILE_PATH: &str = "$fullfile";

/// Build the content-addressed fallback path for a top-level statement with no name.
pub fn line_path(line: usize, trimmed_source: &str) -> String {
    format!("$line:{line}:{trimmed_source}")
}

/// Split a `$line:<n>:<content>` path into its line number and content suffix.
/// Returns `None` for any other path shape.
pub fn parse_line_path(path: &str) -> Option<(usize, &str)> {
    let rest = path.strip_prefix("$line:")?;
    let (n, content) = rest.split_once(':')?;
    let n = n.parse().ok()?;
    Some((n, content))
}

// ── Workspace digest ───────────────────────────────────────────────────

/// Per-turn snapshot of workspace text, produced by the Workspace Reader.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceDigest {
    /// Ordered `(relative_path, text)` pairs, in walk order.
    pub files: Vec<(String, String)>,
    /// Relative paths only, in the same order, for UI display.
    pub included_files: Vec<String>,
    /// Concatenated `--- START OF FILE <path> ---` blocks, prefixed per §4.1.
    pub summary: String,
}

impl WorkspaceDigest {
    pub fn get(&self, path: &str) -> Option<&str> {
        self.files
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, text)| text.as_str())
    }
}

// ── File edits ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EditKind {
    Update,
    Delete,
}

/// The unit produced by the Edit Parser and consumed by the Edit Applier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEdit {
    pub kind: EditKind,
    pub path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl FileEdit {
    /// True when this update targets the whole file rather than a named block.
    pub fn is_full_file(&self) -> bool {
        self.block_path.is_none() || self.block_path.as_deref() == Some(FULLFILE_PATH)
    }
}

// ── Conversation turns ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Model,
}

/// One message in a conversation, as consumed by the Prompt Composer and
/// rewritten in place by the History Optimizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub text: String,
    /// For user messages, the originally-sent prompt body (embedded digest and
    /// all) before any optimization was applied. Absent for model messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
}

pub type History = Vec<Message>;

// ── Cancellation ────────────────────────────────────────────────────────

/// Caller-held handle that aborts the Model Gateway exchange of the current turn.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.cancelled
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

// ── Model gateway events ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageMetadata {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One event in the sequence yielded by the Model Gateway for a single turn.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    TextChunk(String),
    Usage(UsageMetadata),
    Error(String),
}

/// Callback invoked once per `GatewayEvent`, in order. `Arc<dyn Fn>` so it can be
/// cloned across retries within a single gateway call.
pub type GatewayCallback = std::sync::Arc<dyn Fn(GatewayEvent) + Send + Sync>;

// ── Event sink ──────────────────────────────────────────────────────────

/// The typed progress events a caller consumes to drive its UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SinkEvent {
    FilesIncluded { files: Vec<String>, prompt: String },
    TextChunk { text: String },
    Usage {
        usage: UsageMetadata,
        display_kinds: Vec<String>,
    },
    SnapshotCreated {
        label: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    Error { message: String },
}

pub type SinkCallback = std::sync::Arc<dyn Fn(SinkEvent) + Send + Sync>;

/// Delivers `SinkEvent`s to a caller-supplied callback, enforcing the ordering
/// invariant that at most one `usage` event is emitted per turn.
pub struct EventSink {
    callback: SinkCallback,
    usage_emitted: std::sync::atomic::AtomicBool,
}

impl EventSink {
    pub fn new(callback: SinkCallback) -> Self {
        Self {
            callback,
            usage_emitted: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn files_included(&self, files: Vec<String>, prompt: String) {
        self.emit(SinkEvent::FilesIncluded { files, prompt });
    }

    pub fn text_chunk(&self, text: String) {
        self.emit(SinkEvent::TextChunk { text });
    }

    pub fn usage(&self, usage: UsageMetadata, display_kinds: Vec<String>) {
        let already = self
            .usage_emitted
            .swap(true, std::sync::atomic::Ordering::SeqCst);
        debug_assert!(!already, "usage event emitted more than once in a turn");
        self.emit(SinkEvent::Usage {
            usage,
            display_kinds,
        });
    }

    pub fn snapshot_created(&self, label: String, message_id: Option<String>) {
        self.emit(SinkEvent::SnapshotCreated { label, message_id });
    }

    pub fn error(&self, message: String) {
        self.emit(SinkEvent::Error { message });
    }

    fn emit(&self, event: SinkEvent) {
        (self.callback)(event);
    }
}

// ── Snapshots ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotResult {
    pub created: bool,
    pub label: String,
}

// ── Configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApiProvider {
    Gemini,
    Openai,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CodeChangeStrategy {
    Full,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrategyPrompts {
    pub full: String,
    pub block: String,
}

impl Default for StrategyPrompts {
    fn default() -> Self {
        Self {
            full: "prompts/system.full.txt".to_string(),
            block: "prompts/system.block.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelParameters {
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub prompts: StrategyPrompts,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            temperature: 0.2,
            top_p: 0.95,
            top_k: 40,
            prompts: StrategyPrompts::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenAiParameters {
    #[serde(rename = "baseURL")]
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub prompts: StrategyPrompts,
}

impl Default for OpenAiParameters {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.2,
            top_p: 0.95,
            prompts: StrategyPrompts::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DisplayTokenConsumption {
    pub enabled: bool,
    pub display_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceIgnoreFiles {
    pub primary: String,
    pub secondary: String,
}

impl Default for WorkspaceIgnoreFiles {
    fn default() -> Self {
        Self {
            primary: ".codeforgeignore".to_string(),
            secondary: ".gitignore".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    pub verbose: bool,
    pub file_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            file_name: "run.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub api_provider: ApiProvider,
    pub code_change_strategy: CodeChangeStrategy,
    pub optimize_code_context: bool,
    pub max_context_history_turns: i64,
    pub enable_streaming: bool,
    pub display_token_consumption: DisplayTokenConsumption,
    pub model_parameters: ModelParameters,
    pub openai_parameters: OpenAiParameters,
    pub workspace_ignore_files: WorkspaceIgnoreFiles,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_provider: ApiProvider::Gemini,
            code_change_strategy: CodeChangeStrategy::Full,
            optimize_code_context: true,
            max_context_history_turns: -1,
            enable_streaming: true,
            display_token_consumption: DisplayTokenConsumption::default(),
            model_parameters: ModelParameters::default(),
            openai_parameters: OpenAiParameters::default(),
            workspace_ignore_files: WorkspaceIgnoreFiles::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".codeforge/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn config_path(workspace: &Path) -> PathBuf {
        Self::project_settings_path(workspace)
    }

    /// Load layered config: compiled defaults, then user, project, and
    /// project-local JSON-with-comments files, each merged over the last.
    /// A missing layer is skipped.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            let stripped = strip_json_comments(&raw);
            let value: serde_json::Value = serde_json::from_str(&stripped)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    /// Load config if any layer exists on disk, otherwise write and return
    /// compiled defaults.
    pub fn ensure(workspace: &Path) -> Result<Self> {
        let path = Self::project_settings_path(workspace);
        if path.exists()
            || Self::project_local_settings_path(workspace).exists()
            || Self::user_settings_path().is_some_and(|p| p.exists())
        {
            return Self::load(workspace);
        }
        let cfg = Self::default();
        cfg.save(workspace)?;
        Ok(cfg)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

/// Strip `//` and `/* */` comments from a JSON-with-comments document,
/// leaving string contents untouched. Not a full JSON5 parser: it only
/// understands enough to keep comments out of the object handed to `serde_json`.
fn strip_json_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escape = false;
    let bytes_len = input.len();
    let mut i = 0;
    while i < bytes_len {
        let c = input[i..].chars().next().unwrap();
        if in_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            i += c.len_utf8();
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            i += c.len_utf8();
            continue;
        }
        if input[i..].starts_with("//") {
            while i < bytes_len && !input[i..].starts_with('\n') {
                i += 1;
            }
            continue;
        }
        if input[i..].starts_with("/*") {
            i += 2;
            while i < bytes_len && !input[i..].starts_with("*/") {
                i += 1;
            }
            i = (i + 2).min(bytes_len);
            continue;
        }
        out.push(c);
        i += c.len_utf8();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn line_path_round_trips() {
        let p = line_path(12, "console.log(\"hi\");");
        assert_eq!(parse_line_path(&p), Some((12, "console.log(\"hi\");")));
    }

    #[test]
    fn parse_line_path_rejects_other_shapes() {
        assert_eq!(parse_line_path(IMPORTS_PATH), None);
        assert_eq!(parse_line_path("greet"), None);
    }

    #[test]
    fn file_edit_is_full_file_detection() {
        let whole = FileEdit {
            kind: EditKind::Update,
            path: "a.ts".into(),
            description: String::new(),
            block_path: None,
            content: Some("x".into()),
        };
        assert!(whole.is_full_file());

        let block = FileEdit {
            block_path: Some("greet".into()),
            ..whole.clone()
        };
        assert!(!block.is_full_file());

        let explicit_full = FileEdit {
            block_path: Some(FULLFILE_PATH.into()),
            ..whole
        };
        assert!(explicit_full.is_full_file());
    }

    #[test]
    fn cancellation_token_cancel_and_reset() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn event_sink_delivers_in_order() {
        let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        let sink = EventSink::new(Arc::new(move |event| {
            let tag = match event {
                SinkEvent::FilesIncluded { .. } => "files",
                SinkEvent::TextChunk { .. } => "chunk",
                SinkEvent::Usage { .. } => "usage",
                SinkEvent::SnapshotCreated { .. } => "snapshot",
                SinkEvent::Error { .. } => "error",
            };
            log.lock().unwrap().push(tag.to_string());
        }));

        sink.files_included(vec!["a.ts".into()], "prompt".into());
        sink.text_chunk("hello".into());
        sink.text_chunk(" world".into());
        sink.usage(UsageMetadata::default(), vec!["input".into()]);

        assert_eq!(
            *received.lock().unwrap(),
            vec!["files", "chunk", "chunk", "usage"]
        );
    }

    #[test]
    fn config_default_round_trips_through_json() {
        let cfg = Config::default();
        let value = serde_json::to_value(&cfg).unwrap();
        let back: Config = serde_json::from_value(value).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn config_surface_uses_documented_keys() {
        let value = serde_json::to_value(Config::default()).unwrap();
        assert!(value.get("apiProvider").is_some());
        assert!(value.get("codeChangeStrategy").is_some());
        assert_eq!(
            value["openaiParameters"]["baseURL"],
            serde_json::json!("https://api.openai.com/v1")
        );
    }

    #[test]
    fn load_merges_project_and_local_layers() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime_dir(dir.path());
        fs::create_dir_all(&rt).unwrap();
        fs::write(
            rt.join("settings.json"),
            r#"{
                // project-level override
                "apiProvider": "openai",
                "maxContextHistoryTurns": 5
            }"#,
        )
        .unwrap();
        fs::write(
            rt.join("settings.local.json"),
            r#"{ "enableStreaming": false }"#,
        )
        .unwrap();

        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.api_provider, ApiProvider::Openai);
        assert_eq!(cfg.max_context_history_turns, 5);
        assert!(!cfg.enable_streaming);
        // untouched defaults survive the merge
        assert_eq!(cfg.code_change_strategy, CodeChangeStrategy::Full);
    }

    #[test]
    fn strip_json_comments_preserves_string_contents() {
        let input = r#"{ "url": "http://example.com // not a comment" } // trailing"#;
        let stripped = strip_json_comments(input);
        let value: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["url"], "http://example.com // not a comment");
    }

    #[test]
    fn strip_json_comments_removes_block_comments() {
        let input = "{\n/* leading */ \"a\": 1 /* trailing */\n}";
        let stripped = strip_json_comments(input);
        let value: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["a"], 1);
    }
}
