//! Thin clap-derived binary exercising the edit pipeline from a terminal.
//!
//! Stands in for the out-of-scope HTTP/UI layer: it wires `Config::ensure`,
//! the `Observer`, and the library crates together, but carries no feature
//! of its own beyond that wiring (§4.11).

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use codeforge_core::{
    ApiProvider, CancellationToken, Config, EventSink, GatewayEvent, History, SinkEvent,
};
use codeforge_llm::{GeminiGateway, ModelGateway, OpenAiGateway};
use codeforge_observe::Observer;
use codeforge_prompt::compose;
use codeforge_snapshot::SnapshotStore;
use codeforge_workspace::IgnoreRules;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "codeforge", about = "Demonstration CLI for the codeforge edit pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compose a prompt for a workspace + instruction, call the Model
    /// Gateway, and print the streamed response.
    Run(RunArgs),
    /// Read a file containing a model response, parse it, apply it, and
    /// report the resulting snapshot.
    Apply(ApplyArgs),
    /// Inspect and manage the snapshot store.
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Workspace root to read files from and apply settings for.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
    /// The user's instruction for this turn.
    #[arg(long)]
    instruction: String,
    /// Disable streaming for this call, overriding the loaded config.
    #[arg(long)]
    no_stream: bool,
}

#[derive(clap::Args)]
struct ApplyArgs {
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
    /// Path to a file containing the model's raw response text.
    #[arg(long)]
    input: PathBuf,
}

#[derive(Subcommand)]
enum SnapshotCommand {
    Create {
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        #[arg(long)]
        label: String,
        #[arg(long)]
        force: bool,
    },
    Restore {
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        #[arg(long)]
        label: String,
    },
    List {
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_turn(args),
        Command::Apply(args) => apply_response(args),
        Command::Snapshot(cmd) => snapshot_command(cmd),
    }
}

fn ignore_rules(workspace: &Path, cfg: &Config) -> Result<IgnoreRules> {
    IgnoreRules::load(
        workspace,
        &cfg.workspace_ignore_files.primary,
        &cfg.workspace_ignore_files.secondary,
    )
    .context("loading ignore rules")
}

fn run_turn(args: RunArgs) -> Result<()> {
    let workspace = args
        .workspace
        .canonicalize()
        .with_context(|| format!("workspace does not exist: {}", args.workspace.display()))?;
    let cfg = Config::ensure(&workspace).context("loading config")?;
    let observer =
        Observer::new(&workspace, &cfg.logging.file_name, cfg.logging.verbose).context("observer")?;

    let rules = ignore_rules(&workspace, &cfg)?;
    let composed = compose::compose(
        &workspace,
        rules,
        cfg.code_change_strategy,
        &args.instruction,
        Some(&observer),
    );

    let sink = EventSink::new(Arc::new(|event: SinkEvent| match event {
        SinkEvent::FilesIncluded { files, .. } => {
            eprintln!("[files included: {}]", files.join(", "));
        }
        SinkEvent::TextChunk { text } => {
            print!("{text}");
        }
        SinkEvent::Usage { usage, .. } => {
            eprintln!(
                "\n[usage] prompt={} completion={} total={}",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            );
        }
        SinkEvent::SnapshotCreated { label, .. } => {
            eprintln!("[snapshot created: {label}]");
        }
        SinkEvent::Error { message } => {
            eprintln!("[error] {message}");
        }
    }));
    sink.files_included(composed.included_files.clone(), composed.prompt.clone());

    let system_prompt = compose::load_system_prompt(&cfg, &workspace, Some(&observer));
    // This demonstration binary has no persisted chat history (that CRUD
    // layer is out of scope); the windowing/optimization knobs still run
    // over whatever history a caller would otherwise thread in here.
    let raw_history: History = Vec::new();
    let history = codeforge_prompt::prepare_history(&raw_history, &composed.digest, &cfg);
    let streaming = cfg.enable_streaming && !args.no_stream;
    let cancel = CancellationToken::new();

    let gateway: Box<dyn ModelGateway> = match cfg.api_provider {
        ApiProvider::Gemini => {
            let key = codeforge_llm::api_key_from_env(codeforge_llm::GEMINI_API_KEY_VAR)
                .map_err(|e| anyhow!(e))?;
            Box::new(GeminiGateway::new(cfg.model_parameters.clone(), key))
        }
        ApiProvider::Openai => {
            let key = codeforge_llm::api_key_from_env(codeforge_llm::OPENAI_API_KEY_VAR)
                .map_err(|e| anyhow!(e))?;
            Box::new(OpenAiGateway::new(cfg.openai_parameters.clone(), key))
        }
    };

    let sink_for_callback = Arc::new(sink);
    let callback_sink = sink_for_callback.clone();
    gateway.send(
        &system_prompt,
        &history,
        &composed.prompt,
        streaming,
        &cancel,
        Arc::new(move |event| match event {
            GatewayEvent::TextChunk(text) => callback_sink.text_chunk(text),
            GatewayEvent::Usage(usage) => {
                callback_sink.usage(usage, cfg.display_token_consumption.display_types.clone())
            }
            GatewayEvent::Error(message) => callback_sink.error(message),
        }),
    );
    println!();

    Ok(())
}

fn apply_response(args: ApplyArgs) -> Result<()> {
    let workspace = args
        .workspace
        .canonicalize()
        .with_context(|| format!("workspace does not exist: {}", args.workspace.display()))?;
    let cfg = Config::ensure(&workspace).context("loading config")?;
    let observer =
        Observer::new(&workspace, &cfg.logging.file_name, cfg.logging.verbose).context("observer")?;
    let rules = ignore_rules(&workspace, &cfg)?;
    let snapshot_store = SnapshotStore::new(workspace.clone(), rules, Some(&observer));

    let model_output =
        std::fs::read_to_string(&args.input).with_context(|| format!("reading {}", args.input.display()))?;

    let events: Arc<std::sync::Mutex<Vec<SinkEvent>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let captured = events.clone();
    let sink = EventSink::new(Arc::new(move |event| captured.lock().unwrap().push(event)));

    let report = codeforge_edit::apply_model_output(
        &model_output,
        &workspace,
        &snapshot_store,
        Some(&observer),
        &sink,
    );

    for outcome in &report.outcomes {
        println!("{:?} {} -> {:?}", outcome.kind, outcome.path, outcome.status);
    }
    for event in events.lock().unwrap().iter() {
        if let SinkEvent::SnapshotCreated { label, .. } = event {
            println!("snapshot created: {label}");
        }
        if let SinkEvent::Error { message } = event {
            println!("error: {message}");
        }
    }

    if !report.any_succeeded() {
        return Err(anyhow!("no edits applied successfully"));
    }
    Ok(())
}

fn snapshot_command(cmd: SnapshotCommand) -> Result<()> {
    match cmd {
        SnapshotCommand::Create { workspace, label, force } => {
            let workspace = workspace.canonicalize().context("workspace does not exist")?;
            let cfg = Config::ensure(&workspace)?;
            let rules = ignore_rules(&workspace, &cfg)?;
            let store = SnapshotStore::new(workspace, rules, None);
            let result = store.create(&label, force)?;
            if result.created {
                println!("created snapshot {}", result.label);
            } else {
                println!("no-op: workspace matches snapshot {}", result.label);
            }
        }
        SnapshotCommand::Restore { workspace, label } => {
            let workspace = workspace.canonicalize().context("workspace does not exist")?;
            let cfg = Config::ensure(&workspace)?;
            let rules = ignore_rules(&workspace, &cfg)?;
            let store = SnapshotStore::new(workspace, rules, None);
            store.restore(&label)?;
            println!("restored snapshot {label}");
        }
        SnapshotCommand::List { workspace } => {
            let workspace = workspace.canonicalize().context("workspace does not exist")?;
            let cfg = Config::ensure(&workspace)?;
            let rules = ignore_rules(&workspace, &cfg)?;
            let store = SnapshotStore::new(workspace, rules, None);
            for label in store.list()? {
                println!("{label}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_without_panicking() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_requires_instruction() {
        let err = Cli::try_parse_from(["codeforge", "run", "--workspace", "."]).unwrap_err();
        assert!(err.to_string().contains("instruction"));
    }

    #[test]
    fn snapshot_create_parses() {
        let cli = Cli::try_parse_from([
            "codeforge",
            "snapshot",
            "create",
            "--workspace",
            ".",
            "--label",
            "x",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Snapshot(SnapshotCommand::Create { .. })
        ));
    }
}
