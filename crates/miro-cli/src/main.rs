use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand};
use miro_contracts::chat::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use miro_contracts::events::EventWriter;
use miro_contracts::session::{
    parse_version_label, resolve_version, ChatContent, ChatEntry, ChatRole, SessionManifest,
    SessionState, UserInput,
};
use miro_contracts::turns::summary::{write_summary, SessionSummary};
use miro_engine::config::parse_command;
use miro_engine::editor::HttpImageEditor;
use miro_engine::orchestrator::stage_line;
use miro_engine::shape::HttpShapeGenerator;
use miro_engine::{
    ControllerError, MiroConfig, Orchestrator, ServiceHandles, SubmissionController, TurnReport,
};
use serde_json::{json, Map, Value};

#[derive(Debug, Parser)]
#[command(name = "miro", version, about = "Conversational 3D asset generation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Run(RunArgs),
    Versions(VersionsArgs),
    Revert(RevertArgs),
    Status(StatusArgs),
}

/// Overrides on top of the `MIRO_*` environment.
#[derive(Debug, Clone, Default, Args)]
struct ServiceArgs {
    #[arg(long)]
    image_url: Option<String>,
    #[arg(long)]
    shape_url: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    render_cmd: Option<String>,
    #[arg(long)]
    default_image: Option<PathBuf>,
    #[arg(long)]
    turns_dir: Option<PathBuf>,
    #[arg(long)]
    dryrun: bool,
}

impl ServiceArgs {
    fn resolve(&self) -> MiroConfig {
        self.apply(MiroConfig::from_env())
    }

    fn apply(&self, mut config: MiroConfig) -> MiroConfig {
        if let Some(url) = &self.image_url {
            config.image_url = miro_engine::config::normalize_base_url(url);
        }
        if let Some(url) = &self.shape_url {
            config.shape_url = miro_engine::config::normalize_base_url(url);
        }
        if let Some(model) = &self.image_model {
            config.image_model = model.clone();
        }
        if let Some(raw) = &self.render_cmd {
            config.render_command = parse_command(raw);
        }
        if let Some(path) = &self.default_image {
            config.placeholder_image = path.clone();
        }
        if let Some(path) = &self.turns_dir {
            config.output_dir = path.clone();
        }
        if self.dryrun {
            config.dryrun = true;
        }
        config
    }
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[command(flatten)]
    services: ServiceArgs,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long = "image")]
    images: Vec<PathBuf>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[command(flatten)]
    services: ServiceArgs,
}

#[derive(Debug, Parser)]
struct VersionsArgs {
    #[arg(long)]
    session: PathBuf,
}

#[derive(Debug, Parser)]
struct RevertArgs {
    #[arg(long)]
    session: PathBuf,
    #[arg(long)]
    version: String,
}

#[derive(Debug, Parser)]
struct StatusArgs {
    #[command(flatten)]
    services: ServiceArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("miro error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => run_chat(args),
        Command::Run(args) => run_once(args),
        Command::Versions(args) => run_versions(args),
        Command::Revert(args) => run_revert(args),
        Command::Status(args) => run_status(args),
    }
}

#[derive(Debug, Default)]
struct TurnStats {
    total: u64,
    failed: u64,
}

impl TurnStats {
    fn record(&mut self, report: &TurnReport) {
        self.total += 1;
        if !report.outcome.succeeded() {
            self.failed += 1;
        }
    }
}

/// One open session directory: `session.json`, `events.jsonl` and, on
/// finish, `summary.json`.
struct Session {
    out_dir: PathBuf,
    session_id: String,
    started_at: String,
    events: EventWriter,
    services: ServiceHandles,
    controller: SubmissionController,
}

impl Session {
    fn open(out_dir: &Path, events_path: Option<&Path>, config: &MiroConfig) -> Result<Self> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        let manifest = SessionManifest::load_or_new(out_dir.join("session.json"));
        let session_id = manifest.session_id.clone();
        let events_path = events_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| out_dir.join("events.jsonl"));
        let events = EventWriter::new(events_path, session_id.clone());
        let services = ServiceHandles::from_config(config)?;

        let mut payload = json_object(json!({
            "out_dir": out_dir.to_string_lossy().to_string(),
            "turns_dir": config.output_dir.to_string_lossy().to_string(),
            "resumed_versions": manifest.state.history.len(),
        }));
        payload.extend(services.names());
        events.emit("session_started", payload)?;

        let orchestrator = Orchestrator::new(services.clone(), &config.output_dir, events.clone());
        let controller = SubmissionController::with_manifest(
            Arc::new(orchestrator),
            &config.placeholder_image,
            manifest,
        );
        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            session_id,
            started_at: now_utc_iso(),
            events,
            services,
            controller,
        })
    }

    fn finish(self, stats: &TurnStats) -> Result<()> {
        let state = self.controller.snapshot();
        let summary = SessionSummary {
            session_id: self.session_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            total_turns: stats.total,
            failed_turns: stats.failed,
            total_versions: state.history.len() as u64,
            version_labels: state.version_labels(),
        };
        let extra = json_object(json!({
            "displayed_model": state.displayed_model.as_deref().map(path_text),
            "current_preview": state.current_preview.as_deref().map(path_text),
            "dropped_events": self.events.dropped_events(),
        }));
        write_summary(&self.out_dir.join("summary.json"), &summary, Some(&extra))?;
        drop(self.controller);
        self.services.shutdown(&self.events);
        Ok(())
    }
}

enum ChatEvent {
    Line(String),
    Eof,
    TurnDone(Box<TurnReport>),
}

fn run_chat(args: ChatArgs) -> Result<i32> {
    let config = args.services.resolve();
    let session = Session::open(&args.out, args.events.as_deref(), &config)?;
    let controller = session.controller.clone();

    let (tx, rx) = mpsc::channel::<ChatEvent>();
    spawn_stdin_reader(tx.clone())?;

    let resumed = controller.snapshot();
    println!("Miro chat started. Type /help for commands.");
    if !resumed.history.is_empty() {
        println!("Resumed session with {} versions.", resumed.history.len());
    }
    prompt_marker()?;

    let mut attachments: Vec<PathBuf> = Vec::new();
    let mut stats = TurnStats::default();
    let mut closing = false;

    while let Ok(event) = rx.recv() {
        match event {
            ChatEvent::TurnDone(report) => {
                stats.record(&report);
                print_report(&report);
                if closing {
                    break;
                }
                prompt_marker()?;
            }
            ChatEvent::Eof => {
                if !controller.is_processing() {
                    break;
                }
                println!("Waiting for the running turn to finish...");
                closing = true;
            }
            ChatEvent::Line(line) => {
                let intent = parse_intent(&line);
                if intent.action == "noop" {
                    prompt_marker()?;
                    continue;
                }
                if controller.is_processing() {
                    if intent.action == "quit" {
                        println!("Waiting for the running turn to finish...");
                        closing = true;
                    } else {
                        println!("Busy: input is disabled until the current turn finishes.");
                    }
                    continue;
                }
                match handle_intent(&intent, &controller, &session, &mut attachments, &tx)? {
                    ChatFlow::Continue => prompt_marker()?,
                    ChatFlow::Processing => {}
                    ChatFlow::Quit => break,
                }
            }
        }
    }

    session.finish(&stats)?;
    Ok(0)
}

enum ChatFlow {
    Continue,
    Processing,
    Quit,
}

fn handle_intent(
    intent: &Intent,
    controller: &SubmissionController,
    session: &Session,
    attachments: &mut Vec<PathBuf>,
    tx: &Sender<ChatEvent>,
) -> Result<ChatFlow> {
    match intent.action.as_str() {
        "help" => println!("Commands: {}", CHAT_HELP_COMMANDS.join(" ")),
        "quit" => return Ok(ChatFlow::Quit),
        "attach" => {
            let paths: Vec<PathBuf> = intent
                .command_args
                .get("paths")
                .and_then(Value::as_array)
                .map(|rows| rows.iter().filter_map(Value::as_str).map(PathBuf::from).collect())
                .unwrap_or_default();
            if paths.is_empty() {
                println!("/attach requires at least one path");
            }
            for path in paths {
                if path.is_file() {
                    println!("Attached {}", path.display());
                    attachments.push(path);
                } else {
                    println!("Attach failed: file not found ({})", path.display());
                }
            }
        }
        "detach" => {
            println!("Cleared {} attachment(s).", attachments.len());
            attachments.clear();
        }
        "versions" => print_versions(&controller.snapshot()),
        "transcript" => {
            for entry in &controller.snapshot().transcript {
                println!("{}", transcript_line(entry));
            }
        }
        "status" => {
            let state = controller.snapshot();
            println!("Session: {}", session.session_id);
            println!("Versions: {}", state.history.len());
            println!("Displayed model: {}", optional_path(state.displayed_model.as_deref()));
            println!("Current preview: {}", optional_path(state.current_preview.as_deref()));
            println!("Pending attachments: {}", attachments.len());
            let names = session.services.names();
            println!(
                "Backends: editor={} shape={} renderer={}",
                names.get("editor").and_then(Value::as_str).unwrap_or("?"),
                names.get("shape").and_then(Value::as_str).unwrap_or("?"),
                names.get("renderer").and_then(Value::as_str).unwrap_or("?"),
            );
        }
        "revert" => {
            let raw = intent
                .command_args
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let Some(index) = parse_version_label(raw) else {
                println!("/revert requires a version number, e.g. /revert 2");
                return Ok(ChatFlow::Continue);
            };
            match controller.revert(index) {
                Ok(Some(path)) => println!("Displaying Version {}: {}", index + 1, path.display()),
                Ok(None) => println!("No such version: {}", raw.trim()),
                Err(err) => println!("Revert rejected: {err}"),
            }
        }
        "generate" => {
            let prompt = intent.prompt.clone().unwrap_or_default();
            let input = UserInput::new(prompt, attachments.clone());
            let accepted = match controller.submit_immediate(input) {
                Ok(accepted) => accepted,
                Err(err) => {
                    println!("Submit rejected: {err}");
                    return Ok(ChatFlow::Continue);
                }
            };
            attachments.clear();
            println!(
                "Processing \"{}\" with {} attachment(s)...",
                accepted.text,
                accepted.files.len()
            );
            let tx = tx.clone();
            match controller.dispatch_with(accepted, move |report| {
                let _ = tx.send(ChatEvent::TurnDone(Box::new(report)));
            }) {
                Ok(()) => return Ok(ChatFlow::Processing),
                Err(ControllerError::SessionBusy) => println!("Busy: a turn is already processing."),
                Err(err) => return Err(err.into()),
            }
        }
        _ => {
            let command = intent
                .command_args
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or(intent.action.as_str());
            println!("Unknown command: /{command}");
        }
    }
    Ok(ChatFlow::Continue)
}

fn spawn_stdin_reader(tx: Sender<ChatEvent>) -> Result<()> {
    thread::Builder::new()
        .name("miro-stdin".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if tx.send(ChatEvent::Line(line)).is_err() {
                    return;
                }
            }
            let _ = tx.send(ChatEvent::Eof);
        })
        .context("failed to start stdin reader")?;
    Ok(())
}

fn prompt_marker() -> Result<()> {
    print!("> ");
    io::stdout().flush()?;
    Ok(())
}

fn run_once(args: RunArgs) -> Result<i32> {
    let config = args.services.resolve();
    let session = Session::open(&args.out, args.events.as_deref(), &config)?;
    for image in &args.images {
        if !image.is_file() {
            bail!("image not found: {}", image.display());
        }
    }

    let report = session
        .controller
        .run_turn(UserInput::new(args.prompt, args.images))?;
    print_report(&report);

    let mut stats = TurnStats::default();
    stats.record(&report);
    let code = if report.outcome.succeeded() { 0 } else { 2 };
    session.finish(&stats)?;
    Ok(code)
}

fn load_session(dir: &Path) -> Result<SessionManifest> {
    let path = dir.join("session.json");
    if !path.exists() {
        bail!("no session manifest at {}", path.display());
    }
    Ok(SessionManifest::load(path))
}

fn run_versions(args: VersionsArgs) -> Result<i32> {
    let manifest = load_session(&args.session)?;
    print_versions(&manifest.state);
    Ok(0)
}

fn run_revert(args: RevertArgs) -> Result<i32> {
    let mut manifest = load_session(&args.session)?;
    let resolved = parse_version_label(&args.version)
        .and_then(|index| resolve_version(index, &manifest.state.history))
        .map(|entry| entry.path.clone());
    let Some(path) = resolved else {
        eprintln!(
            "No such version: {} ({} available)",
            args.version,
            manifest.state.history.len()
        );
        return Ok(2);
    };
    manifest.state.displayed_model = Some(path.clone());
    manifest.save()?;
    println!("{}", path.display());
    Ok(0)
}

fn run_status(args: StatusArgs) -> Result<i32> {
    let config = args.services.resolve();
    println!("Image edit service: {} (model {})", config.image_url, config.image_model);
    println!("Shape service: {}", config.shape_url);
    println!("Turns dir: {}", config.output_dir.display());
    println!(
        "Renderer: {}",
        config
            .render_command
            .as_ref()
            .map(|parts| parts.join(" "))
            .unwrap_or_else(|| "none".to_string())
    );
    if config.dryrun {
        println!("Dry-run backends selected; nothing to probe.");
        return Ok(0);
    }

    let mut healthy = true;
    let editor = HttpImageEditor::new(&config.image_url, &config.image_model, config.http_timeout)?;
    match editor.list_models() {
        Ok(models) => {
            let listed = models.iter().any(|model| model == &config.image_model);
            println!("  edit: ok, models [{}]", models.join(", "));
            if !listed {
                println!("  edit: model {} is not advertised", config.image_model);
            }
        }
        Err(err) => {
            healthy = false;
            println!("  edit: {err}");
        }
    }
    let shape = HttpShapeGenerator::new(&config.shape_url, config.http_timeout)?;
    match shape.service_info() {
        Ok(info) => println!(
            "  shape: ok, {} {}",
            info.get("service").and_then(Value::as_str).unwrap_or("unknown"),
            info.get("version").and_then(Value::as_str).unwrap_or("")
        ),
        Err(err) => {
            healthy = false;
            println!("  shape: {err}");
        }
    }
    Ok(if healthy { 0 } else { 2 })
}

fn print_report(report: &TurnReport) {
    let outcome = &report.outcome;
    println!();
    for image in &outcome.extracted {
        println!("Edited image: {}", image.display());
    }
    match (&outcome.model_path, &outcome.failure) {
        (Some(model), _) => {
            let label = report.version_labels.last().cloned().unwrap_or_default();
            println!("{label}: {}", model.display());
        }
        (None, Some(failure)) => println!("Generation failed at {failure}"),
        (None, None) => println!("Generation produced no model."),
    }
    if let Some(preview) = &outcome.preview_path {
        println!("Preview: {}", preview.display());
    }
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    println!("Stages: {}", stage_line(&outcome.stages));
    println!("Working dir: {}", outcome.working_dir.display());
}

fn print_versions(state: &SessionState) {
    if state.history.is_empty() {
        println!("No versions yet.");
        return;
    }
    for entry in state.history.iter() {
        let marker = if state.displayed_model.as_deref() == Some(entry.path.as_path()) {
            "*"
        } else {
            " "
        };
        println!("{marker} {}\t{}", entry.label(), entry.path.display());
    }
}

fn transcript_line(entry: &ChatEntry) -> String {
    let role = match entry.role {
        ChatRole::User => "user",
        ChatRole::Assistant => "miro",
    };
    match &entry.content {
        ChatContent::Text(text) => format!("{role}: {text}"),
        ChatContent::Image(path) => format!("{role}: [image] {}", path.display()),
    }
}

fn optional_path(path: Option<&Path>) -> String {
    path.map(path_text).unwrap_or_else(|| "-".to_string())
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn json_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;
    use miro_contracts::session::{ChatContent, ChatEntry, ChatRole};
    use miro_engine::MiroConfig;

    use super::{transcript_line, Cli, Command, ServiceArgs};

    #[test]
    fn run_accepts_repeated_images() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "miro", "run", "--prompt", "a tiger", "--image", "a.png", "--image", "b.png", "--out",
            "/tmp/s", "--dryrun",
        ])?;
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.images, vec![PathBuf::from("a.png"), PathBuf::from("b.png")]);
        assert!(args.services.dryrun);
        Ok(())
    }

    #[test]
    fn revert_requires_session_and_version() {
        assert!(Cli::try_parse_from(["miro", "revert", "--session", "/tmp/s"]).is_err());
        assert!(
            Cli::try_parse_from(["miro", "revert", "--session", "/tmp/s", "--version", "2"]).is_ok()
        );
    }

    #[test]
    fn flags_override_environment_config() {
        let args = ServiceArgs {
            image_url: Some("http://gpu:9000/".to_string()),
            render_cmd: Some("python3 render.py".to_string()),
            turns_dir: Some(PathBuf::from("/tmp/turns")),
            ..ServiceArgs::default()
        };
        let config = args.apply(MiroConfig::default());
        assert_eq!(config.image_url, "http://gpu:9000");
        assert_eq!(config.shape_url, MiroConfig::default().shape_url);
        assert_eq!(
            config.render_command,
            Some(vec!["python3".to_string(), "render.py".to_string()])
        );
        assert_eq!(config.output_dir, PathBuf::from("/tmp/turns"));
        assert!(!config.dryrun);
    }

    #[test]
    fn transcript_lines_name_roles() {
        let text = ChatEntry {
            role: ChatRole::User,
            content: ChatContent::Text("a tiger".to_string()),
        };
        let image = ChatEntry {
            role: ChatRole::Assistant,
            content: ChatContent::Image(PathBuf::from("/t/output_0.png")),
        };
        assert_eq!(transcript_line(&text), "user: a tiger");
        assert_eq!(transcript_line(&image), "miro: [image] /t/output_0.png");
    }
}
