use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;
use vertex_imagen_contracts::events::{message_payload, sanitize_payload, EventPayload, EventWriter};
use vertex_imagen_contracts::ToolMessage;
use vertex_imagen_engine::VertexImagenProvider;

#[derive(Debug, Parser)]
#[command(
    name = "vertex-imagen",
    version,
    about = "Vertex AI image generation tools"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the available tools.
    Tools,
    /// Check a credential file with one probe generation.
    Validate(ValidateArgs),
    /// Run one tool and write its output under --out.
    Invoke(InvokeArgs),
}

#[derive(Debug, Parser)]
struct ValidateArgs {
    #[arg(long)]
    credentials: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct InvokeArgs {
    #[arg(long)]
    tool: String,
    #[arg(long)]
    credentials: PathBuf,
    #[arg(long)]
    params: Option<PathBuf>,
    /// Overrides `prompt` in the parameter file.
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("vertex-imagen error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Tools => run_tools(),
        Command::Validate(args) => run_validate(args),
        Command::Invoke(args) => run_invoke(args),
    }
}

fn run_tools() -> Result<i32> {
    let provider = VertexImagenProvider::from_env();
    for name in provider.tools() {
        if let Some(tool) = provider.tool(&name) {
            println!(
                "{name}\t{}\t{}",
                tool.provider_label(),
                tool.default_location()
            );
        }
    }
    Ok(0)
}

fn run_validate(args: ValidateArgs) -> Result<i32> {
    let credentials = load_json_object(&args.credentials)?;
    let events = args
        .events
        .as_ref()
        .map(|path| EventWriter::new(path, new_invocation_id()));
    let provider = VertexImagenProvider::from_env();

    match provider.validate_credentials(&credentials) {
        Ok(()) => {
            if let Some(events) = events.as_ref() {
                events.emit("credentials_validated", EventPayload::new())?;
            }
            println!("Credentials are valid.");
            Ok(0)
        }
        Err(err) => {
            if let Some(events) = events.as_ref() {
                let mut payload = EventPayload::new();
                payload.insert("error".to_string(), Value::String(err.to_string()));
                events.emit("credentials_rejected", payload)?;
            }
            eprintln!("{err}");
            Ok(1)
        }
    }
}

fn run_invoke(args: InvokeArgs) -> Result<i32> {
    let credentials = load_json_object(&args.credentials)?;
    let mut parameters = match args.params.as_ref() {
        Some(path) => load_json_object(path)?,
        None => Map::new(),
    };
    if let Some(prompt) = args.prompt.as_ref() {
        parameters.insert("prompt".to_string(), Value::String(prompt.clone()));
    }

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let events = EventWriter::new(&events_path, new_invocation_id());
    let provider = VertexImagenProvider::from_env();
    let invocation = provider.invoke(&args.tool, credentials, parameters.clone())?;

    let mut started = EventPayload::new();
    started.insert("tool".to_string(), Value::String(invocation.tool_name().to_string()));
    started.insert("params".to_string(), sanitize_payload(&Value::Object(parameters)));
    events.emit("invocation_started", started)?;

    let mut summary = OutputSummary::default();
    for (index, message) in invocation.iter().enumerate() {
        let mut payload = message_payload(index, &message);
        match &message {
            ToolMessage::Text { text } => {
                summary.texts += 1;
                println!("{text}");
            }
            ToolMessage::Blob { blob, meta } => {
                let written = write_blob(&args.out, &meta.filename, blob)?;
                summary.blobs += 1;
                println!("{}", written.path.display());
                payload.insert("sha256".to_string(), Value::String(written.sha256));
                payload.insert(
                    "path".to_string(),
                    Value::String(written.path.to_string_lossy().to_string()),
                );
            }
        }
        events.emit("message_emitted", payload)?;
    }

    let mut finished = EventPayload::new();
    finished.insert("texts".to_string(), json!(summary.texts));
    finished.insert("blobs".to_string(), json!(summary.blobs));
    events.emit("invocation_finished", finished)?;
    tracing::info!(
        invocation_id = events.invocation_id(),
        events = %events.path().display(),
        blobs = summary.blobs,
        texts = summary.texts,
        "invocation complete"
    );
    Ok(summary.exit_code())
}

#[derive(Debug, Default)]
struct OutputSummary {
    texts: usize,
    blobs: usize,
}

impl OutputSummary {
    /// Zero only when at least one image was produced.
    fn exit_code(&self) -> i32 {
        if self.blobs > 0 {
            0
        } else {
            1
        }
    }
}

#[derive(Debug)]
struct WrittenBlob {
    path: PathBuf,
    sha256: String,
}

fn write_blob(out_dir: &Path, filename: &str, blob: &[u8]) -> Result<WrittenBlob> {
    let name = Path::new(filename)
        .file_name()
        .and_then(|value| value.to_str())
        .filter(|value| !value.trim().is_empty())
        .with_context(|| format!("invalid blob filename '{filename}'"))?;
    let path = out_dir.join(name);
    fs::write(&path, blob).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(WrittenBlob {
        path,
        sha256: hex::encode(Sha256::digest(blob)),
    })
}

fn load_json_object(path: &Path) -> Result<Map<String, Value>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    let parsed: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    match parsed {
        Value::Object(map) => Ok(map),
        other => bail!(
            "{} must contain a JSON object, found {}",
            path.display(),
            json_kind(&other)
        ),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn new_invocation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
