use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sdgen_contracts::config::{ProgressTransport, ServiceConfig};
use sdgen_contracts::events::EventWriter;
use sdgen_contracts::generation::GenerationMode;
use sdgen_contracts::models::ModelRegistry;
use sdgen_engine::{
    build_client, open_session, DryrunConfig, SessionError, SessionMachine, SessionSnapshot,
    SessionStatus,
};
use serde_json::{json, Value};

const EXIT_READY: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_REJECTED: i32 = 2;
const UPDATE_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Parser)]
#[command(name = "sdgen", version, about = "Drive one image-generation session from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Models(ModelsArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    /// `text` or `image`.
    #[arg(long, default_value = "text")]
    mode: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    reference: Option<PathBuf>,
    #[arg(long)]
    strength: Option<f64>,
    #[arg(long)]
    negative_prompt: Option<String>,
    #[arg(long)]
    steps: Option<u32>,
    #[arg(long)]
    cfg_scale: Option<f64>,
    #[arg(long)]
    sampler: Option<String>,
    #[arg(long)]
    seed: Option<i64>,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    dryrun: bool,
    #[arg(long)]
    poll: bool,
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    backoff_ms: Option<u64>,
    /// Print the final session snapshot as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct ModelsArgs {
    #[arg(long)]
    mode: Option<String>,
    #[arg(long)]
    json: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sdgen error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Models(args) => run_models(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let mode = parse_mode(&args.mode)?;
    let config = service_config(&args, ServiceConfig::from_env());
    let session_id = uuid::Uuid::new_v4().to_string();
    let events = match &args.events {
        Some(path) => EventWriter::new(path, session_id),
        None => EventWriter::in_memory(session_id),
    };
    let dryrun = args.dryrun.then(DryrunConfig::default);
    let client = build_client(&config, dryrun)?;
    let mut machine = open_session(&config, client, events);

    if let Some(code) = fill_form(&mut machine, &args, mode)? {
        return Ok(code);
    }
    match machine.on_submit() {
        Ok(_) => {}
        Err(err) => return rejected(err),
    }

    let mut reporter = ProgressReporter::default();
    while machine.session().status.is_in_flight() {
        machine.wait_for_update(UPDATE_WAIT);
        for line in reporter.observe(machine.session()) {
            println!("{line}");
        }
    }

    let code = finish(&machine, args.out.as_deref())?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&machine.snapshot())?);
    }
    machine.shutdown();
    Ok(code)
}

fn service_config(args: &GenerateArgs, mut config: ServiceConfig) -> ServiceConfig {
    if args.poll {
        config.transport = ProgressTransport::Poll;
    }
    if let Some(attempts) = args.max_attempts {
        config.poll_max_attempts = NonZeroU32::new(attempts);
    }
    if let Some(backoff_ms) = args.backoff_ms {
        config.poll_backoff = Duration::from_millis(backoff_ms.clamp(10, 60_000));
    }
    config
}

/// Forwards the command-line form to the session. `Some(code)` means an edit was rejected.
fn fill_form(
    machine: &mut SessionMachine,
    args: &GenerateArgs,
    mode: GenerationMode,
) -> Result<Option<i32>> {
    machine.on_prompt_change(args.prompt.clone());
    if let Some(model) = &args.model {
        if let Err(err) = machine.on_model_change(model) {
            return rejected(err).map(Some);
        }
    }
    machine.on_mode_change(mode)?;
    if let Some(path) = &args.reference {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read reference image {}", path.display()))?;
        if let Err(err) = machine.on_reference_image_selected(bytes) {
            return rejected(err).map(Some);
        }
    }
    if let Some(strength) = args.strength {
        if let Err(err) = machine.on_reference_strength_change(strength) {
            return rejected(err).map(Some);
        }
    }

    let mut options = machine.session().options.clone();
    if let Some(negative_prompt) = &args.negative_prompt {
        options.negative_prompt = negative_prompt.clone();
    }
    if let Some(steps) = args.steps {
        options.steps = steps;
    }
    if let Some(cfg_scale) = args.cfg_scale {
        options.cfg_scale = cfg_scale;
    }
    if let Some(sampler) = &args.sampler {
        options.sampler = sampler.clone();
    }
    if args.seed.is_some() {
        options.seed = args.seed;
    }
    machine.on_options_change(options)?;
    Ok(None)
}

fn rejected(err: SessionError) -> Result<i32> {
    match err {
        SessionError::Validation(err) => {
            eprintln!("sdgen: {err}");
            Ok(EXIT_REJECTED)
        }
        other => Err(other.into()),
    }
}

fn finish(machine: &SessionMachine, out: Option<&Path>) -> Result<i32> {
    let session = machine.session();
    match session.status {
        SessionStatus::Ready => {
            let handle = session
                .result_handle
                .as_ref()
                .context("session is ready but holds no result")?;
            let bytes = machine
                .resource(handle)
                .context("result handle was released before it could be saved")?;
            let path = out
                .map(Path::to_path_buf)
                .unwrap_or_else(|| default_output_path(handle.mime_type()));
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(&path, bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!(
                "saved {} ({} bytes, {})",
                path.display(),
                bytes.len(),
                handle.mime_type()
            );
            Ok(EXIT_READY)
        }
        SessionStatus::Failed => {
            let message = session
                .error_message
                .as_deref()
                .unwrap_or("Generation failed.");
            eprintln!("sdgen: {message}");
            Ok(EXIT_FAILED)
        }
        other => bail!("session stopped in unexpected state {other}"),
    }
}

fn run_models(args: ModelsArgs) -> Result<i32> {
    let registry = ModelRegistry::new(None);
    let models = match &args.mode {
        Some(raw) => registry.by_capability(parse_mode(raw)?.as_str()),
        None => registry.list().cloned().collect(),
    };
    if args.json {
        let rows = models
            .iter()
            .map(|model| {
                json!({
                    "name": model.name,
                    "family": model.family,
                    "capabilities": model.capabilities,
                    "default_steps": model.default_steps,
                })
            })
            .collect::<Vec<Value>>();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(0);
    }
    for model in &models {
        let steps = model
            .default_steps
            .map(|steps| steps.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<18} steps={:<4} {}",
            model.name,
            model.family,
            steps,
            model.capabilities.join(",")
        );
    }
    Ok(0)
}

fn parse_mode(raw: &str) -> Result<GenerationMode> {
    match GenerationMode::parse(raw) {
        Some(mode) => Ok(mode),
        None => bail!("unknown mode '{raw}'; expected 'text' or 'image'"),
    }
}

fn default_output_path(mime_type: &str) -> PathBuf {
    let extension = match mime_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        _ => "bin",
    };
    PathBuf::from(format!("sdgen-result.{extension}"))
}

#[derive(Debug, Default)]
struct ProgressReporter {
    status: Option<SessionStatus>,
    percent: Option<u32>,
}

impl ProgressReporter {
    fn observe(&mut self, session: &SessionSnapshot) -> Vec<String> {
        let mut lines = Vec::new();
        if self.status != Some(session.status) {
            self.status = Some(session.status);
            match (&session.status, &session.session_token) {
                (SessionStatus::AwaitingResult, Some(token)) => {
                    lines.push(format!("generating (image id {token})"));
                }
                (status, _) => lines.push(status.to_string()),
            }
        }
        if session.status == SessionStatus::AwaitingResult {
            let percent = session.progress_fraction.floor() as u32;
            if self.percent != Some(percent) && session.progress_fraction > 0.0 {
                self.percent = Some(percent);
                lines.push(format!("progress {percent}%"));
            }
        }
        lines
    }
}
