mod config;
mod harness;

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use events::{Event, EventBus};
use futures::StreamExt;
use orchestrator::{
    ExecRequest, ExecRunResult, ExecRunner, ExecSessionManager, OrchestratorError,
    ProcessExecutor, ToolOrchestrator,
};
use streaming::{GuardMode, HandleForwarder, HandleService, PrivacyGuard, SubscribeOptions};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{RuntimeConfig, CONFIG_FILE, RUNTIME_DIR};
use harness::{render_frame, LocalSession, LocalSessionFactory, TerminalPrompter};

const OBSERVER_ID: &str = "terminal";

#[derive(Parser)]
#[command(name = "execstream")]
#[command(about = "Run commands with retries, approvals and guarded output streaming", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default .execstream/config.toml
    Init,
    /// Run a command and print its guarded event stream
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Reuse or create the named session
    #[arg(long)]
    session: Option<String>,

    /// Dispose the named session when the run ends
    #[arg(long, requires = "session")]
    ephemeral: bool,

    #[arg(long)]
    cwd: Option<String>,

    /// Environment override as KEY=VALUE, or KEY= to unset
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Ask for approval under this key before running
    #[arg(long, value_name = "KEY")]
    require_approval: Option<String>,

    /// Override the configured privacy guard mode (shadow or enforce)
    #[arg(long)]
    guard_mode: Option<GuardMode>,

    /// Print the invocation record as JSON after the run
    #[arg(long)]
    json: bool,

    command: String,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => init_project().await.map(|_| ExitCode::SUCCESS),
        Commands::Run(args) => run(args).await,
    }
}

async fn init_project() -> Result<()> {
    let cwd = std::env::current_dir()?;
    let config_path = RuntimeConfig::path(&cwd);

    if config_path.exists() {
        println!("Already initialized at {}", config_path.display());
        return Ok(());
    }

    RuntimeConfig::default()
        .write(&cwd)
        .await
        .context("Failed to write default config")?;

    println!("Created {}/{}", RUNTIME_DIR, CONFIG_FILE);
    Ok(())
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let cwd = std::env::current_dir()?;
    let loaded = RuntimeConfig::load(&cwd).await;
    let mut config = match &loaded {
        Ok(Some(config)) => config.clone(),
        _ => RuntimeConfig::default(),
    };
    if let Some(mode) = args.guard_mode {
        config.privacy.mode = mode;
    }
    init_tracing(&config.log_level);

    let config_path = RuntimeConfig::path(&cwd);
    match loaded {
        Ok(Some(_)) => debug!(path = %config_path.display(), "Config loaded successfully"),
        Ok(None) => debug!(path = %config_path.display(), "Config file does not exist, using defaults"),
        Err(e) => warn!(path = %config_path.display(), error = %format_args!("{e:#}"), "Failed to load config, using defaults"),
    }

    let event_bus = EventBus::new();
    spawn_lifecycle_logger(&event_bus);

    let guard = Arc::new(PrivacyGuard::new(config.privacy.clone()));
    let service = HandleService::new(config.handles.clone()).with_guard(guard.clone());
    let forwarder = Arc::new(HandleForwarder::new(service.clone()));

    let orchestrator = ToolOrchestrator::new(config.orchestrator.clone())
        .with_prompter(Arc::new(TerminalPrompter))
        .with_event_bus(event_bus.clone());
    let sessions = Arc::new(
        ExecSessionManager::<LocalSession>::new(Arc::new(LocalSessionFactory))
            .with_event_bus(event_bus.clone()),
    );
    let runner = ExecRunner::new(
        orchestrator,
        Arc::clone(&sessions),
        Arc::new(ProcessExecutor),
        config.exec.clone(),
    )
    .with_event_bus(event_bus.clone());
    runner.add_listener(forwarder.clone());

    let json = args.json;
    let request = build_request(args)?;
    let outcome = runner.run(request).await;

    let correlation_id = match &outcome {
        Ok(result) => Some(result.correlation_id.clone()),
        Err(e) => e
            .record()
            .and_then(|record| record.exec.as_ref())
            .map(|exec| exec.correlation_id.clone()),
    };
    if let Some(correlation_id) = correlation_id {
        print_frames(&forwarder, &correlation_id, config.handles.max_stored_frames).await?;
    }

    if let Err(e) = sessions.dispose_all().await {
        warn!(error = %e, "Failed to dispose sessions");
    }

    let metrics = guard.metrics();
    info!(
        mode = metrics.mode.as_str(),
        total = metrics.total_frames,
        allowed = metrics.allowed_frames,
        redacted = metrics.redacted_frames,
        blocked = metrics.blocked_frames,
        "Privacy guard summary"
    );

    report(outcome, json)
}

fn build_request(args: RunArgs) -> Result<ExecRequest> {
    let mut request = ExecRequest::new(args.command).with_args(args.args);
    if let Some(cwd) = args.cwd {
        request = request.with_cwd(cwd);
    }
    if let Some(session) = args.session {
        request = request.in_session(session);
        if args.ephemeral {
            request.persist_session = Some(false);
        }
    }
    if let Some(key) = args.require_approval {
        request = request.require_approval(key);
    }
    if !args.env.is_empty() {
        request.env = Some(parse_env(&args.env)?);
    }
    Ok(request)
}

fn parse_env(pairs: &[String]) -> Result<HashMap<String, Option<String>>> {
    let mut overrides = HashMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid environment override '{pair}', expected KEY=VALUE");
        };
        if key.is_empty() {
            bail!("Invalid environment override '{pair}', key is empty");
        }
        let value = (!value.is_empty()).then(|| value.to_string());
        overrides.insert(key.to_string(), value);
    }
    Ok(overrides)
}

async fn print_frames(
    forwarder: &HandleForwarder,
    correlation_id: &str,
    backlog: usize,
) -> Result<()> {
    let Some(handle_id) = forwarder.handle_for(correlation_id) else {
        return Ok(());
    };
    forwarder.close(correlation_id)?;

    let mut frames = forwarder.service().stream(
        &handle_id,
        OBSERVER_ID,
        SubscribeOptions::default().with_queue_size(backlog),
    )?;
    while let Some(frame) = frames.next().await {
        println!("{}", render_frame(&frame));
    }

    let stats = frames.stats();
    debug!(
        handle_id = %handle_id,
        delivered = stats.delivered,
        dropped = stats.dropped,
        "Frame stream finished"
    );
    Ok(())
}

fn report(outcome: orchestrator::Result<ExecRunResult>, json: bool) -> Result<ExitCode> {
    let result = match outcome {
        Ok(result) => result,
        Err(OrchestratorError::ToolInvocationFailed(failure)) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&failure.record)?);
            }
            eprintln!(
                "Command failed after {} attempt(s): {}",
                failure.record.attempt_count, failure.cause
            );
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e).context("Command did not run"),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result.record)?);
    }

    let code = match (result.exit_code, result.signal.as_deref()) {
        (Some(code), _) => u8::try_from(code).unwrap_or(1),
        (None, Some(signal)) => {
            eprintln!("Command terminated by {signal}");
            1
        }
        (None, None) => 1,
    };
    Ok(ExitCode::from(code))
}

fn spawn_lifecycle_logger(event_bus: &EventBus) {
    let mut lifecycle = Box::pin(event_bus.stream());
    tokio::spawn(async move {
        while let Some(envelope) = lifecycle.next().await {
            match &envelope.event {
                Event::Exec { .. } => {}
                event => debug!(
                    sequence = envelope.sequence,
                    kind = event.kind(),
                    session_id = ?event.session_id(),
                    "Runtime event"
                ),
            }
        }
    });
}

fn init_tracing(default_level: &str) {
    let fallback = format!(
        "execstream={default_level},orchestrator={default_level},streaming={default_level}"
    );
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .init();
}
