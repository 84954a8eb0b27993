//! wpsr - Main entry point
//!
//! Command-line front end for the algorithm registry and runtime. Machine
//! readable results go to stdout as JSON; logs go to stderr.

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use wpsr::annotation::{AnnotationParser, MetadataParser};
use wpsr::cli::{collect_inputs, Cli, Commands};
use wpsr::config_store::{is_watched_change, JsonConfigStore};
use wpsr::description::ProcessDescription;
use wpsr::process_guard::{self, ProcessGuard};
use wpsr::registry::RegistryState;
use wpsr::runtime::RuntimeContext;
use wpsr::script_repository::{public_identifier, DEFAULT_PREFIX};

/// Grace period between SIGTERM and SIGKILL for engine children
const CHILD_GRACE: Duration = Duration::from_secs(3);

/// Initialize tracing on stderr; `RUST_LOG` overrides the verbosity flag
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);

    // Engine children are torn down on SIGINT/SIGTERM/SIGHUP
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = ProcessGuard::new(CHILD_GRACE);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let command = match cli.command {
        Commands::Validate { script } => return validate(&script),
        command => command,
    };

    let store = Arc::new(JsonConfigStore::new(&cli.config));
    let runtime = RuntimeContext::builder()
        .store(store.clone())
        .build()
        .with_context(|| format!("Failed to set up runtime from {}", cli.config.display()))?;
    debug!("Runtime built from {}", cli.config.display());

    let code = match command {
        Commands::Reconcile => {
            let report = runtime
                .reconcile()
                .context("Reconciliation failed")?;
            print_json(&report)?;
            ExitCode::SUCCESS
        }
        Commands::List => {
            start(&runtime)?;
            print_json(&runtime.algorithm_names())?;
            ExitCode::SUCCESS
        }
        Commands::Describe { id } => {
            start(&runtime)?;
            let description = runtime
                .describe(&id)
                .with_context(|| format!("Cannot describe {}", id))?;
            print_json(&description)?;
            ExitCode::SUCCESS
        }
        Commands::Run { id, inputs } => {
            start(&runtime)?;
            let inputs = collect_inputs(inputs);
            info!("Running {} with {} input(s)", id, inputs.len());
            match runtime.invoke_report(&id, &inputs) {
                Ok(outputs) => {
                    print_json(&outputs)?;
                    ExitCode::SUCCESS
                }
                Err(report) => {
                    print_json(&report)?;
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Watch => {
            start(&runtime)?;
            watch(&runtime, &store)?;
            ExitCode::SUCCESS
        }
        Commands::Validate { script } => validate(&script)?,
    };

    runtime.shutdown();
    Ok(code)
}

fn start(runtime: &RuntimeContext) -> Result<()> {
    let state = runtime.init().context("Runtime start-up failed")?;
    if state == RegistryState::Inactive {
        eprintln!("✗ Execution engine unavailable or repository disabled; no algorithms registered");
    }
    Ok(())
}

/// Reconcile whenever the config file or a script in a script directory
/// changes, until the process is interrupted.
fn watch(runtime: &RuntimeContext, store: &Arc<JsonConfigStore>) -> Result<()> {
    let config_dir = match store.path().parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let config_path = match store.path().file_name() {
        Some(name) => config_dir.join(name),
        None => store.path().to_path_buf(),
    };
    let script_dirs = runtime.settings().script_dirs;

    let publisher = Arc::clone(store);
    let watched_dirs = script_dirs.clone();
    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event)
                if matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                ) && event
                    .paths
                    .iter()
                    .any(|p| is_watched_change(&config_path, &watched_dirs, p)) =>
            {
                debug!("Change detected: {:?}", event.paths);
                publisher.notify_changed();
            }
            Ok(_) => {}
            Err(e) => warn!("File watch error: {}", e),
        })
        .context("Failed to create file watcher")?;

    watcher
        .watch(&config_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Cannot watch {}", config_dir.display()))?;
    for dir in script_dirs {
        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            warn!("Cannot watch script directory {}: {}", dir.display(), e);
        }
    }

    info!("Watching {} for changes (Ctrl-C to stop)", config_dir.display());
    runtime.run_event_loop();
    Ok(())
}

/// Parse one script and print its description or every problem found
fn validate(script: &Path) -> Result<ExitCode> {
    let bytes = std::fs::read(script)
        .with_context(|| format!("Failed to read {}", script.display()))?;
    let id = public_identifier(DEFAULT_PREFIX, script)
        .with_context(|| format!("Cannot derive an identifier for {}", script.display()))?;

    let messages = match AnnotationParser.parse(&bytes) {
        Ok(annotations) => match ProcessDescription::build(&id, &annotations) {
            Ok(description) => {
                print_json(&description)?;
                eprintln!("✓ {} is valid", script.display());
                return Ok(ExitCode::SUCCESS);
            }
            Err(messages) => messages,
        },
        Err(e) => vec![e.to_string()],
    };

    eprintln!("✗ {} has {} problem(s):", script.display(), messages.len());
    for message in &messages {
        eprintln!("  - {}", message);
    }
    Ok(ExitCode::FAILURE)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}
