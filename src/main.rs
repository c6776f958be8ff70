//! TaskDeck CLI Entry Point
//!
//! Runs a YAML-defined workflow against simulated workers and prints the
//! execution event stream.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! taskdeck workflow.yaml
//!
//! # Override the parallelism cap
//! taskdeck workflow.yaml --parallel 8
//!
//! # Register a worker explicitly (repeatable)
//! taskdeck workflow.yaml --worker fast-box:compute,io:4
//!
//! # Simulate step durations (divide estimates by N; 0 = instant)
//! taskdeck workflow.yaml --time-scale 10
//! ```

use std::collections::{HashMap, HashSet};
use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};

use taskdeck::execution::{
    EngineConfig, ExecutionEngine, ExecutionEvent, SimulationExecutor,
};
use taskdeck::workflow::parser::load_workflow;
use taskdeck::{APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Default per-worker concurrency for auto-registered workers.
fn default_worker_concurrency() -> usize {
    num_cpus::get().max(1)
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_path: String,
    max_parallel: Option<usize>,
    session_id: Option<String>,
    /// Explicit worker definitions: (id, capabilities, max concurrent)
    workers: Vec<(String, Vec<String>, usize)>,
    time_scale: u64,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            max_parallel: None,
            session_id: None,
            workers: Vec::new(),
            time_scale: 0,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Dependency-Aware Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: taskdeck [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>     Path to workflow YAML file");
    println!();
    println!("Options:");
    println!("  --parallel N        Override the workflow's parallelism cap");
    println!("  --worker SPEC       Register a worker as id:cap1,cap2:max (repeatable)");
    println!("  --session ID        Attach a session id to the run");
    println!("  --time-scale N      Divide simulated step durations by N (default: instant)");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  taskdeck pipeline.yaml");
    println!("  taskdeck pipeline.yaml --parallel 8");
    println!("  taskdeck pipeline.yaml --worker gpu-box:gpu:2 --worker io-box:io:8");
}

/// Parses a `--worker` value of the form `id:cap1,cap2:max`.
fn parse_worker_spec(value: &str) -> Result<(String, Vec<String>, usize), String> {
    let parts: Vec<&str> = value.split(':').collect();
    match parts.as_slice() {
        [id, caps] | [id, caps, _] if id.is_empty() || caps.is_empty() => {
            Err(format!("Invalid worker spec: {}", value))
        }
        [id, caps] => Ok((
            id.to_string(),
            caps.split(',').map(str::to_string).collect(),
            default_worker_concurrency(),
        )),
        [id, caps, max] => {
            let max = max
                .parse()
                .map_err(|_| format!("Invalid worker concurrency: {}", max))?;
            Ok((
                id.to_string(),
                caps.split(',').map(str::to_string).collect(),
                max,
            ))
        }
        _ => Err(format!("Invalid worker spec: {}", value)),
    }
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--parallel" => {
                i += 1;
                if i >= args.len() {
                    return Err("--parallel requires a number argument".to_string());
                }
                let value = args[i]
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", args[i]))?;
                config.max_parallel = Some(value);
            }
            "--worker" => {
                i += 1;
                if i >= args.len() {
                    return Err("--worker requires a spec argument".to_string());
                }
                config.workers.push(parse_worker_spec(&args[i])?);
            }
            "--session" => {
                i += 1;
                if i >= args.len() {
                    return Err("--session requires an id argument".to_string());
                }
                config.session_id = Some(args[i].clone());
            }
            "--time-scale" => {
                i += 1;
                if i >= args.len() {
                    return Err("--time-scale requires a number argument".to_string());
                }
                config.time_scale = args[i]
                    .parse()
                    .map_err(|_| format!("Invalid time-scale value: {}", args[i]))?;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // Positional argument
                match positional_index {
                    0 => config.workflow_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Prints one execution event in a compact human-readable form.
fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::WorkflowStarted { name, .. } => {
            println!("▶ workflow '{}' started", name);
        }
        ExecutionEvent::StepStarted { worker, step_id, .. } => {
            println!("  → '{}' on worker '{}'", step_id, worker);
        }
        ExecutionEvent::StepCompleted { worker, step_index, .. } => {
            println!("  ✓ step {} completed on '{}'", step_index, worker);
        }
        ExecutionEvent::StepError { step_index, kind, message, .. } => {
            println!("  ✗ step {} failed ({}): {}", step_index, kind, message);
        }
        ExecutionEvent::WorkflowCompleted { summary, .. } => {
            println!();
            println!(
                "■ finished: {:?}, {}/{} steps, {:.0}% success, {}ms",
                summary.state,
                summary.completed_steps,
                summary.total_steps,
                summary.success_rate * 100.0,
                summary.total_execution_time_ms
            );
        }
    }
}

/// Main application entry point.
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    // Load workflow
    info!("Loading workflow: {}", config.workflow_path);
    let mut workflow = load_workflow(&config.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            config.workflow_path, e
        )
    })?;

    if let Some(max) = config.max_parallel {
        workflow = workflow.with_max_parallel(max);
    }
    info!(
        "Workflow loaded: {} steps, strategy {:?}",
        workflow.len(),
        workflow.strategy
    );

    // Create the engine and register workers
    let engine = ExecutionEngine::new(
        EngineConfig::default(),
        Arc::new(SimulationExecutor::new(config.time_scale)),
    );

    if config.workers.is_empty() {
        // One auto-registered worker per distinct required capability
        let capabilities: HashSet<String> = workflow
            .steps
            .iter()
            .flat_map(|s| {
                std::iter::once(s.capability.clone()).chain(s.extra_capabilities.iter().cloned())
            })
            .collect();
        for capability in capabilities {
            let id = format!("{}-worker", capability);
            engine.register_worker(id, [capability], default_worker_concurrency());
        }
    } else {
        for (id, capabilities, max) in config.workers {
            engine.register_worker(id, capabilities, max);
        }
    }

    // Execute the workflow and stream its events
    let id = engine.submit(workflow).await?;
    let mut run = engine
        .execute_workflow(id, HashMap::new(), config.session_id)
        .await?;

    while let Some(event) = run.recv().await {
        print_event(&event);
    }

    if let Some(status) = engine.workflow_status(id).await {
        if status.state != taskdeck::workflow::WorkflowState::Completed {
            return Err(format!("workflow finished in state {:?}", status.state).into());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
