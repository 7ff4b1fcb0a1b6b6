use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{ContextData, ExecutionEvent, StepEvent, Value, WorkflowStatus};
use flowruntime::{HostConfig, StepRegistry, WorkflowHost};
use samples::Sample;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod samples;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    /// Host configuration file (TOML)
    #[arg(short, long, global = true, env = "FLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Upper bound on concurrently running steps per instance
    #[arg(long, global = true, env = "FLOW_MAX_PARALLEL_STEPS")]
    max_parallel_steps: Option<usize>,

    /// How long stop waits for in-flight steps
    #[arg(long, global = true, env = "FLOW_SHUTDOWN_TIMEOUT_MS")]
    shutdown_timeout_ms: Option<u64>,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one of the sample workflows
    Run {
        #[command(subcommand)]
        sample: RunSample,

        /// Extra input data as a JSON object
        #[arg(short, long, global = true)]
        input: Option<String>,

        /// Seconds to wait for the instance to settle
        #[arg(long, global = true, default_value_t = 30)]
        wait_secs: u64,
    },

    /// List available step types
    Steps,

    /// Print a sample's compiled graph in DOT format
    Graph {
        #[arg(value_enum)]
        sample: Sample,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum RunSample {
    /// SayHello, three parallel branches, Join, SayGoodbye
    Parallel,
    /// Route on the `approved` flag
    Approval {
        #[arg(long, action = clap::ArgAction::Set)]
        approved: bool,
    },
    /// Route on `value` through a nested decision
    Switch {
        #[arg(long, allow_hyphen_values = true)]
        value: i64,
    },
}

impl RunSample {
    fn sample(self) -> Sample {
        match self {
            RunSample::Parallel => Sample::Parallel,
            RunSample::Approval { .. } => Sample::Approval,
            RunSample::Switch { .. } => Sample::Switch,
        }
    }

    fn input(self) -> ContextData {
        match self {
            RunSample::Parallel => ContextData::new(),
            RunSample::Approval { approved } => {
                ContextData::from([("approved".to_string(), Value::from(approved))])
            }
            RunSample::Switch { value } => {
                ContextData::from([("value".to_string(), Value::from(value))])
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run {
            sample,
            input,
            wait_secs,
        } => {
            run_sample(config, sample, input, Duration::from_secs(wait_secs)).await?;
        }

        Commands::Steps => {
            list_steps();
        }

        Commands::Graph { sample } => {
            let definition = sample.definition()?;
            print!("{}", definition.to_dot());
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<HostConfig> {
    let mut config = match &cli.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };
    if let Some(max) = cli.max_parallel_steps {
        config.max_parallel_steps = max;
    }
    if let Some(timeout) = cli.shutdown_timeout_ms {
        config.shutdown_timeout_ms = timeout;
    }
    tracing::debug!(?config, "Host configuration");
    Ok(config)
}

fn registry() -> Arc<StepRegistry> {
    let mut registry = StepRegistry::new();
    flowsteps::register_all(&mut registry);
    Arc::new(registry)
}

fn parse_input(input: Option<String>) -> Result<ContextData> {
    let Some(text) = input else {
        return Ok(ContextData::new());
    };
    let json: serde_json::Value =
        serde_json::from_str(&text).context("Input must be valid JSON")?;
    match Value::from_json(json) {
        Value::Object(map) => Ok(map),
        _ => bail!("Input must be a JSON object"),
    }
}

async fn run_sample(
    config: HostConfig,
    sample: RunSample,
    input: Option<String>,
    wait: Duration,
) -> Result<()> {
    let mut data = parse_input(input)?;
    data.extend(sample.input());

    let definition = sample.sample().definition()?;
    println!("📋 Workflow: {} v{}", definition.id(), definition.version());
    if let Some(description) = definition.description() {
        println!("   {}", description);
    }
    println!("   Steps: {}", definition.step_count());
    println!();

    let workflow_id = definition.id().to_string();
    let host = WorkflowHost::with_registry(registry(), config);
    host.register_workflow(definition).await?;

    // Subscribe to events for real-time output
    let mut events = host.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(event);
        }
    });

    host.start().await?;
    let instance_id = host.start_workflow(&workflow_id, data).await?;
    let result = host.wait_for(instance_id, wait).await;
    host.stop().await;

    // Wait for events to finish printing
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();

    let state = result?;
    println!();
    println!("📊 Execution Summary:");
    println!("   Instance ID: {}", state.id);
    println!("   Status: {}", state.status);
    println!("   Steps completed: {}", state.steps_completed);
    if let Some(error) = &state.error {
        println!("   Error: {}", error);
    }
    if !state.data().is_empty() {
        println!();
        println!("📤 Context:");
        for (key, value) in state.data() {
            println!("   {}: {}", key, value);
        }
    }

    if state.status != WorkflowStatus::Completed {
        bail!("Workflow ended with status {}", state.status);
    }
    Ok(())
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::WorkflowStarted { workflow_id, .. } => {
            println!("▶️  Workflow {} started", workflow_id);
        }
        ExecutionEvent::StepStarted { step, attempt, .. } => {
            if attempt > 1 {
                println!("  ⚡ Starting step: {} (attempt {})", step, attempt);
            } else {
                println!("  ⚡ Starting step: {}", step);
            }
        }
        ExecutionEvent::StepCompleted { step, duration_ms, .. } => {
            println!("  ✅ Step {} completed in {}ms", step, duration_ms);
        }
        ExecutionEvent::StepRetrying { step, error, .. } => {
            println!("  🔁 Step {} failed, retrying: {}", step, error);
        }
        ExecutionEvent::StepFailed { step, error, .. } => {
            println!("  ❌ Step {} failed: {}", step, error);
        }
        ExecutionEvent::BranchesForked { branches, .. } => {
            println!("  🔀 Forked {} branches", branches);
        }
        ExecutionEvent::BranchesJoined { branches, conflicts, .. } => {
            if conflicts.is_empty() {
                println!("  🔗 Joined {} branches", branches);
            } else {
                println!("  🔗 Joined {} branches (conflicting keys: {})", branches, conflicts.join(", "));
            }
        }
        ExecutionEvent::DecisionTaken { discriminant, .. } => {
            let shown = discriminant.unwrap_or_else(|| "no value".to_string());
            println!("  🔀 Decision on {}", shown);
        }
        ExecutionEvent::StepEvent { step, event, .. } => match event {
            StepEvent::Info { message } => {
                println!("     ℹ️  [{}] {}", step, message);
            }
            StepEvent::Warning { message } => {
                println!("     ⚠️  [{}] {}", step, message);
            }
            StepEvent::Progress { percent, message } => {
                if let Some(msg) = message {
                    println!("     📊 [{}] {}% - {}", step, percent, msg);
                } else {
                    println!("     📊 [{}] {}%", step, percent);
                }
            }
            StepEvent::Data { .. } => {}
        },
        ExecutionEvent::WorkflowSuspended { tokens, .. } => {
            println!("⏸️  Workflow suspended, waiting on: {}", tokens.join(", "));
        }
        ExecutionEvent::WorkflowResumed { .. } => {
            println!("⏯️  Workflow resumed");
        }
        ExecutionEvent::WorkflowCompleted {
            status,
            error,
            duration_ms,
            ..
        } => match (status, error) {
            (WorkflowStatus::Completed, _) => {
                println!("✨ Workflow completed successfully in {}ms", duration_ms);
            }
            (status, Some(error)) => {
                println!("💥 Workflow {} after {}ms: {}", status, duration_ms, error);
            }
            (status, None) => {
                println!("💥 Workflow {} after {}ms", status, duration_ms);
            }
        },
    }
}

fn list_steps() {
    println!("📦 Available Step Types:");
    println!();

    let registry = registry();
    for step_type in registry.list_step_types() {
        if let Some(metadata) = registry.get_metadata(&step_type) {
            println!("  • {} ({})", step_type, metadata.category);
            println!("    {}", metadata.description);
            for input in metadata.inputs {
                let marker = if input.required { "required" } else { "optional" };
                println!("      - {} [{}]: {}", input.name, marker, input.description);
            }
        } else {
            println!("  • {}", step_type);
        }
    }
}
