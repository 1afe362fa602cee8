use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use waterflow_core::services::{BrokerClient, ContextQuery};
use waterflow_core::{EngineEvent, FlowData, FlowNodeStatus};
use waterflow_handlers::HttpBroker;
use waterflow_runtime::{
    EngineConfig, FlowDefinition, FlowEngine, FlowSpec, HandlerRegistry, JoberSpec, NodeSpec, NodeType,
};

#[derive(Parser)]
#[command(name = "waterflow")]
#[command(about = "Waterflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow definition once
    Run {
        /// Path to the flow definition JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Business data as a JSON object, or an array of objects
        #[arg(short, long)]
        input: Option<String>,

        /// Operator recorded on the offered data
        #[arg(long, default_value = "cli")]
        operator: String,

        /// Invoke handlers over HTTP at this base URL instead of in-process
        #[arg(long)]
        broker_url: Option<String>,

        /// Give up waiting for the flow after this many milliseconds
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a flow definition file
    Validate {
        /// Path to the flow definition JSON file
        file: PathBuf,
    },

    /// List built-in handlers
    Handlers,

    /// Create an example flow definition
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            operator,
            broker_url,
            timeout_ms,
            verbose,
        } => {
            // Initialize logging; RUST_LOG wins over --verbose
            let default_level = if verbose { "debug" } else { "warn" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
                )
                .init();

            run_flow(file, input, operator, broker_url, Duration::from_millis(timeout_ms)).await?;
        }

        Commands::Validate { file } => {
            validate_flow(file)?;
        }

        Commands::Handlers => {
            list_handlers();
        }

        Commands::Init { output } => {
            create_example_flow(output)?;
        }
    }

    Ok(())
}

fn load_spec(file: &PathBuf) -> Result<FlowSpec> {
    let json = std::fs::read_to_string(file)?;
    Ok(FlowSpec::from_json(&json)?)
}

/// One `FlowData` per business object in `input`.
fn parse_input(input: Option<String>, operator: &str) -> Result<Vec<FlowData>> {
    let json: Value = match input {
        Some(text) => serde_json::from_str(&text)?,
        None => json!({}),
    };
    let items = match json {
        Value::Array(items) => items,
        single => vec![single],
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(business) => Ok(FlowData::new(operator).with_business_data(business)),
            other => Err(anyhow::anyhow!("Input items must be JSON objects, got {}", other)),
        })
        .collect()
}

async fn run_flow(
    file: PathBuf,
    input: Option<String>,
    operator: String,
    broker_url: Option<String>,
    timeout: Duration,
) -> Result<()> {
    println!("🚀 Loading flow from: {}", file.display());
    let spec = load_spec(&file)?;
    let data = parse_input(input, &operator)?;

    let broker: Arc<dyn BrokerClient> = match broker_url {
        Some(url) => {
            println!("   Broker: {}", url);
            Arc::new(HttpBroker::new(url))
        }
        None => {
            let mut registry = HandlerRegistry::new();
            waterflow_handlers::register_all(&mut registry);
            Arc::new(registry)
        }
    };
    let engine = FlowEngine::with_config(broker, EngineConfig::from_env());
    let definition = engine.register(spec).await?;
    let stream_id = definition.stream_id().to_string();

    println!("📋 Flow: {} ({})", definition.name(), stream_id);
    println!("   Nodes: {}", definition.node_id_set().len());
    println!("   Events: {}", definition.spec().events.len());
    println!();

    // Subscribe to events for real-time output
    let mut events = engine.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::ContextsOffered { count, .. } => {
                    println!("▶️  Offered {} context(s)", count);
                }
                EngineEvent::NodeStarted { node_id, context_ids, .. } => {
                    println!("  ⚡ {} started with {} context(s)", node_id, context_ids.len());
                }
                EngineEvent::NodeCompleted {
                    node_id,
                    forwarded,
                    duration_ms,
                    ..
                } => {
                    println!("  ✅ {} completed in {}ms, forwarded {}", node_id, duration_ms, forwarded);
                }
                EngineEvent::NodeBlocked { node_id, context_ids, .. } => {
                    println!("  ⏸️  {} waiting for resume ({} context(s))", node_id, context_ids.len());
                }
                EngineEvent::NodeFailed { node_id, error, .. } => {
                    println!("  ❌ {} failed [{}]: {}", node_id, error.error_code, error.error_message);
                }
                EngineEvent::ContextsRetrying { node_id, to_batch, .. } => {
                    println!("  🔁 {} retrying batch {}", node_id, to_batch);
                }
                EngineEvent::ContextsArchived { node_id, context_ids, .. } => {
                    println!("  📦 {} archived {} context(s)", node_id, context_ids.len());
                }
            }
        }
    });

    let trace_id = engine.offer(&stream_id, data).await?;
    let settled = engine.settle(&stream_id, &trace_id, timeout).await;

    // Wait for events to finish printing
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();
    let contexts = settled?;

    println!();
    println!("📊 Execution Summary:");
    println!("   Trace ID: {}", trace_id);
    println!("   Contexts: {}", contexts.len());

    let ends: Vec<String> = definition
        .spec()
        .nodes
        .iter()
        .filter(|n| n.node_type == NodeType::End)
        .map(|n| n.meta_id.clone())
        .collect();
    for ctx in &contexts {
        match ctx.status {
            FlowNodeStatus::Archived if ends.contains(&ctx.position) => {
                println!();
                println!("📤 Result at {}:", ctx.position);
                println!("{}", serde_json::to_string_pretty(&ctx.data.business_data)?);
            }
            FlowNodeStatus::Error => {
                if let Some(info) = ctx.data.error_info() {
                    println!();
                    println!("💥 Error at {} [{}]: {}", info.node_name, info.error_code, info.error_message);
                }
            }
            FlowNodeStatus::Pending => {
                println!();
                println!("⏸️  Context {} is waiting at {}", ctx.id, ctx.position);
            }
            FlowNodeStatus::Retryable => {
                println!();
                println!("🔁 Context {} is retryable at {}", ctx.id, ctx.position);
            }
            _ => {}
        }
    }

    let pending = engine
        .contexts(&ContextQuery::stream(&stream_id).trace(&trace_id).status(FlowNodeStatus::Pending))
        .await?;
    if !pending.is_empty() {
        println!();
        println!("Resume parked contexts through the server API.");
    }

    Ok(())
}

fn validate_flow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating flow: {}", file.display());

    let spec = load_spec(&file)?;
    let definition = FlowDefinition::from_spec(spec)?;
    let reachable = definition.reachable().len();
    let total = definition.node_id_set().len();

    println!("✅ Flow is valid:");
    println!("   Name: {}", definition.name());
    println!("   Stream: {}", definition.stream_id());
    println!("   Nodes: {} ({} reachable)", total, reachable);
    println!("   Events: {}", definition.spec().events.len());

    Ok(())
}

fn list_handlers() {
    println!("📦 Built-in handlers:");
    println!();

    let mut registry = HandlerRegistry::new();
    waterflow_handlers::register_all(&mut registry);

    for id in registry.list_handlers() {
        if let Some(metadata) = registry.get_metadata(&id) {
            println!("  • {} ({})", id, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", id);
        }
    }
}

fn create_example_flow(output: PathBuf) -> Result<()> {
    let mut spec = FlowSpec::new("example", "Example HTTP flow");

    spec.add_node(NodeSpec::start("start"));
    spec.add_node(
        NodeSpec::state("fetch")
            .with_name("Fetch Data")
            .with_jober(
                JoberSpec::new("http.request")
                    .with_property("url", "https://api.github.com/zen")
                    .with_property("method", "GET")
                    .with_timeout(10_000),
            )
            .with_retry(2, 500),
    );
    spec.add_node(NodeSpec::condition("check").with_name("Check Status"));
    spec.add_node(
        NodeSpec::state("log")
            .with_name("Log Response")
            .with_jober(JoberSpec::new("debug.log").with_property("message", "fetched")),
    );
    spec.add_node(NodeSpec::end("done"));
    spec.add_node(NodeSpec::end("failed"));

    spec.connect("start", "fetch");
    spec.connect("fetch", "check");
    spec.connect_when("check", "log", "businessData.status == 200");
    spec.connect("check", "failed");
    spec.connect("log", "done");
    spec.validate()?;

    // Save to file
    let json = serde_json::to_string_pretty(&spec)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example flow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  waterflow run --file {} --input '{{\"ticket\": 1}}'", output.display());

    Ok(())
}
