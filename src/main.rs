use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use weir_core::config::{AppConfig, EnvBackendKind};
use weir_core::event::EventBus;
use weir_core::traits::{AgentRegistry, RunStore};
use weir_core::types::{ApprovalDecision, EngineEvent, TriggerKind, WorkflowDefinition};
use weir_engine::{dag, Engine, RunLogWriter, TriggerService};
use weir_env::{DockerBackend, EnvironmentBackend, ProcessBackend};
use weir_gateway::GatewayServer;
use weir_invoker::ConfigAgentRegistry;
use weir_store::SqliteRunStore;

#[derive(Parser)]
#[command(name = "weir", version, about = "Workflow orchestration engine")]
struct Cli {
    /// Path to config file (default: ./weir.toml, then ~/.weir/weir.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine, trigger service and HTTP gateway
    Serve,
    /// Check a workflow definition file without running anything
    Validate {
        /// Path to a workflow JSON file
        file: PathBuf,
    },
    /// Execute a workflow definition file and print its events
    Run {
        /// Path to a workflow JSON file
        file: PathBuf,
        /// Trigger context as inline JSON
        #[arg(long)]
        context: Option<String>,
    },
    /// List recent runs
    Runs {
        /// Number of runs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Decide a pending approval via the running gateway
    Approve {
        /// Approval id
        id: String,
        /// Reject instead of approve
        #[arg(long)]
        reject: bool,
        /// Recorded as the deciding party
        #[arg(long, default_value = "cli")]
        by: String,
        /// Reason recorded on rejection
        #[arg(long)]
        reason: Option<String>,
    },
    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weir=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Validation is pure; it needs neither config nor store.
    if let Commands::Validate { file } = &cli.command {
        return validate_file(file);
    }

    let config = AppConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Run { file, context } => run_local(config, &file, context.as_deref()).await,
        Commands::Runs { limit } => list_runs(config, limit).await,
        Commands::Approve {
            id,
            reject,
            by,
            reason,
        } => approve(config, &id, reject, by, reason).await,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Validate { .. } => unreachable!("handled before config load"),
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let bus = Arc::new(EventBus::default());
    let backend = build_backend(&config)?;
    let registry: Arc<dyn AgentRegistry> = Arc::new(ConfigAgentRegistry::new(config.agents.clone()));
    let engine = Arc::new(Engine::new(
        config.clone(),
        store.clone(),
        registry,
        backend,
        bus.clone(),
    ));

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        ctrl_c_cancel.cancel();
    });

    // Clear environments stranded by an earlier crash.
    if let Err(e) = engine.sweep_orphans().await {
        error!(error = %e, "Orphan sweep failed");
    }

    if config.log.enabled {
        let writer = RunLogWriter::new(config.log_dir(), bus.clone(), cancel.clone());
        tokio::spawn(writer.run());
    }

    let triggers = TriggerService::new(engine.clone(), store.clone(), bus.clone(), cancel.clone());
    tokio::spawn(async move { triggers.run().await });

    let gateway = GatewayServer::new(config.gateway.clone(), engine, store, config.log_dir());
    gateway.run(cancel).await?;
    Ok(())
}

fn validate_file(path: &Path) -> anyhow::Result<()> {
    let def = read_definition(path)?;
    dag::validate(&def)?;
    println!("{}: ok ({} nodes)", def.id, def.nodes.len());
    Ok(())
}

async fn run_local(config: AppConfig, file: &Path, context: Option<&str>) -> anyhow::Result<()> {
    let def = read_definition(file)?;
    let context: Value = match context {
        Some(raw) => serde_json::from_str(raw)?,
        None => Value::Null,
    };

    let store = open_store(&config)?;
    let bus = Arc::new(EventBus::default());
    let backend = build_backend(&config)?;
    let registry: Arc<dyn AgentRegistry> = Arc::new(ConfigAgentRegistry::new(config.agents.clone()));
    let engine = Engine::new(config, store.clone(), registry, backend, bus.clone());

    // Retry and chained triggers look the definition up by id.
    store.put_workflow(&def).await?;

    let mut rx = bus.subscribe();
    let run_id = engine.trigger_run(&def, context, TriggerKind::Manual).await?;
    println!("run {}", run_id);

    let mut failed = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if let Err(e) = engine.cancel_run(&run_id).await {
                    error!(error = %e, "Cancel failed");
                }
            }
            event = rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if event.run_id() != &run_id {
                    continue;
                }
                print_event(&event);
                if event.is_run_terminal() {
                    failed = matches!(event, EngineEvent::RunFailed { .. });
                    break;
                }
            }
        }
    }

    if failed {
        anyhow::bail!("run {} failed", run_id);
    }
    Ok(())
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::RunStarted { workflow_id, .. } => println!("run started ({})", workflow_id),
        EngineEvent::NodeDispatched {
            node_id, attempt, ..
        } => println!("  {} dispatched (attempt {})", node_id, attempt),
        EngineEvent::NodeSuccess { node_id, .. } => println!("  {} ok", node_id),
        EngineEvent::NodeFailed {
            node_id,
            error_kind,
            error,
            ..
        } => println!("  {} failed [{}]: {}", node_id, error_kind, error),
        EngineEvent::NodeSkipped { node_id, .. } => println!("  {} skipped", node_id),
        EngineEvent::ApprovalRequested {
            node_id,
            approval_id,
            ..
        } => println!("  {} awaiting approval ({})", node_id, approval_id),
        EngineEvent::ApprovalDecided {
            approved,
            decided_by,
            ..
        } => {
            let verdict = if *approved { "granted" } else { "rejected" };
            println!("  approval {} by {}", verdict, decided_by);
        }
        EngineEvent::RunSuccess { .. } => println!("run succeeded"),
        EngineEvent::RunFailed { error, .. } => println!("run failed: {}", error),
        EngineEvent::RunCancelled { .. } => println!("run cancelled"),
    }
}

async fn list_runs(config: AppConfig, limit: usize) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let runs = store.list_runs(limit).await?;
    if runs.is_empty() {
        println!("no runs recorded");
        return Ok(());
    }
    for run in runs {
        let when = run.created_at.format("%Y-%m-%d %H:%M:%S");
        let error = run.error.as_deref().unwrap_or("");
        println!(
            "{}  {}  {:<24} {:<8} {:<16} {}",
            run.id, when, run.workflow_id, run.trigger_kind, run.status, error
        );
    }
    Ok(())
}

async fn approve(
    config: AppConfig,
    id: &str,
    reject: bool,
    by: String,
    reason: Option<String>,
) -> anyhow::Result<()> {
    let decision = if reject {
        ApprovalDecision::Rejected {
            decided_by: by,
            reason,
        }
    } else {
        ApprovalDecision::Approved { decided_by: by }
    };

    let url = format!("http://{}/api/approvals/{}", config.gateway.bind, id);
    let client = reqwest::Client::new();
    let mut request = client.post(&url).json(&decision);
    if let Some(token) = &config.gateway.token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await?;

    if response.status().is_success() {
        println!("{}: {}", id, if reject { "rejected" } else { "approved" });
        Ok(())
    } else {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or_default();
        anyhow::bail!(
            "gateway refused ({}): {}",
            status,
            body["error"].as_str().unwrap_or("unknown error")
        )
    }
}

fn read_definition(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn RunStore>> {
    let path = config.db_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Arc::new(SqliteRunStore::open(&path)?))
}

fn build_backend(config: &AppConfig) -> anyhow::Result<Arc<dyn EnvironmentBackend>> {
    let workdir = config.env_workdir();
    match config.environment.backend {
        EnvBackendKind::Docker => Ok(Arc::new(DockerBackend::new(
            config.environment.clone(),
            workdir,
        )?)),
        EnvBackendKind::Process => Ok(Arc::new(ProcessBackend::new(
            config.environment.clone(),
            workdir,
        ))),
    }
}
