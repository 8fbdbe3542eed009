//! hostagentd entry point.
//!
//! Loads the configuration, wires the switch backends, applies goal-state
//! documents (one JSON object per line) from a file or stdin and then keeps
//! the background tasks running until SIGINT.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use hostagent::dataplane::{InMemoryDataplane, OvsCliDataplane};
use hostagent::goal_state::GoalState;
use hostagent::on_demand::{completion_queue, OrchestratorRpcClient, ResolutionRequest};
use hostagent::{AgentConfig, HostAgent, HostAgentCollaborators};
use hostagent_common::{AgentError, AgentResult};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

const COMPLETION_QUEUE_CAPACITY: usize = 1024;

/// Per-host overlay network agent
#[derive(Parser, Debug)]
#[command(name = "hostagentd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Tunnel endpoint address of this host
    #[arg(long)]
    host_ip: Option<Ipv4Addr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty_logs: bool,

    /// Program an in-memory switch instead of Open vSwitch
    #[arg(long)]
    dry_run: bool,

    /// Goal-state file to apply at startup, one JSON document per line ("-" for stdin)
    #[arg(short = 'g', long)]
    goal_state: Option<String>,

    /// Runtime worker threads
    #[arg(long)]
    worker_threads: Option<usize>,
}

/// Orchestrator client used until a control-plane connection is configured.
struct DisconnectedOrchestrator;

#[async_trait]
impl OrchestratorRpcClient for DisconnectedOrchestrator {
    async fn request_resolution(&self, request: ResolutionRequest) -> AgentResult<()> {
        Err(AgentError::upstream(
            "request_resolution",
            format!("no orchestrator connection for request {}", request.request_id),
        ))
    }
}

fn load_config(args: &Args) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::from_yaml_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if let Some(host_ip) = args.host_ip {
        config.host_ip = Some(host_ip);
    }
    if let Some(worker_threads) = args.worker_threads {
        config.worker_threads = worker_threads;
    }
    config.dry_run |= args.dry_run;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn collaborators(config: &AgentConfig) -> HostAgentCollaborators {
    let local = Arc::new(InMemoryDataplane::new());
    let orchestrator = Arc::new(DisconnectedOrchestrator);
    if config.dry_run {
        return HostAgentCollaborators::in_memory(local, orchestrator);
    }

    // The ARP table and the responders are agent-local.
    let ovs = Arc::new(OvsCliDataplane::new());
    HostAgentCollaborators {
        topology: ovs.clone(),
        flows: ovs,
        address_resolution: local.clone(),
        arp_responder: local.clone(),
        dhcp_responder: local,
        orchestrator,
    }
}

async fn apply_documents<R: AsyncBufRead + Unpin>(agent: &HostAgent, reader: R) -> Result<usize> {
    let mut lines = reader.lines();
    let mut applied = 0;
    while let Some(line) = lines.next_line().await.context("reading goal state")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let goal_state: GoalState = match serde_json::from_str(line) {
            Ok(goal_state) => goal_state,
            Err(e) => {
                warn!(error = %e, "skipping malformed goal-state document");
                continue;
            }
        };
        let reply = agent.apply_goal_state(goal_state).await?;
        println!("{}", serde_json::to_string(&reply)?);
        applied += 1;
    }
    Ok(applied)
}

async fn run(config: AgentConfig, goal_state: Option<String>) -> Result<()> {
    let (_completion_tx, completion_rx) = completion_queue(COMPLETION_QUEUE_CAPACITY);
    let agent = HostAgent::new(config.clone(), collaborators(&config), completion_rx);
    agent.start()?;

    match goal_state.as_deref() {
        Some("-") => {
            let applied = apply_documents(&agent, BufReader::new(tokio::io::stdin())).await?;
            info!(applied, "goal state from stdin applied");
        }
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening goal-state file {}", path))?;
            let applied = apply_documents(&agent, BufReader::new(file)).await?;
            info!(applied, path, "goal state file applied");
        }
        None => {}
    }

    info!("agent running, waiting for SIGINT");
    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    warn!("received SIGINT, shutting down");
    agent.shutdown().await;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.pretty_logs {
        hostagent::init_logging_pretty(&args.log_level);
    } else {
        hostagent::init_logging(&args.log_level);
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = ?e, "startup failed");
            return ExitCode::FAILURE;
        }
    };
    info!(
        host_ip = ?config.host_ip,
        worker_threads = config.worker_threads,
        dry_run = config.dry_run,
        on_demand = config.enable_on_demand,
        "starting hostagentd"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config, args.goal_state)) {
        Ok(()) => {
            info!("hostagentd shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = ?e, "hostagentd failed");
            ExitCode::FAILURE
        }
    }
}
