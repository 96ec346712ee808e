//! kdeps workflow gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────────┐
//!                 │                        GATEWAY                           │
//!   Client ──────▶│ net::serve ─▶ ApiServer (Snapshot: Workflow + Router)    │
//!                 │                 │ middleware ─▶ workflow route ─▶ Executor│
//!                 │                 │            └▶ /_kdeps management       │
//!                 │                 ▼                                        │
//!                 │           reload_workflow ◀── FileWatcher (--dev)        │
//!                 │                                                          │
//!   Client ──────▶│ net::serve ─▶ WebServer ─▶ static files                  │
//!                 │                         └▶ 127.0.0.1:<appPort> (HTTP/WS) │
//!                 └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use kdeps_gateway::config::{load_or_default, FileWatcher, NotifyFileWatcher};
use kdeps_gateway::http::server::{api_bind_address, default_workflow_path};
use kdeps_gateway::http::{ApiServer, WebServer};
use kdeps_gateway::lifecycle::{spawn_signal_handler, Shutdown};
use kdeps_gateway::net::{serve, Listener};
use kdeps_gateway::observability::{logging, metrics};
use kdeps_gateway::workflow::{EchoExecutor, WorkflowParser, YamlWorkflowParser};

#[derive(Debug, Parser)]
#[command(name = "kdeps-gateway", version, about = "Serve a kdeps workflow over HTTP")]
struct Cli {
    /// Workflow file (default: /app/workflow.yaml in containers, else ./workflow.yaml)
    #[arg(long, env = "KDEPS_WORKFLOW")]
    workflow: Option<PathBuf>,

    /// Gateway configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Reload the workflow when its files change
    #[arg(long)]
    dev: bool,

    /// Also start the web server when the workflow declares one
    #[arg(long)]
    web: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = load_or_default(cli.config.as_deref())?;
    if cli.dev {
        config.dev_mode = true;
    }

    if let Err(e) = logging::init_logging(&config.observability, config.debug) {
        eprintln!("failed to initialize logging: {}", e);
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "kdeps-gateway starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let workflow_path = cli.workflow.unwrap_or_else(default_workflow_path);
    let workflow = YamlWorkflowParser::new().parse(&workflow_path)?;
    tracing::info!(
        path = %workflow_path.display(),
        name = %workflow.metadata.name,
        version = %workflow.metadata.version,
        "Workflow loaded"
    );

    let mut builder = ApiServer::builder(workflow.clone(), Arc::new(EchoExecutor), config.clone())
        .workflow_path(&workflow_path);
    if config.dev_mode {
        match NotifyFileWatcher::new() {
            Ok(watcher) => builder = builder.watcher(Arc::new(watcher) as Arc<dyn FileWatcher>),
            Err(e) => tracing::warn!(error = %e, "File watcher unavailable, hot reload disabled"),
        }
    }
    let server = builder.build()?;
    if config.dev_mode && server.watcher().is_some() {
        match server.setup_hot_reload() {
            Ok(()) => tracing::info!("Hot reload enabled"),
            Err(e) => tracing::warn!(error = %e, "Failed to set up hot reload"),
        }
    }

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let addr = api_bind_address(&workflow, &config);
    let listener = Listener::bind(&addr, config.listener.max_connections).await?;
    let api_task = tokio::spawn(serve(
        listener,
        server.handler(),
        config.timeouts.clone(),
        shutdown.subscribe(),
    ));

    let wants_web = cli.web || workflow.settings.web_server_mode;
    let web = if wants_web && workflow.settings.web_server.is_some() {
        let web = WebServer::new(Arc::new(workflow), &workflow_path, &config);
        let listener = Listener::bind(&web.address(), config.listener.max_connections).await?;
        let task = tokio::spawn(serve(
            listener,
            web.handler(),
            config.timeouts.clone(),
            shutdown.subscribe(),
        ));
        Some((web, task))
    } else {
        None
    };

    match api_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "API server failed"),
        Err(e) => tracing::error!(error = %e, "API server task failed"),
    }
    shutdown.trigger();

    if let Some((web, task)) = web {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Web server task failed");
        }
        web.stop().await;
    }
    server.close();

    tracing::info!("Shutdown complete");
    Ok(())
}
