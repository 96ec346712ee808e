//! Shared fixtures for the integration tests: a workflow on disk, a gateway
//! served over real TCP, and mock backends.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kdeps_gateway::config::GatewayConfig;
use kdeps_gateway::lifecycle::Shutdown;
use kdeps_gateway::net::{serve, Listener};
use kdeps_gateway::routing::Handler;
use kdeps_gateway::workflow::{EchoExecutor, WorkflowParser, YamlWorkflowParser};
use kdeps_gateway::ApiServer;
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub const TEST_TOKEN: &str = "integration-secret";

/// Workflow document serving `route` with the given version.
pub fn workflow_yaml(version: &str, route: &str) -> String {
    format!(
        r#"apiVersion: kdeps.io/v1
kind: Workflow
metadata:
  name: agent
  version: "{version}"
  targetActionId: respond
settings:
  apiServerMode: true
  apiServer:
    routes:
      - path: {route}
        methods: [GET, POST]
"#
    )
}

/// Workflow whose name and target action are both `name`, serving `route`.
pub fn named_workflow(name: &str, route: &str) -> String {
    format!(
        r#"apiVersion: kdeps.io/v1
kind: Workflow
metadata:
  name: {name}
  version: "1.0.0"
  targetActionId: {name}
settings:
  apiServerMode: true
  apiServer:
    routes:
      - path: {route}
        methods: [GET]
"#
    )
}

/// A served endpoint plus the handle that stops it.
pub struct Served {
    pub addr: SocketAddr,
    shutdown: Shutdown,
    task: JoinHandle<()>,
}

impl Served {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = self.task.await;
    }
}

/// Serve `handler` on an ephemeral loopback port.
pub async fn serve_handler(handler: Handler) -> Served {
    let listener = Listener::bind("127.0.0.1:0", 64).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let signal = shutdown.subscribe();
    let mut timeouts = kdeps_gateway::config::TimeoutConfig::default();
    timeouts.shutdown_grace_secs = 1;
    let task = tokio::spawn(async move {
        let _ = serve(listener, handler, timeouts, signal).await;
    });
    Served {
        addr,
        shutdown,
        task,
    }
}

/// An API server for a workflow written into a fresh temp directory.
pub struct Gateway {
    pub dir: TempDir,
    pub server: Arc<ApiServer>,
    pub served: Served,
}

impl Gateway {
    pub async fn start(yaml: &str) -> Self {
        Self::start_with(yaml, |_| {}).await
    }

    /// Start with `configure` applied to the default configuration.
    pub async fn start_with(yaml: &str, configure: impl FnOnce(&mut GatewayConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("workflow.yaml");
        std::fs::write(&path, yaml).unwrap();
        let workflow = YamlWorkflowParser::new().parse(&path).unwrap();

        let mut config = GatewayConfig::default();
        config.uploads.dir = dir.path().join("uploads");
        configure(&mut config);
        let server = ApiServer::builder(workflow, Arc::new(EchoExecutor), config)
            .workflow_path(&path)
            .build()
            .unwrap();
        let served = serve_handler(server.handler()).await;
        Self {
            dir,
            server,
            served,
        }
    }

    pub fn url(&self, path: &str) -> String {
        self.served.url(path)
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Gzip-compressed tarball holding `files` (relative path, contents).
pub fn package(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, Path::new(path), contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Axum backend on an ephemeral port: `/echo/*` reflects the request and
/// `/ws` echoes WebSocket text frames with an `echo: ` prefix.
pub async fn start_mock_app() -> SocketAddr {
    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::extract::Request;
    use axum::routing::{any, get};

    async fn reflect(req: Request) -> String {
        let custom = req
            .headers()
            .get("x-custom")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let forwarded = req.headers().contains_key("x-forwarded-for");
        let query = req.uri().query().unwrap_or("").to_string();
        format!(
            "{} {} query={} custom={} forwarded={}",
            req.method(),
            req.uri().path(),
            query,
            custom,
            forwarded
        )
    }

    async fn echo_socket(mut socket: WebSocket) {
        while let Some(Ok(message)) = socket.recv().await {
            match message {
                Message::Text(text) => {
                    let reply = format!("echo: {}", text.as_str());
                    if socket.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    }

    let app = axum::Router::new()
        .route("/echo/{*rest}", any(reflect))
        .route(
            "/ws",
            get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(echo_socket) }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// A loopback port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
