//! Web server for workflow-declared web routes.
//!
//! # Responsibilities
//! - Serve static trees under a route prefix
//! - Reverse-proxy HTTP and WebSocket traffic to local app processes
//! - Own the app processes spawned for `app` routes
//!
//! # Data Flow
//! ```text
//! Request → Router (`<prefix>/*`, every method)
//!     → static: strip prefix → ServeDir(<workflow dir>/<publicPath>)
//!     → app:    strip prefix → 127.0.0.1:<appPort> (HTTP or WebSocket)
//! ```
//!
//! # Design Decisions
//! - Proxies always target loopback, whatever host the server binds to
//! - An app command is spawned once per route path and lives until
//!   [`WebServer::stop`], independent of individual requests
//! - The router is built once; web routes do not hot-reload

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri, Version};
use axum::response::Response;
use dashmap::DashMap;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tower_http::services::ServeDir;

use crate::config::schema::{bind_host_from_env, GatewayConfig};
use crate::http::middleware::error_handler;
use crate::http::request::request_id_middleware;
use crate::http::websocket::{is_websocket_upgrade, proxy_websocket};
use crate::observability::metrics;
use crate::routing::router::plain_text;
use crate::routing::{handler_fn, Handler, Router};
use crate::workflow::{ServerType, WebRoute, Workflow};

pub const DEFAULT_WEB_HOST: &str = "127.0.0.1";
pub const DEFAULT_WEB_PORT: u16 = 8080;

/// Loopback host every app proxy targets.
const APP_HOST: &str = "127.0.0.1";

const WEB_ROUTE_METHODS: [Method; 7] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::OPTIONS,
];

/// Connection-scoped headers never forwarded to the app.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state of the route handlers.
struct WebContext {
    workflow_dir: PathBuf,
    client: Client<HttpConnector, Body>,
    response_header_timeout: Duration,
    handshake_timeout: Duration,
}

/// A spawned app command and the means to stop it.
struct AppProcess {
    pid: Option<u32>,
    stop: oneshot::Sender<()>,
    supervisor: JoinHandle<()>,
}

/// Gateway for the workflow's `webServer` section.
pub struct WebServer {
    workflow: Arc<Workflow>,
    context: Arc<WebContext>,
    router: Arc<Router>,
    processes: DashMap<String, AppProcess>,
}

impl WebServer {
    /// Build the server and spawn the app commands its routes declare.
    ///
    /// Relative public paths resolve against the directory of `workflow_path`.
    /// Must be called from within a Tokio runtime.
    pub fn new(workflow: Arc<Workflow>, workflow_path: &Path, config: &GatewayConfig) -> Arc<Self> {
        let context = Arc::new(WebContext {
            workflow_dir: workflow_dir(workflow_path),
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
            response_header_timeout: Duration::from_secs(config.timeouts.proxy_response_header_secs),
            handshake_timeout: Duration::from_secs(config.timeouts.websocket_handshake_secs),
        });

        let mut server = Self {
            workflow,
            context,
            router: Arc::new(Router::new()),
            processes: DashMap::new(),
        };
        let router = server.build_router(config.debug);
        server.router = Arc::new(router);
        Arc::new(server)
    }

    /// Bind address: `KDEPS_BIND_HOST` or the configured host, then the port.
    pub fn address(&self) -> String {
        let config = self.workflow.settings.web_server.clone().unwrap_or_default();
        let host = bind_host_from_env()
            .or_else(|| Some(config.host_ip).filter(|h| !h.is_empty()))
            .unwrap_or_else(|| DEFAULT_WEB_HOST.to_string());
        let port = if config.port_num == 0 {
            DEFAULT_WEB_PORT
        } else {
            config.port_num
        };
        format!("{}:{}", host, port)
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// A [`Handler`] serving through this server's router.
    pub fn handler(&self) -> Handler {
        let router = self.router();
        handler_fn(move |req| {
            let router = Arc::clone(&router);
            async move { router.serve(req).await }
        })
    }

    /// Number of app commands currently tracked.
    pub fn running_apps(&self) -> usize {
        self.processes.len()
    }

    fn build_router(&self, debug: bool) -> Router {
        let mut router = Router::new();
        router.use_middleware(request_id_middleware());
        router.use_middleware(error_handler(debug));

        let routes = self
            .workflow
            .settings
            .web_server
            .as_ref()
            .map(|config| config.routes.clone())
            .unwrap_or_default();

        for route in routes {
            if route.server_type == ServerType::App && !route.command.is_empty() {
                self.spawn_app(&route);
            }

            let pattern = format!("{}/*", route.path.trim_end_matches('/'));
            let route = Arc::new(route);
            for method in WEB_ROUTE_METHODS {
                let route = Arc::clone(&route);
                let context = Arc::clone(&self.context);
                router.register(
                    method,
                    pattern.clone(),
                    handler_fn(move |req| {
                        let route = Arc::clone(&route);
                        let context = Arc::clone(&context);
                        async move { context.handle(&route, req).await }
                    }),
                );
            }
            tracing::info!(path = %route.path, server_type = ?route.server_type, "Web server route configured");
        }
        router
    }

    /// Start the route's app command unless one is already tracked.
    fn spawn_app(&self, route: &WebRoute) {
        let entry = match self.processes.entry(route.path.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return,
            dashmap::mapref::entry::Entry::Vacant(entry) => entry,
        };

        let work_dir = self.context.public_root(route);
        tracing::info!(command = %route.command, work_dir = %work_dir.display(), "Starting app command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&route.command)
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(command = %route.command, error = %e, "Failed to start app command");
                return;
            }
        };

        let pid = child.id();
        tracing::info!(command = %route.command, pid = ?pid, "App command started");
        let (stop, stopped) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(route.command.clone(), child, stopped));
        entry.insert(AppProcess {
            pid,
            stop,
            supervisor,
        });
    }

    /// Kill every app command and empty the process table.
    pub async fn stop(&self) {
        tracing::info!("Stopping web server and cleaning up commands");
        let paths: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            let Some((_, process)) = self.processes.remove(&path) else {
                continue;
            };
            tracing::info!(path = %path, pid = ?process.pid, "Stopping command");
            let _ = process.stop.send(());
            if let Err(e) = process.supervisor.await {
                tracing::error!(path = %path, error = %e, "App supervisor failed");
            }
        }
    }
}

/// Wait for the child to exit, or kill it when asked to stop.
async fn supervise(command: String, mut child: Child, stopped: oneshot::Receiver<()>) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => {
                tracing::info!(command = %command, "App command exited");
            }
            Ok(status) => {
                tracing::error!(command = %command, status = %status, "App command exited with error");
            }
            Err(e) => {
                tracing::error!(command = %command, error = %e, "Failed to wait for app command");
            }
        },
        _ = stopped => {
            if let Err(e) = child.kill().await {
                tracing::error!(command = %command, error = %e, "Failed to stop app command");
            }
        }
    }
}

impl WebContext {
    async fn handle(&self, route: &WebRoute, req: Request<Body>) -> Response {
        match route.server_type {
            ServerType::Static => self.serve_static(route, req).await,
            ServerType::App => self.proxy_app(route, req).await,
            ServerType::Unsupported => {
                tracing::error!(path = %route.path, "Unsupported server type");
                plain_text(StatusCode::INTERNAL_SERVER_ERROR, "Unsupported server type")
            }
        }
    }

    fn public_root(&self, route: &WebRoute) -> PathBuf {
        let public = Path::new(&route.public_path);
        if public.is_absolute() {
            public.to_path_buf()
        } else {
            self.workflow_dir.join(public)
        }
    }

    async fn serve_static(&self, route: &WebRoute, mut req: Request<Body>) -> Response {
        let root = self.public_root(route);
        if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
            tracing::error!(path = %root.display(), "Public path does not exist");
            return plain_text(StatusCode::NOT_FOUND, "Not Found");
        }

        let uri = match with_path(req.uri(), &strip_route_prefix(&route.path, req.uri().path())) {
            Some(uri) => uri,
            None => return plain_text(StatusCode::BAD_REQUEST, "Bad Request"),
        };
        *req.uri_mut() = uri;

        match ServeDir::new(root).oneshot(req).await {
            Ok(response) => response.map(Body::new),
            Err(never) => match never {},
        }
    }

    async fn proxy_app(&self, route: &WebRoute, req: Request<Body>) -> Response {
        if route.app_port == 0 {
            tracing::error!(path = %route.path, "App port is required for app server type");
            return plain_text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }

        let path = strip_route_prefix(&route.path, req.uri().path());
        let path_and_query = match req.uri().query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };

        if is_websocket_upgrade(req.headers()) {
            let target = format!("ws://{}:{}{}", APP_HOST, route.app_port, path_and_query);
            return proxy_websocket(req, target, self.handshake_timeout).await;
        }

        let target = format!("http://{}:{}{}", APP_HOST, route.app_port, path_and_query);
        let uri = match target.parse::<Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!(url = %target, error = %e, "Invalid proxy URL");
                return plain_text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
        };
        tracing::debug!(url = %uri, "Proxying request");

        let remote = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip().to_string())
            .unwrap_or_default();
        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(header::HOST);
        append_forwarded_for(&mut parts.headers, &remote);
        parts.uri = uri;
        parts.version = Version::HTTP_11;
        let outbound = Request::from_parts(parts, body);

        match tokio::time::timeout(self.response_header_timeout, self.client.request(outbound)).await {
            Ok(Ok(response)) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, Body::new(body))
            }
            Ok(Err(e)) => {
                metrics::record_proxy_error("http");
                tracing::error!(url = %target, error = %e, "Proxy request failed");
                plain_text(StatusCode::BAD_GATEWAY, "Failed to reach app")
            }
            Err(_) => {
                metrics::record_proxy_error("http");
                tracing::error!(url = %target, timeout = ?self.response_header_timeout, "Proxy request timed out");
                plain_text(StatusCode::BAD_GATEWAY, "Failed to reach app")
            }
        }
    }
}

/// Directory holding the workflow file; `.` for bare file names.
pub fn workflow_dir(workflow_path: &Path) -> PathBuf {
    match workflow_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Remove the route prefix from `path`, keeping the result rooted.
pub fn strip_route_prefix(route_path: &str, path: &str) -> String {
    let trimmed = path.strip_prefix(route_path).unwrap_or(path);
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn with_path(uri: &Uri, path: &str) -> Option<Uri> {
    let path_and_query = match uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };
    path_and_query.parse().ok()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client: &str) {
    if client.is_empty() {
        return;
    }
    let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, client),
        None => client.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}
