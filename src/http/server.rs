//! Workflow API server.
//!
//! # Responsibilities
//! - Hold the current Workflow + Router pair and swap it atomically
//! - Translate requests into executor calls and shape the results
//! - Reload the workflow from disk (file watcher or management API)
//! - Wire the fixed middleware pipeline into every router it builds
//!
//! # Design Decisions
//! - The Workflow and its Router live in one immutable [`Snapshot`] behind
//!   `ArcSwap`; a request loads it once, so it never sees a new Router paired
//!   with an old Workflow
//! - Reloads are serialized by an async mutex; readers never wait on it
//! - A failed reload leaves the previous snapshot in place
//! - Route handlers hold a `Weak` back-reference, so routers never keep the
//!   server alive

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::schema::{bind_host_from_env, GatewayConfig};
use crate::config::watcher::{FileWatcher, WatchCallback, WatchError};
use crate::error::{AppError, AppErrorCode};
use crate::http::management;
use crate::http::middleware::{
    cors_middleware, debug_mode_of, error_handler, session_middleware, upload_limit_middleware,
};
use crate::http::request::{content_type, is_multipart, parse_request, request_id_middleware};
use crate::http::response::{
    execute_error_to_app, respond_with_error, respond_with_result, ResponseContext,
};
use crate::http::upload::{MultipartForm, UploadHandler};
use crate::observability::metrics;
use crate::routing::{handler_fn, Handler, Router};
use crate::storage::{FileStore, StoreError, TemporaryFileStore};
use crate::workflow::{ParseError, Workflow, WorkflowExecutor, WorkflowParser, YamlWorkflowParser};

/// Workflow file used when no path was configured.
pub const DEFAULT_WORKFLOW_FILE: &str = "workflow.yaml";

/// Container layout: the workflow lives under `/app` when that directory exists.
const CONTAINER_APP_DIR: &str = "/app";

pub const DEFAULT_API_HOST: &str = "0.0.0.0";
pub const DEFAULT_API_PORT: u16 = 16395;

/// Error type for building the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to create file store: {0}")]
    Store(#[from] StoreError),
}

/// Error type for workflow reloads.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("failed to resolve workflow path: {0}")]
    Path(#[source] io::Error),
    #[error("failed to parse workflow: {0}")]
    Parse(#[from] ParseError),
    #[error("workflow parse task failed: {0}")]
    Task(String),
    #[error("no file watcher configured")]
    NoWatcher,
    #[error("failed to watch workflow file: {0}")]
    Watch(#[source] WatchError),
}

/// A workflow and the router derived from it.
pub struct Snapshot {
    pub workflow: Arc<Workflow>,
    pub router: Arc<Router>,
}

/// Workflow snapshot a request was routed with, stored in its extensions.
#[derive(Clone)]
pub struct CurrentWorkflow(pub Arc<Workflow>);

/// Serves workflow routes, `/health` and the management API.
pub struct ApiServer {
    me: Weak<ApiServer>,
    snapshot: ArcSwap<Snapshot>,
    /// Last-known workflow path; `None` until configured or first reload.
    workflow_path: RwLock<Option<PathBuf>>,
    reload_lock: Mutex<()>,
    parser: Arc<dyn WorkflowParser>,
    executor: Arc<dyn WorkflowExecutor>,
    watcher: Option<Arc<dyn FileWatcher>>,
    store: Arc<dyn FileStore>,
    uploads: UploadHandler,
    config: GatewayConfig,
}

/// Builder for [`ApiServer`].
pub struct ApiServerBuilder {
    workflow: Workflow,
    executor: Arc<dyn WorkflowExecutor>,
    config: GatewayConfig,
    workflow_path: Option<PathBuf>,
    parser: Option<Arc<dyn WorkflowParser>>,
    watcher: Option<Arc<dyn FileWatcher>>,
    store: Option<Arc<dyn FileStore>>,
}

impl ApiServerBuilder {
    pub fn workflow_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.workflow_path = Some(path.into());
        self
    }

    pub fn parser(mut self, parser: Arc<dyn WorkflowParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn watcher(mut self, watcher: Arc<dyn FileWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn file_store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the server and its initial router.
    ///
    /// Without an explicit store, a [`TemporaryFileStore`] is created under
    /// `uploads.dir` with its cleanup sweep running; this needs a Tokio runtime.
    pub fn build(self) -> Result<Arc<ApiServer>, ServerError> {
        let store: Arc<dyn FileStore> = match self.store {
            Some(store) => store,
            None => {
                let store = TemporaryFileStore::new(&self.config.uploads.dir)?;
                store.spawn_cleanup(
                    Duration::from_secs(self.config.uploads.cleanup_interval_secs),
                    Duration::from_secs(self.config.uploads.ttl_secs),
                );
                store as Arc<dyn FileStore>
            }
        };
        let uploads = UploadHandler::new(Arc::clone(&store), self.config.uploads.max_file_size);
        let parser = self
            .parser
            .unwrap_or_else(|| Arc::new(YamlWorkflowParser::new()));
        let workflow = Arc::new(self.workflow);

        Ok(Arc::new_cyclic(|me: &Weak<ApiServer>| {
            let router = build_router(me, &workflow, &self.config);
            ApiServer {
                me: me.clone(),
                snapshot: ArcSwap::from_pointee(Snapshot {
                    workflow,
                    router: Arc::new(router),
                }),
                workflow_path: RwLock::new(self.workflow_path),
                reload_lock: Mutex::new(()),
                parser,
                executor: self.executor,
                watcher: self.watcher,
                store,
                uploads,
                config: self.config,
            }
        }))
    }
}

impl ApiServer {
    pub fn builder(
        workflow: Workflow,
        executor: Arc<dyn WorkflowExecutor>,
        config: GatewayConfig,
    ) -> ApiServerBuilder {
        ApiServerBuilder {
            workflow,
            executor,
            config,
            workflow_path: None,
            parser: None,
            watcher: None,
            store: None,
        }
    }

    /// Current workflow.
    pub fn workflow(&self) -> Arc<Workflow> {
        Arc::clone(&self.snapshot.load().workflow)
    }

    /// Current workflow and router.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn file_store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    pub fn watcher(&self) -> Option<&Arc<dyn FileWatcher>> {
        self.watcher.as_ref()
    }

    /// Set the workflow path used by reloads and management pushes.
    pub fn set_workflow_path(&self, path: impl Into<PathBuf>) {
        *self.workflow_path.write().unwrap_or_else(|e| e.into_inner()) = Some(path.into());
    }

    /// Set the workflow path only if none is known yet.
    pub(crate) fn set_workflow_path_if_unset(&self, path: &Path) {
        let mut guard = self.workflow_path.write().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(path.to_path_buf());
        }
    }

    /// Last-known path, else `/app/workflow.yaml` inside a container, else
    /// `workflow.yaml`.
    pub fn resolved_workflow_path(&self) -> PathBuf {
        self.workflow_path
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(default_workflow_path)
    }

    /// Serve one request against the current snapshot.
    pub async fn serve(&self, mut req: Request<Body>) -> Response {
        let snapshot = self.snapshot.load_full();
        req.extensions_mut()
            .insert(CurrentWorkflow(Arc::clone(&snapshot.workflow)));
        snapshot.router.serve(req).await
    }

    /// A [`Handler`] serving through this server.
    pub fn handler(self: &Arc<Self>) -> Handler {
        let server = Arc::clone(self);
        handler_fn(move |req: Request<Body>| {
            let server = Arc::clone(&server);
            async move { server.serve(req).await }
        })
    }

    /// Execute the workflow for one API request.
    pub async fn handle_request(&self, req: Request<Body>) -> Response {
        let debug = debug_mode_of(req.extensions());
        let workflow = req
            .extensions()
            .get::<CurrentWorkflow>()
            .map(|current| Arc::clone(&current.0))
            .unwrap_or_else(|| self.workflow());
        let (parts, body) = req.into_parts();
        let mut ctx = ResponseContext::from_parts(&parts);
        let multipart = is_multipart(&parts.headers);

        let max_memory = self.config.uploads.max_memory;
        let bytes = match read_body(body, max_memory).await {
            Ok(bytes) => bytes,
            Err(BodyError::TooLarge) if multipart => {
                let err = AppError::new(
                    AppErrorCode::BadRequest,
                    format!(
                        "File upload failed: request body exceeds {} bytes",
                        max_memory
                    ),
                );
                return respond_with_error(&err, &ctx, debug);
            }
            Err(BodyError::TooLarge) => {
                let err = AppError::new(
                    AppErrorCode::RequestTooLarge,
                    format!("Request body too large (max: {} bytes)", max_memory),
                );
                return respond_with_error(&err, &ctx, debug);
            }
            Err(BodyError::Read(e)) => {
                let err = AppError::new(
                    AppErrorCode::BadRequest,
                    format!("failed to read request body: {}", e),
                );
                return respond_with_error(&err, &ctx, debug);
            }
        };

        let (form, raw_body) = if multipart {
            match self
                .uploads
                .handle_multipart(content_type(&parts.headers), bytes)
                .await
            {
                Ok(form) => (form, Bytes::new()),
                Err(e) => {
                    let err = AppError::new(
                        AppErrorCode::BadRequest,
                        format!("File upload failed: {}", e),
                    );
                    return respond_with_error(&err, &ctx, debug);
                }
            }
        } else {
            (MultipartForm::default(), bytes)
        };

        let MultipartForm { files, fields } = form;
        let mut request = parse_request(&parts, &raw_body, fields, &files);
        if let Some(session_id) = ctx.session_id.clone() {
            request.session_id = Some(session_id);
        }

        let result = self.executor.execute(&workflow, &mut request).await;

        if let Some(session_id) = request.session_id.filter(|s| !s.is_empty()) {
            ctx.session_id = Some(session_id);
        }
        self.uploads.discard(&files);

        match result {
            Ok(value) => respond_with_result(value, &ctx, debug),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    path = %ctx.path,
                    method = %ctx.method,
                    "Workflow execution failed"
                );
                respond_with_error(&execute_error_to_app(e, debug), &ctx, debug)
            }
        }
    }

    /// `GET /health`.
    pub fn health(&self) -> Response {
        let workflow = self.workflow();
        Json(json!({
            "status": "ok",
            "workflow": {
                "name": workflow.metadata.name,
                "version": workflow.metadata.version,
            },
        }))
        .into_response()
    }

    /// Re-parse the workflow from disk and install a fresh router.
    ///
    /// Concurrent calls run one at a time. On failure nothing changes.
    pub async fn reload_workflow(&self) -> Result<(), ReloadError> {
        let _guard = self.reload_lock.lock().await;

        let path = absolutize(&self.resolved_workflow_path()).map_err(|e| {
            metrics::record_reload(false);
            ReloadError::Path(e)
        })?;

        let parser = Arc::clone(&self.parser);
        let parse_path = path.clone();
        let parsed = tokio::task::spawn_blocking(move || parser.parse(&parse_path)).await;
        let workflow = match parsed {
            Ok(Ok(workflow)) => Arc::new(workflow),
            Ok(Err(e)) => {
                metrics::record_reload(false);
                return Err(ReloadError::Parse(e));
            }
            Err(e) => {
                metrics::record_reload(false);
                return Err(ReloadError::Task(e.to_string()));
            }
        };

        self.set_workflow_path(path);
        let router = build_router(&self.me, &workflow, &self.config);
        self.snapshot.store(Arc::new(Snapshot {
            workflow: Arc::clone(&workflow),
            router: Arc::new(router),
        }));
        metrics::record_reload(true);

        tracing::info!(
            name = %workflow.metadata.name,
            version = %workflow.metadata.version,
            resources = workflow.resources.len(),
            "Workflow reloaded"
        );
        Ok(())
    }

    /// Reload whenever the workflow file or its `resources/` directory changes.
    pub fn setup_hot_reload(&self) -> Result<(), ReloadError> {
        let watcher = self.watcher.as_ref().ok_or(ReloadError::NoWatcher)?;

        let resolved = self.resolved_workflow_path();
        let workflow_path = absolutize(&resolved).unwrap_or_else(|e| {
            tracing::warn!(
                path = %resolved.display(),
                error = %e,
                "Failed to resolve absolute workflow path, using relative"
            );
            resolved.clone()
        });

        watcher
            .watch(&workflow_path, self.reload_callback("Workflow file changed, reloading"))
            .map_err(ReloadError::Watch)?;

        let resources = workflow_path
            .parent()
            .map(|dir| dir.join("resources"))
            .unwrap_or_else(|| PathBuf::from("resources"));
        if let Err(e) = watcher.watch(&resources, self.reload_callback("Resources changed, reloading")) {
            tracing::debug!(
                path = %resources.display(),
                error = %e,
                "Not watching resources directory"
            );
        }
        Ok(())
    }

    fn reload_callback(&self, message: &'static str) -> WatchCallback {
        let me = self.me.clone();
        Arc::new(move || {
            let me = me.clone();
            Box::pin(async move {
                let Some(server) = me.upgrade() else { return };
                tracing::info!("{}", message);
                match server.reload_workflow().await {
                    Ok(()) => tracing::info!("Workflow reloaded successfully"),
                    Err(e) => tracing::error!(error = %e, "Failed to reload workflow"),
                }
            })
        })
    }

    /// Close the watcher and the upload store.
    pub fn close(&self) {
        if let Some(watcher) = &self.watcher {
            if let Err(e) = watcher.close() {
                tracing::warn!(error = %e, "Failed to close file watcher");
            }
        }
        if let Err(e) = self.store.close() {
            tracing::warn!(error = %e, "Failed to close file store");
        }
    }
}

/// API listen address: `listener.bind_address`, else `KDEPS_BIND_HOST` or
/// the workflow's `apiServer.hostIp`, with `apiServer.portNum`.
pub fn api_bind_address(workflow: &Workflow, config: &GatewayConfig) -> String {
    if let Some(addr) = &config.listener.bind_address {
        return addr.clone();
    }
    let api = workflow.settings.api_server.clone().unwrap_or_default();
    let host = bind_host_from_env()
        .or_else(|| Some(api.host_ip).filter(|h| !h.is_empty()))
        .unwrap_or_else(|| DEFAULT_API_HOST.to_string());
    let port = if api.port_num == 0 {
        DEFAULT_API_PORT
    } else {
        api.port_num
    };
    format!("{}:{}", host, port)
}

/// `/app/workflow.yaml` when `/app` exists, else `workflow.yaml`.
pub fn default_workflow_path() -> PathBuf {
    if Path::new(CONTAINER_APP_DIR).is_dir() {
        Path::new(CONTAINER_APP_DIR).join(DEFAULT_WORKFLOW_FILE)
    } else {
        PathBuf::from(DEFAULT_WORKFLOW_FILE)
    }
}

fn absolutize(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

enum BodyError {
    TooLarge,
    Read(String),
}

async fn read_body(body: Body, limit: u64) -> Result<Bytes, BodyError> {
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(BodyError::TooLarge),
        Err(e) => Err(BodyError::Read(e.to_string())),
    }
}

/// Wrap a server method as a route handler.
pub(crate) fn server_handler<F, Fut>(server: &Weak<ApiServer>, f: F) -> Handler
where
    F: Fn(Arc<ApiServer>, Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Response> + Send + 'static,
{
    let server = server.clone();
    let f = Arc::new(f);
    handler_fn(move |req: Request<Body>| {
        let server = server.upgrade();
        let f = Arc::clone(&f);
        async move {
            match server {
                Some(server) => f(server, req).await,
                None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
            }
        }
    })
}

/// Router for `workflow`: middleware, `/health`, management and workflow routes.
fn build_router(server: &Weak<ApiServer>, workflow: &Workflow, config: &GatewayConfig) -> Router {
    let mut router = Router::new();
    router.use_middleware(request_id_middleware());
    router.use_middleware(error_handler(config.debug));
    router.use_middleware(session_middleware());
    router.use_middleware(upload_limit_middleware(config.uploads.max_file_size));

    router.get(
        "/health",
        server_handler(server, |server, _req| async move { server.health() }),
    );
    management::register(&mut router, server);

    let handle = server_handler(server, |server, req| async move {
        server.handle_request(req).await
    });
    for route in workflow.settings.routes() {
        for method in route.effective_methods() {
            let method = match method.as_str() {
                "GET" => Method::GET,
                "POST" => Method::POST,
                "PUT" => Method::PUT,
                "DELETE" => Method::DELETE,
                "PATCH" => Method::PATCH,
                other => {
                    tracing::warn!(path = %route.path, method = %other, "Skipping unsupported route method");
                    continue;
                }
            };
            router.register(method, route.path.clone(), Arc::clone(&handle));
        }
    }

    router.use_middleware(cors_middleware(workflow.settings.cors_config()));
    router
}

/// `{"status": "error", "message": ...}` with `status`.
pub(crate) fn status_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({"status": "error", "message": message.into()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecuteError;
    use axum::http::header;
    use crate::workflow::{EchoExecutor, RequestContext};
    use futures_util::future::BoxFuture;
    use serde_json::Value;
    use std::fs;
    use tempfile::TempDir;

    const WORKFLOW_V1: &str = r#"
apiVersion: kdeps.io/v1
kind: Workflow
metadata:
  name: chat
  version: "1.0.0"
  targetActionId: reply
settings:
  apiServerMode: true
  apiServer:
    hostIp: 127.0.0.1
    portNum: 3000
    routes:
      - path: /api/chat
        methods: [POST]
"#;

    fn config(dir: &TempDir) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.uploads.dir = dir.path().join("uploads");
        config
    }

    fn server_at(dir: &TempDir, executor: Arc<dyn WorkflowExecutor>) -> Arc<ApiServer> {
        let path = dir.path().join("workflow.yaml");
        fs::write(&path, WORKFLOW_V1).unwrap();
        let workflow = YamlWorkflowParser::new().parse(&path).unwrap();
        ApiServer::builder(workflow, executor, config(dir))
            .workflow_path(path)
            .build()
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(path: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    struct SessionExecutor;

    impl WorkflowExecutor for SessionExecutor {
        fn execute<'a>(
            &'a self,
            _workflow: &'a Workflow,
            request: &'a mut RequestContext,
        ) -> BoxFuture<'a, Result<Value, ExecuteError>> {
            Box::pin(async move {
                request.session_id = Some("new-session".into());
                Ok(json!({"success": true, "data": {"ok": true}}))
            })
        }
    }

    struct FailingExecutor;

    impl WorkflowExecutor for FailingExecutor {
        fn execute<'a>(
            &'a self,
            _workflow: &'a Workflow,
            _request: &'a mut RequestContext,
        ) -> BoxFuture<'a, Result<Value, ExecuteError>> {
            Box::pin(async move {
                Err(Box::new(
                    AppError::new(AppErrorCode::Validation, "message is required")
                        .with_resource("reply"),
                ) as ExecuteError)
            })
        }
    }

    #[tokio::test]
    async fn routes_requests_to_executor() {
        let dir = TempDir::new().unwrap();
        let server = server_at(&dir, Arc::new(EchoExecutor));

        let response = server.serve(post_json("/api/chat", r#"{"message":"hi"}"#)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["actionId"], "reply");
        assert_eq!(body["data"]["request"]["body"]["message"], "hi");

        let response = server
            .serve(Request::builder().uri("/api/chat").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "POST");
    }

    #[tokio::test]
    async fn health_reports_workflow() {
        let dir = TempDir::new().unwrap();
        let server = server_at(&dir, Arc::new(EchoExecutor));
        let response = server
            .serve(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["workflow"]["name"], "chat");
        assert_eq!(body["workflow"]["version"], "1.0.0");
    }

    #[tokio::test]
    async fn executor_session_sets_cookie() {
        let dir = TempDir::new().unwrap();
        let server = server_at(&dir, Arc::new(SessionExecutor));
        let response = server.serve(post_json("/api/chat", "{}")).await;
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with("kdeps_session_id=new-session;"));
    }

    #[tokio::test]
    async fn executor_errors_use_their_code() {
        let dir = TempDir::new().unwrap();
        let server = server_at(&dir, Arc::new(FailingExecutor));
        let response = server.serve(post_json("/api/chat", "{}")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["resourceId"], "reply");
        assert_eq!(body["meta"]["path"], "/api/chat");
    }

    #[tokio::test]
    async fn reload_swaps_workflow_and_routes() {
        let dir = TempDir::new().unwrap();
        let server = server_at(&dir, Arc::new(EchoExecutor));

        let v2 = WORKFLOW_V1
            .replace("name: chat", "name: chat-v2")
            .replace("/api/chat", "/api/v2/chat");
        fs::write(dir.path().join("workflow.yaml"), v2).unwrap();
        server.reload_workflow().await.unwrap();

        assert_eq!(server.workflow().metadata.name, "chat-v2");
        let response = server.serve(post_json("/api/chat", "{}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = server.serve(post_json("/api/v2/chat", "{}")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let server = server_at(&dir, Arc::new(EchoExecutor));

        fs::write(dir.path().join("workflow.yaml"), "metadata: [not, a, map").unwrap();
        let err = server.reload_workflow().await.unwrap_err();
        assert!(err.to_string().starts_with("failed to parse workflow"));

        assert_eq!(server.workflow().metadata.name, "chat");
        let response = server.serve(post_json("/api/chat", "{}")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn failed_reload_leaves_stored_path_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("workflow.yaml");
        fs::write(&path, WORKFLOW_V1).unwrap();
        let workflow = YamlWorkflowParser::new().parse(&path).unwrap();
        let server = ApiServer::builder(workflow, Arc::new(EchoExecutor), config(&dir))
            .build()
            .unwrap();

        server.set_workflow_path(dir.path().join("missing.yaml"));
        assert!(server.reload_workflow().await.is_err());
        assert_eq!(server.resolved_workflow_path(), dir.path().join("missing.yaml"));

        server.set_workflow_path(&path);
        server.reload_workflow().await.unwrap();
        assert_eq!(server.resolved_workflow_path(), path);
    }

    #[tokio::test]
    async fn relative_path_is_stored_only_after_a_successful_reload() {
        let dir = TempDir::new().unwrap();
        let server = server_at(&dir, Arc::new(EchoExecutor));
        server.set_workflow_path("definitely-missing-workflow.yaml");

        assert!(server.reload_workflow().await.is_err());
        assert_eq!(
            server.resolved_workflow_path(),
            PathBuf::from("definitely-missing-workflow.yaml")
        );
        assert_eq!(server.workflow().metadata.name, "chat");
    }

    #[tokio::test]
    async fn hot_reload_requires_watcher() {
        let dir = TempDir::new().unwrap();
        let server = server_at(&dir, Arc::new(EchoExecutor));
        let err = server.setup_hot_reload().unwrap_err();
        assert_eq!(err.to_string(), "no file watcher configured");
    }

    #[tokio::test]
    async fn multipart_uploads_reach_executor_and_are_removed() {
        let dir = TempDir::new().unwrap();
        let server = server_at(&dir, Arc::new(EchoExecutor));
        let body = "--B\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            hello\r\n\
            --B\r\n\
            Content-Disposition: form-data; name=\"topic\"\r\n\r\n\
            greetings\r\n\
            --B--\r\n";
        let req = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header("content-type", "multipart/form-data; boundary=B")
            .body(Body::from(body))
            .unwrap();

        let response = server.serve(req).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let request = &body["data"]["request"];
        assert_eq!(request["body"]["topic"], "greetings");
        assert_eq!(request["files"][0]["name"], "notes.txt");
        assert_eq!(request["files"][0]["mimeType"], "text/plain");

        let stored = PathBuf::from(request["files"][0]["path"].as_str().unwrap());
        assert!(!stored.exists());
    }

    #[tokio::test]
    async fn broken_multipart_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let server = server_at(&dir, Arc::new(EchoExecutor));
        let req = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header("content-type", "multipart/form-data")
            .body(Body::from("junk"))
            .unwrap();
        let response = server.serve(req).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("File upload failed: "));
    }

    #[test]
    fn default_path_is_relative_outside_containers() {
        if !Path::new(CONTAINER_APP_DIR).is_dir() {
            assert_eq!(default_workflow_path(), PathBuf::from("workflow.yaml"));
        }
    }

    #[test]
    fn listener_bind_address_wins() {
        let mut config = GatewayConfig::default();
        config.listener.bind_address = Some("127.0.0.1:9999".into());
        assert_eq!(api_bind_address(&Workflow::default(), &config), "127.0.0.1:9999");

        config.listener.bind_address = None;
        assert!(api_bind_address(&Workflow::default(), &config).ends_with(":16395"));
    }
}
