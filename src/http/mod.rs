//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Connection (net::serve)
//!     → server.rs (current Snapshot: Workflow + Router)
//!     → middleware/ (request ID, recovery, session, upload gate, CORS)
//!     → server.rs handle_request
//!         → upload.rs (multipart → FileStore)
//!         → request.rs (RequestContext)
//!         → WorkflowExecutor
//!         → response.rs (success/error envelope, session cookie)
//!     → management.rs (/_kdeps/*: push, extract via archive.rs, reload)
//!
//! webserver.rs (separate listener)
//!     → static files | reverse proxy | websocket.rs
//! ```

pub mod archive;
pub mod management;
pub mod middleware;
pub mod request;
pub mod response;
pub mod server;
pub mod upload;
pub mod webserver;
pub mod websocket;

pub use request::{RequestId, RequestIdExt, X_REQUEST_ID};
pub use server::{ApiServer, ApiServerBuilder, CurrentWorkflow, ReloadError, ServerError, Snapshot};
pub use webserver::WebServer;
