//! Request-serving gateway for kdeps workflows.
//!
//! Routes HTTP and WebSocket traffic to workflow handlers or local app
//! processes, and swaps the served workflow in place on remote push or
//! local file change without dropping the listening socket.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;
pub mod storage;
pub mod workflow;

pub use config::schema::GatewayConfig;
pub use error::{AppError, AppErrorCode};
pub use http::{ApiServer, WebServer};
pub use lifecycle::Shutdown;
