//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! gateway.toml (optional)
//!     → loader.rs (parse & deserialize, env overrides)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared by value with the servers at startup
//!
//! Workflow hot reload (dev mode):
//!     watcher.rs detects change to workflow.yaml or resources/
//!     → registered callback
//!     → ApiServer::reload_workflow
//! ```
//!
//! # Design Decisions
//! - Process config is immutable once loaded; only the workflow reloads
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, load_or_default, ConfigError};
pub use schema::{
    GatewayConfig, ListenerConfig, ManagementConfig, ObservabilityConfig, TimeoutConfig,
    UploadConfig,
};
pub use watcher::{FileWatcher, NotifyFileWatcher, WatchCallback, WatchError};
