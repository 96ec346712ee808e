//! Workflow definitions and their collaborators.
//!
//! # Data Flow
//! ```text
//! workflow.yaml (+ resources/*.yaml)
//!     → parser.rs (YAML decode, fragment merge, validation)
//!     → model.rs (immutable Workflow snapshot, shared via Arc)
//!     → executor.rs (execute(workflow, request context) → JSON result)
//! ```

pub mod executor;
pub mod model;
pub mod parser;

pub use executor::{EchoExecutor, FileUpload, RequestContext, WorkflowExecutor};
pub use model::{Cors, Route, ServerType, WebRoute, WebServerConfig, Workflow};
pub use parser::{ParseError, WorkflowParser, YamlWorkflowParser};
