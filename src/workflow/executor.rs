//! Workflow execution capability and the request view handed to it.

use std::collections::BTreeMap;
use std::path::PathBuf;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::ExecuteError;
use crate::workflow::model::Workflow;

/// Descriptor of an uploaded file as seen by the executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpload {
    pub name: String,
    pub path: PathBuf,
    pub mime_type: String,
    pub size: u64,
}

/// Normalized view of one inbound request.
///
/// Built once per request by the API server. The executor may set
/// `session_id` to have the session cookie issued on the response.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    /// First value per header, keyed by canonical (Title-Case) name.
    pub headers: BTreeMap<String, String>,
    /// First value per query parameter.
    pub query: BTreeMap<String, String>,
    pub body: Map<String, Value>,
    pub files: Vec<FileUpload>,
    pub ip: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Runs a workflow against a request.
pub trait WorkflowExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        workflow: &'a Workflow,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<Value, ExecuteError>>;
}

/// Executor used when no engine is linked: reports the target action and
/// echoes the normalized request back.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

impl WorkflowExecutor for EchoExecutor {
    fn execute<'a>(
        &'a self,
        workflow: &'a Workflow,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<Value, ExecuteError>> {
        Box::pin(async move {
            let request = serde_json::to_value(&*ctx)?;
            Ok(json!({
                "actionId": workflow.metadata.target_action_id,
                "request": request,
            }))
        })
    }
}
