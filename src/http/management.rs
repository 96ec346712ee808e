//! Management API for remote redeployment.
//!
//! # Routes
//! - `GET  /_kdeps/status`   workflow summary (no auth)
//! - `PUT  /_kdeps/workflow` replace the workflow YAML, then reload
//! - `PUT  /_kdeps/package`  extract a `.kdeps` package, then reload
//! - `POST /_kdeps/reload`   reload from disk
//!
//! # Design Decisions
//! - Write routes need `Authorization: Bearer <token>` matching
//!   `KDEPS_MANAGEMENT_TOKEN`, read per request; an unset token disables
//!   them (503) instead of leaving them open
//! - Bodies are read up to limit + 1 bytes so "at the limit" and "over the
//!   limit" are distinguishable without buffering the excess
//! - Nothing is written to disk for oversized or empty bodies

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;

use crate::config::schema::MANAGEMENT_TOKEN_ENV;
use crate::http::archive::{clear_resources_dir, create_private_dir, extract_package, write_private_file};
use crate::http::server::{server_handler, status_error, ApiServer};
use crate::observability::metrics;
use crate::routing::{handler_fn, Handler, Router};
use crate::workflow::Workflow;

/// URL prefix of every management route.
pub const MANAGEMENT_PREFIX: &str = "/_kdeps";

const BEARER_PREFIX: &str = "Bearer ";

/// Register the management routes on `router`.
pub(crate) fn register(router: &mut Router, server: &Weak<ApiServer>) {
    router.get(
        format!("{}/status", MANAGEMENT_PREFIX),
        server_handler(server, |server, _req| async move { status(&server) }),
    );
    router.put(
        format!("{}/workflow", MANAGEMENT_PREFIX),
        require_auth(server_handler(server, |server, req| async move {
            update_workflow(server, req).await
        })),
    );
    router.put(
        format!("{}/package", MANAGEMENT_PREFIX),
        require_auth(server_handler(server, |server, req| async move {
            update_package(server, req).await
        })),
    );
    router.post(
        format!("{}/reload", MANAGEMENT_PREFIX),
        require_auth(server_handler(server, |server, _req| async move {
            reload(server).await
        })),
    );
}

/// Outcome of checking a request's bearer token against `expected`.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Disabled,
    Unauthorized,
    Authorized,
}

pub fn check_bearer(expected: Option<&str>, authorization: Option<&str>) -> AuthOutcome {
    let Some(expected) = expected.map(str::trim).filter(|t| !t.is_empty()) else {
        return AuthOutcome::Disabled;
    };
    match authorization.and_then(|value| value.strip_prefix(BEARER_PREFIX)) {
        Some(provided) if bool::from(provided.trim().as_bytes().ct_eq(expected.as_bytes())) => {
            AuthOutcome::Authorized
        }
        _ => AuthOutcome::Unauthorized,
    }
}

fn require_auth(next: Handler) -> Handler {
    handler_fn(move |req: Request<Body>| {
        let next = next.clone();
        async move {
            let token = std::env::var(MANAGEMENT_TOKEN_ENV).ok();
            let authorization = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            match check_bearer(token.as_deref(), authorization) {
                AuthOutcome::Authorized => next(req).await,
                AuthOutcome::Disabled => status_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!(
                        "management API disabled: set {} to enable",
                        MANAGEMENT_TOKEN_ENV
                    ),
                ),
                AuthOutcome::Unauthorized => {
                    tracing::warn!(path = %req.uri().path(), "Rejected management request");
                    status_error(StatusCode::UNAUTHORIZED, "unauthorized")
                }
            }
        }
    })
}

fn management_error(status: StatusCode, message: String) -> Response {
    tracing::error!(status = status.as_u16(), message = %message, "Management API error");
    status_error(status, message)
}

fn workflow_brief(workflow: &Workflow) -> Value {
    json!({
        "name": workflow.metadata.name,
        "version": workflow.metadata.version,
    })
}

fn ok_response(server: &ApiServer, message: &str) -> Response {
    let workflow = server.workflow();
    Json(json!({
        "status": "ok",
        "message": message,
        "workflow": workflow_brief(&workflow),
    }))
    .into_response()
}

fn status(server: &ApiServer) -> Response {
    let workflow = server.workflow();
    Json(json!({
        "status": "ok",
        "workflow": {
            "name": workflow.metadata.name,
            "version": workflow.metadata.version,
            "description": workflow.metadata.description,
            "targetActionId": workflow.metadata.target_action_id,
            "resources": workflow.resources.len(),
        },
    }))
    .into_response()
}

/// Read at most `limit + 1` bytes of `body`.
async fn read_capped(body: Body, limit: u64) -> Result<Vec<u8>, axum::Error> {
    let cap = usize::try_from(limit.saturating_add(1)).unwrap_or(usize::MAX);
    let mut body = body;
    let mut buf = Vec::new();
    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        let room = cap - buf.len();
        buf.extend_from_slice(&data[..room.min(data.len())]);
        if buf.len() >= cap {
            break;
        }
    }
    Ok(buf)
}

/// Read and check a push body; `Err` carries the response to send.
async fn read_push_body(req: Request<Body>, limit: u64, what: &str) -> Result<Vec<u8>, Response> {
    let body = read_capped(req.into_body(), limit).await.map_err(|e| {
        management_error(
            StatusCode::BAD_REQUEST,
            format!("failed to read request body: {}", e),
        )
    })?;
    if body.is_empty() {
        return Err(management_error(
            StatusCode::BAD_REQUEST,
            "request body is empty".into(),
        ));
    }
    if body.len() as u64 > limit {
        return Err(management_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("{} exceeds maximum allowed size of {} bytes", what, limit),
        ));
    }
    Ok(body)
}

async fn ensure_dir(dir: PathBuf) -> Result<(), Response> {
    let created = tokio::task::spawn_blocking(move || create_private_dir(&dir))
        .await
        .map_err(std::io::Error::other)
        .and_then(|r| r);
    created.map_err(|e| {
        management_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to create workflow directory: {}", e),
        )
    })
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

async fn update_workflow(server: Arc<ApiServer>, req: Request<Body>) -> Response {
    let limit = server.config().management.max_workflow_bytes;
    let body = match read_push_body(req, limit, "workflow YAML").await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let workflow_path = server.resolved_workflow_path();
    let dir = parent_dir(&workflow_path);
    if let Err(response) = ensure_dir(dir.clone()).await {
        return response;
    }

    let target = workflow_path.clone();
    let written = tokio::task::spawn_blocking(move || {
        write_private_file(&target, &body)?;
        let removed = clear_resources_dir(&dir.join("resources"));
        Ok::<usize, std::io::Error>(removed)
    })
    .await
    .map_err(std::io::Error::other)
    .and_then(|r| r);
    match written {
        Ok(removed) => {
            tracing::info!(
                path = %workflow_path.display(),
                stale_resources = removed,
                "Workflow file written"
            );
        }
        Err(e) => {
            return management_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to write workflow file: {}", e),
            );
        }
    }

    server.set_workflow_path_if_unset(&workflow_path);
    if let Err(e) = server.reload_workflow().await {
        return management_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("workflow written but failed to reload: {}", e),
        );
    }
    ok_response(&server, "workflow updated and reloaded")
}

async fn update_package(server: Arc<ApiServer>, req: Request<Body>) -> Response {
    let limits = server.config().management.clone();
    let body = match read_push_body(req, limits.max_package_bytes, "package").await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let workflow_path = server.resolved_workflow_path();
    let dest = parent_dir(&workflow_path);
    if let Err(response) = ensure_dir(dest.clone()).await {
        return response;
    }

    let max_file = limits.max_package_file_bytes;
    let extract_dest = dest.clone();
    let extracted = tokio::task::spawn_blocking(move || {
        extract_package(&body, &extract_dest, max_file).map_err(|e| e.to_string())
    })
    .await
    .unwrap_or_else(|e| Err(e.to_string()));
    match extracted {
        Ok(summary) => {
            metrics::record_package_extraction(true);
            tracing::info!(
                dest = %dest.display(),
                files = summary.files,
                directories = summary.directories,
                "Package extracted"
            );
        }
        Err(e) => {
            metrics::record_package_extraction(false);
            return management_error(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("failed to extract package: {}", e),
            );
        }
    }

    server.set_workflow_path_if_unset(&workflow_path);
    if let Err(e) = server.reload_workflow().await {
        return management_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("package extracted but failed to reload: {}", e),
        );
    }
    ok_response(&server, "package extracted and workflow reloaded")
}

async fn reload(server: Arc<ApiServer>) -> Response {
    if let Err(e) = server.reload_workflow().await {
        return management_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to reload workflow: {}", e),
        );
    }
    ok_response(&server, "workflow reloaded")
}
