//! Application error taxonomy.
//!
//! # Responsibilities
//! - Machine-readable error codes for API responses
//! - Map each code to exactly one HTTP status
//! - Carry optional resource, details and (debug-only) stack context
//!
//! # Design Decisions
//! - Codes serialize as SCREAMING_SNAKE_CASE strings (`"BAD_REQUEST"`)
//! - Status is derived from the code at construction, never set by callers
//! - Details are a JSON object so they render verbatim in the error envelope

use axum::http::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};

/// Error type returned by workflow executors.
pub type ExecuteError = Box<dyn std::error::Error + Send + Sync>;

/// Machine-readable error code carried in every error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppErrorCode {
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    NotFound,
    Unauthorized,
    Forbidden,
    BadRequest,
    Conflict,
    RateLimited,
    RequestTooLarge,
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
    ServiceUnavailable,
    Timeout,
    DependencyFailed,
    ResourceFailed,
    PreflightFailed,
    ExpressionError,
}

impl AppErrorCode {
    /// HTTP status for this code.
    pub fn status(self) -> StatusCode {
        match self {
            Self::Validation | Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Conflict => StatusCode::CONFLICT,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal
            | Self::DependencyFailed
            | Self::ResourceFailed
            | Self::PreflightFailed
            | Self::ExpressionError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::BadRequest => "BAD_REQUEST",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::RequestTooLarge => "REQUEST_TOO_LARGE",
            Self::Internal => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::DependencyFailed => "DEPENDENCY_FAILED",
            Self::ResourceFailed => "RESOURCE_FAILED",
            Self::PreflightFailed => "PREFLIGHT_FAILED",
            Self::ExpressionError => "EXPRESSION_ERROR",
        }
    }
}

impl std::fmt::Display for AppErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An application error with the context needed to render an API response.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{code}] {message}{}", resource_suffix(.resource_id))]
pub struct AppError {
    pub code: AppErrorCode,
    pub message: String,
    pub status: StatusCode,
    pub resource_id: Option<String>,
    pub details: Map<String, Value>,
    /// Stack trace; rendered only in debug mode.
    pub stack: Option<String>,
}

fn resource_suffix(resource_id: &Option<String>) -> String {
    match resource_id {
        Some(id) => format!(" (resource: {})", id),
        None => String::new(),
    }
}

impl AppError {
    pub fn new(code: AppErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: code.status(),
            resource_id: None,
            details: Map::new(),
            stack: None,
        }
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_details(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}
