//! Response envelopes.
//!
//! # Responsibilities
//! - Wrap results as `{success, data, meta}`
//! - Render errors as `{success: false, error, meta}` with the code's status
//! - Interpret API-response resource results (`success` + `data` + `_meta`)
//! - Issue the session cookie whenever a session is known
//!
//! # Design Decisions
//! - Internal error text and stack traces are only rendered in debug mode
//! - `_meta.headers` string values become response headers; every other
//!   `_meta` key is copied into `meta`

use axum::http::header::{self, HeaderName};
use axum::http::{Extensions, HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::error::{AppError, AppErrorCode, ExecuteError};
use crate::http::middleware::session::SessionId;
use crate::http::request::RequestId;

/// Name of the session cookie.
pub const SESSION_COOKIE_NAME: &str = "kdeps_session_id";

/// Session cookie lifetime in seconds.
pub const SESSION_COOKIE_MAX_AGE: u64 = 3600;

/// Request-derived values needed to render a response.
#[derive(Debug, Clone, Default)]
pub struct ResponseContext {
    pub request_id: String,
    pub session_id: Option<String>,
    pub path: String,
    pub method: String,
    /// Request arrived over HTTPS (per `X-Forwarded-Proto`).
    pub secure: bool,
}

impl ResponseContext {
    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self::build(req.headers(), req.extensions(), req.method(), req.uri())
    }

    pub fn from_parts(parts: &axum::http::request::Parts) -> Self {
        Self::build(&parts.headers, &parts.extensions, &parts.method, &parts.uri)
    }

    fn build(headers: &HeaderMap, extensions: &Extensions, method: &Method, uri: &Uri) -> Self {
        let secure = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .map(|proto| proto.eq_ignore_ascii_case("https"))
            .unwrap_or(false);
        Self {
            request_id: extensions
                .get::<RequestId>()
                .map(|id| id.0.clone())
                .unwrap_or_default(),
            session_id: extensions.get::<SessionId>().map(|s| s.0.clone()),
            path: uri.path().to_string(),
            method: method.to_string(),
            secure,
        }
    }
}

/// Current time as RFC 3339 with nanoseconds.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Append the session cookie to `response`.
pub fn set_session_cookie(response: &mut Response, session_id: &str, secure: bool) {
    let mut cookie = format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        SESSION_COOKIE_NAME, session_id, SESSION_COOKIE_MAX_AGE
    );
    if secure {
        cookie.push_str("; Secure");
    }
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(_) => tracing::warn!("Session ID is not a valid cookie value; cookie not set"),
    }
}

fn with_session(mut response: Response, ctx: &ResponseContext) -> Response {
    if let Some(session_id) = ctx.session_id.as_deref().filter(|s| !s.is_empty()) {
        set_session_cookie(&mut response, session_id, ctx.secure);
    }
    response
}

/// `{success: true, data, meta: {..meta, requestID, timestamp}}` with status 200.
pub fn respond_with_success(data: Value, mut meta: Map<String, Value>, ctx: &ResponseContext) -> Response {
    meta.insert("requestID".into(), Value::String(ctx.request_id.clone()));
    meta.insert("timestamp".into(), Value::String(timestamp()));

    let body = json!({
        "success": true,
        "data": data,
        "meta": meta,
    });
    with_session((StatusCode::OK, Json(body)).into_response(), ctx)
}

/// Render `err` as the error envelope with its status code.
pub fn respond_with_error(err: &AppError, ctx: &ResponseContext, debug: bool) -> Response {
    let mut error = Map::new();
    error.insert("code".into(), json!(err.code));
    error.insert("message".into(), Value::String(err.message.clone()));
    if let Some(resource_id) = err.resource_id.as_deref().filter(|id| !id.is_empty()) {
        error.insert("resourceId".into(), Value::String(resource_id.to_string()));
    }
    if !err.details.is_empty() {
        error.insert("details".into(), Value::Object(err.details.clone()));
    }
    if debug {
        if let Some(stack) = err.stack.as_deref().filter(|s| !s.is_empty()) {
            error.insert("stack".into(), Value::String(stack.to_string()));
        }
    }

    let body = json!({
        "success": false,
        "error": error,
        "meta": {
            "requestID": ctx.request_id,
            "timestamp": timestamp(),
            "path": ctx.path,
            "method": ctx.method,
        },
    });
    with_session((err.status, Json(body)).into_response(), ctx)
}

/// Wrap an arbitrary failure as `INTERNAL_ERROR`, exposing detail only in debug mode.
pub fn internal_error(err: &dyn std::fmt::Display, debug: bool) -> AppError {
    if !debug {
        return AppError::new(AppErrorCode::Internal, "Internal server error");
    }
    AppError::new(
        AppErrorCode::Internal,
        format!("Internal server error: {}", err),
    )
    .with_details("error", err.to_string())
    .with_stack(std::backtrace::Backtrace::force_capture().to_string())
}

/// Recover an [`AppError`] from an executor error, or wrap it as internal.
pub fn execute_error_to_app(err: ExecuteError, debug: bool) -> AppError {
    match err.downcast::<AppError>() {
        Ok(app) => *app,
        Err(other) => internal_error(&other, debug),
    }
}

/// Interpret a boolean-ish JSON value.
pub fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" | "y" => Some(true),
            "false" | "f" | "0" | "no" | "n" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_f64().map(|n| n != 0.0),
        _ => None,
    }
}

fn apply_meta_headers(response: &mut Response, headers: &Value) {
    let Some(headers) = headers.as_object() else {
        return;
    };
    for (key, value) in headers {
        let Some(value) = value.as_str() else {
            continue;
        };
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => tracing::debug!(header = %key, "Skipping invalid response header from _meta"),
        }
    }
}

/// Shape a successful executor result.
///
/// Objects carrying a `success` key are API-response resource results and
/// are unpacked; anything else is wrapped as data.
pub fn respond_with_result(result: Value, ctx: &ResponseContext, debug: bool) -> Response {
    let Value::Object(mut fields) = result else {
        return respond_with_success(result, Map::new(), ctx);
    };
    let Some(success_raw) = fields.get("success") else {
        return respond_with_success(Value::Object(fields), Map::new(), ctx);
    };
    let success = parse_bool(success_raw).unwrap_or(false);
    tracing::debug!(path = %ctx.path, success, "API response resource result");

    let mut meta = Map::new();
    let mut meta_headers = Value::Null;
    if let Some(Value::Object(raw_meta)) = fields.remove("_meta") {
        for (key, value) in raw_meta {
            if key == "headers" {
                meta_headers = value;
            } else {
                meta.insert(key, value);
            }
        }
    }
    let data = fields.remove("data").unwrap_or(Value::Null);

    let mut response = if success {
        respond_with_success(data, meta, ctx)
    } else {
        let err = AppError::new(AppErrorCode::ResourceFailed, "API response indicated failure");
        respond_with_error(&err, ctx, debug)
    };
    apply_meta_headers(&mut response, &meta_headers);
    if !response.headers().contains_key(header::CONTENT_TYPE) {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn ctx() -> ResponseContext {
        ResponseContext {
            request_id: "req-1".into(),
            session_id: None,
            path: "/api".into(),
            method: "POST".into(),
            secure: false,
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn plain_results_are_wrapped() {
        let response = respond_with_result(json!({"answer": 42}), &ctx(), false);
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["answer"], 42);
        assert_eq!(body["meta"]["requestID"], "req-1");
        assert!(body["meta"]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn api_response_results_are_unpacked() {
        let result = json!({
            "success": "true",
            "data": {"reply": "hi"},
            "_meta": {
                "headers": {"X-Model": "llama", "X-Ignored": 5},
                "model": "llama",
            },
        });
        let mut context = ctx();
        context.session_id = Some("sess-9".into());
        let response = respond_with_result(result, &context, false);

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-model"], "llama");
        assert!(response.headers().get("x-ignored").is_none());
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with("kdeps_session_id=sess-9;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(!cookie.contains("Secure"));

        let body = body_json(response).await;
        assert_eq!(body["data"]["reply"], "hi");
        assert_eq!(body["meta"]["model"], "llama");
        assert!(body["meta"].get("headers").is_none());
    }

    #[tokio::test]
    async fn failed_api_response_renders_error() {
        let result = json!({"success": "not-a-bool", "data": null});
        let response = respond_with_result(result, &ctx(), false);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "RESOURCE_FAILED");
        assert_eq!(body["meta"]["path"], "/api");
        assert_eq!(body["meta"]["method"], "POST");
    }

    #[tokio::test]
    async fn internal_detail_only_in_debug() {
        let err: ExecuteError = "database exploded".into();
        let app = execute_error_to_app(err, false);
        let body = body_json(respond_with_error(&app, &ctx(), false)).await;
        assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(body["error"]["message"], "Internal server error");
        assert!(body["error"].get("details").is_none());
        assert!(body["error"].get("stack").is_none());

        let err: ExecuteError = "database exploded".into();
        let app = execute_error_to_app(err, true);
        let body = body_json(respond_with_error(&app, &ctx(), true)).await;
        assert_eq!(body["error"]["message"], "Internal server error: database exploded");
        assert_eq!(body["error"]["details"]["error"], "database exploded");
        assert!(body["error"]["stack"].is_string());
    }

    #[tokio::test]
    async fn app_errors_keep_their_code() {
        let err: ExecuteError = Box::new(
            AppError::new(AppErrorCode::Validation, "bad input")
                .with_resource("validate")
                .with_details("field", "q"),
        );
        let app = execute_error_to_app(err, false);
        let response = respond_with_error(&app, &ctx(), false);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["resourceId"], "validate");
        assert_eq!(body["error"]["details"]["field"], "q");
    }

    #[test]
    fn secure_cookie_over_https() {
        let mut response = StatusCode::OK.into_response();
        set_session_cookie(&mut response, "abc", true);
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.ends_with("; Secure"));
        assert!(cookie.contains("Max-Age=3600"));
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool(&json!(true)), Some(true));
        assert_eq!(parse_bool(&json!("FALSE")), Some(false));
        assert_eq!(parse_bool(&json!(1)), Some(true));
        assert_eq!(parse_bool(&json!("maybe")), None);
        assert_eq!(parse_bool(&json!(null)), None);
    }
}
