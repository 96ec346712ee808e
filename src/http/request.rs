//! Request identification and normalization.
//!
//! # Responsibilities
//! - Tag every request with an ID (reused from `X-Request-ID` or generated)
//! - Record per-request metrics and a request-scoped tracing span
//! - Build the normalized [`RequestContext`] handed to the executor
//! - Derive the client IP from proxy headers or the socket address
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - Only the first value of repeated headers and query params is kept
//! - Bodies that are not valid JSON objects decode to an empty map

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, Request};
use bytes::Bytes;
use serde_json::{Map, Value};
use tracing::Instrument;
use uuid::Uuid;

use crate::observability::metrics;
use crate::routing::{handler_fn, middleware_fn, Handler, Middleware};
use crate::storage::UploadedFile;
use crate::workflow::{FileUpload, RequestContext};

/// Request ID header name.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Request ID stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Extension trait for reading the request ID off a request.
pub trait RequestIdExt {
    fn request_id(&self) -> Option<&str>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<&str> {
        self.extensions().get::<RequestId>().map(RequestId::as_str)
    }
}

/// Tag requests with an ID, echo it on the response, and record metrics.
pub fn request_id_middleware() -> Middleware {
    middleware_fn(|next: Handler| {
        handler_fn(move |mut req: Request<Body>| {
            let next = next.clone();
            async move {
                let start = Instant::now();
                let request_id = req
                    .headers()
                    .get(X_REQUEST_ID)
                    .and_then(|v| v.to_str().ok())
                    .filter(|v| !v.is_empty())
                    .map(|v| RequestId(v.to_string()))
                    .unwrap_or_else(RequestId::generate);
                req.extensions_mut().insert(request_id.clone());

                let method = req.method().to_string();
                let span = tracing::info_span!(
                    "request",
                    request_id = %request_id.0,
                    method = %method,
                    path = %req.uri().path(),
                );

                let mut response = next(req).instrument(span).await;

                if let Ok(value) = HeaderValue::from_str(&request_id.0) {
                    response.headers_mut().insert(X_REQUEST_ID, value);
                }
                metrics::record_request(&method, response.status().as_u16(), start);
                response
            }
        })
    })
}

/// `content-type` header, or empty.
pub fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

pub fn is_multipart(headers: &HeaderMap) -> bool {
    content_type(headers).starts_with("multipart/form-data")
}

pub fn is_urlencoded(headers: &HeaderMap) -> bool {
    content_type(headers).starts_with("application/x-www-form-urlencoded")
}

/// `content-type` → `Content-Type`.
pub fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Client IP: first `X-Forwarded-For` hop, else `X-Real-IP`, else the
/// socket address; any port is stripped.
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    let raw = if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        forwarded.split(',').next().unwrap_or_default().trim().to_string()
    } else if let Some(real_ip) = header_str(headers, "x-real-ip") {
        real_ip.to_string()
    } else {
        return remote.map(|addr| addr.ip().to_string()).unwrap_or_default();
    };
    strip_port(&raw)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn strip_port(raw: &str) -> String {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return ip.to_string();
    }
    match raw.rfind(':') {
        Some(idx) => raw[..idx].to_string(),
        None => raw.to_string(),
    }
}

/// First value per key from an `application/x-www-form-urlencoded` string.
pub fn parse_form(input: &[u8]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(input) {
        out.entry(key.into_owned()).or_insert_with(|| value.into_owned());
    }
    out
}

/// Build the executor's view of a request.
///
/// `body` is the raw body for non-multipart requests; `form_fields` holds
/// decoded multipart text fields.
pub fn parse_request(
    parts: &Parts,
    body: &Bytes,
    form_fields: Map<String, Value>,
    uploaded: &[UploadedFile],
) -> RequestContext {
    let query = parts
        .uri
        .query()
        .map(|q| parse_form(q.as_bytes()))
        .unwrap_or_default();

    let mut headers = BTreeMap::new();
    for name in parts.headers.keys() {
        if let Some(value) = parts.headers.get(name).and_then(|v| v.to_str().ok()) {
            headers
                .entry(canonical_header_name(name.as_str()))
                .or_insert_with(|| value.to_string());
        }
    }

    let urlencoded = is_urlencoded(&parts.headers);
    let mut body_map = if urlencoded {
        Map::new()
    } else {
        serde_json::from_slice::<Map<String, Value>>(body).unwrap_or_default()
    };
    if urlencoded {
        for (key, value) in parse_form(body) {
            body_map.insert(key, Value::String(value));
        }
    }
    for (key, value) in form_fields {
        body_map.insert(key, value);
    }

    let remote = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let id = parts
        .extensions
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| RequestId::generate().0);

    RequestContext {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        headers,
        query,
        body: body_map,
        files: uploaded
            .iter()
            .map(|file| FileUpload {
                name: file.filename.clone(),
                path: file.path.clone(),
                mime_type: file.content_type.clone(),
                size: file.size,
            })
            .collect(),
        ip: client_ip(&parts.headers, remote),
        id,
        session_id: None,
    }
}
