//! Panic recovery and debug mode.
//!
//! # Responsibilities
//! - Thread the debug-mode flag to downstream handlers
//! - Track whether the response has been committed
//! - Convert handler panics into a structured 500
//!
//! # Design Decisions
//! - A panic after the response was committed (e.g. a WebSocket upgrade
//!   already answered) is logged only
//! - Panic text and a backtrace are exposed only in debug mode

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Extensions, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;

use crate::error::{AppError, AppErrorCode};
use crate::http::response::{respond_with_error, ResponseContext};
use crate::routing::{handler_fn, middleware_fn, Handler, Middleware};

/// Debug-mode flag stored in request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugMode(pub bool);

/// Read the debug flag from request extensions (false when absent).
pub fn debug_mode_of(extensions: &Extensions) -> bool {
    extensions.get::<DebugMode>().map(|d| d.0).unwrap_or(false)
}

/// Shared flag marking that the response has been committed to the client.
#[derive(Debug, Clone, Default)]
pub struct ResponseTracker(Arc<AtomicBool>);

impl ResponseTracker {
    pub fn mark_sent(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_sent(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Mark the response of `extensions`' request as committed, if tracked.
pub fn mark_response_sent(extensions: &Extensions) {
    if let Some(tracker) = extensions.get::<ResponseTracker>() {
        tracker.mark_sent();
    }
}

/// Recover panics from downstream handlers using the given debug flag.
pub fn error_handler(debug: bool) -> Middleware {
    middleware_fn(move |next: Handler| {
        handler_fn(move |mut req: Request<Body>| {
            let next = next.clone();
            async move {
                let tracker = ResponseTracker::default();
                req.extensions_mut().insert(DebugMode(debug));
                req.extensions_mut().insert(tracker.clone());
                let ctx = ResponseContext::from_request(&req);

                match AssertUnwindSafe(next(req)).catch_unwind().await {
                    Ok(response) => response,
                    Err(payload) => recover(payload, &ctx, &tracker, debug),
                }
            }
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn recover(
    payload: Box<dyn Any + Send>,
    ctx: &ResponseContext,
    tracker: &ResponseTracker,
    debug: bool,
) -> Response {
    let message = panic_message(payload.as_ref());
    tracing::error!(
        request_id = %ctx.request_id,
        path = %ctx.path,
        method = %ctx.method,
        panic = %message,
        "Handler panicked"
    );

    if tracker.is_sent() {
        tracing::warn!(request_id = %ctx.request_id, "Response already committed; cannot report panic");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let err = if debug && !message.is_empty() {
        AppError::new(
            AppErrorCode::Internal,
            format!("Internal server error: {}", message),
        )
        .with_stack(std::backtrace::Backtrace::force_capture().to_string())
        .with_details("panic", message)
    } else {
        AppError::new(AppErrorCode::Internal, "Internal server error")
    };
    respond_with_error(&err, ctx, debug)
}
