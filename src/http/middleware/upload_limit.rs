//! Early rejection of oversized multipart uploads.
//!
//! Only the declared `Content-Length` is checked here; the body itself is
//! capped again when it is read.

use axum::body::Body;
use axum::http::{header, Request};

use crate::error::{AppError, AppErrorCode};
use crate::http::middleware::recovery::debug_mode_of;
use crate::http::request::is_multipart;
use crate::http::response::{respond_with_error, ResponseContext};
use crate::routing::{handler_fn, middleware_fn, Handler, Middleware};

fn declared_length<B>(req: &Request<B>) -> Option<u64> {
    req.headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Reject multipart requests declaring a body larger than `max_file_size`.
pub fn upload_limit_middleware(max_file_size: u64) -> Middleware {
    middleware_fn(move |next: Handler| {
        handler_fn(move |req: Request<Body>| {
            let next = next.clone();
            async move {
                if !is_multipart(req.headers()) {
                    return next(req).await;
                }
                match declared_length(&req) {
                    Some(length) if length > max_file_size => {
                        let err = AppError::new(
                            AppErrorCode::RequestTooLarge,
                            format!(
                                "Request body too large: {} bytes (max: {})",
                                length, max_file_size
                            ),
                        );
                        let ctx = ResponseContext::from_request(&req);
                        respond_with_error(&err, &ctx, debug_mode_of(req.extensions()))
                    }
                    _ => next(req).await,
                }
            }
        })
    })
}
