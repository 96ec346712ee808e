//! CORS headers and preflight handling.
//!
//! # Design Decisions
//! - Allowed origins are echoed back (never a literal `*`) so credentialed
//!   requests keep working, with `Vary: Origin` for caches
//! - Preflights (`OPTIONS`) are answered directly with 200
//! - Headers are applied to every response the chain produces, errors included

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::routing::{handler_fn, middleware_fn, Handler, Middleware};
use crate::workflow::model::{DEFAULT_CORS_HEADERS, DEFAULT_CORS_METHODS};
use crate::workflow::Cors;

fn joined_or(values: &[String], default: &str) -> String {
    if values.is_empty() {
        default.to_string()
    } else {
        values.join(", ")
    }
}

fn allowed_origin<'a>(cors: &Cors, headers: &'a HeaderMap) -> Option<&'a HeaderValue> {
    let origin = headers.get(header::ORIGIN)?;
    let origin_str = origin.to_str().ok().filter(|o| !o.is_empty())?;
    cors.allow_origins
        .iter()
        .any(|allowed| allowed == "*" || allowed == origin_str)
        .then_some(origin)
}

/// Apply `cors` to every response passing through the chain.
pub fn cors_middleware(cors: Cors) -> Middleware {
    let enabled = cors.is_enabled();
    let methods = HeaderValue::from_str(&joined_or(&cors.allow_methods, DEFAULT_CORS_METHODS))
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CORS_METHODS));
    let allow_headers = HeaderValue::from_str(&joined_or(&cors.allow_headers, DEFAULT_CORS_HEADERS))
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CORS_HEADERS));

    middleware_fn(move |next: Handler| {
        let cors = cors.clone();
        let methods = methods.clone();
        let allow_headers = allow_headers.clone();
        handler_fn(move |req: Request<Body>| {
            let next = next.clone();
            let cors = cors.clone();
            let methods = methods.clone();
            let allow_headers = allow_headers.clone();
            async move {
                if !enabled {
                    return next(req).await;
                }

                let origin = allowed_origin(&cors, req.headers()).cloned();
                let mut response = if req.method() == Method::OPTIONS {
                    StatusCode::OK.into_response()
                } else {
                    next(req).await
                };

                let headers = response.headers_mut();
                if let Some(origin) = origin {
                    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
                    headers.append(header::VARY, HeaderValue::from_static("Origin"));
                }
                headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, methods);
                headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, allow_headers);
                if cors.allow_credentials {
                    headers.insert(
                        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                        HeaderValue::from_static("true"),
                    );
                }
                response
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Router;
    use std::sync::Arc;

    fn router(cors: Cors) -> Arc<Router> {
        let mut router = Router::new();
        router.use_middleware(cors_middleware(cors));
        router.get(
            "/api",
            handler_fn(|_req: Request<Body>| async move { "ok".into_response() }),
        );
        Arc::new(router)
    }

    fn request(method: Method, origin: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri("/api");
        if let Some(origin) = origin {
            builder = builder.header(header::ORIGIN, origin);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn cors(origins: &[&str]) -> Cors {
        Cors {
            allow_origins: origins.iter().map(|o| o.to_string()).collect(),
            ..Cors::default()
        }
    }

    #[tokio::test]
    async fn wildcard_echoes_origin_with_defaults() {
        let response = router(cors(&["*"]))
            .serve(request(Method::GET, Some("http://localhost:5173")))
            .await;
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://localhost:5173");
        assert_eq!(headers[header::VARY], "Origin");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], DEFAULT_CORS_METHODS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], DEFAULT_CORS_HEADERS);
        assert!(headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
    }

    #[tokio::test]
    async fn unlisted_origin_gets_no_origin_header() {
        let response = router(cors(&["https://app.example.com"]))
            .serve(request(Method::GET, Some("https://evil.example.com")))
            .await;
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_METHODS).is_some());
    }

    #[tokio::test]
    async fn preflight_short_circuits() {
        let mut config = cors(&["https://app.example.com"]);
        config.allow_methods = vec!["GET".into(), "POST".into()];
        config.allow_headers = vec!["X-Token".into()];
        config.allow_credentials = true;

        let response = router(config)
            .serve(request(Method::OPTIONS, Some("https://app.example.com")))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "GET, POST");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "X-Token");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[tokio::test]
    async fn disabled_passes_through() {
        let mut config = cors(&["*"]);
        config.enable_cors = Some(false);
        let response = router(config)
            .serve(request(Method::OPTIONS, Some("http://localhost")))
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }
}
