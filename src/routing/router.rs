//! Method + path handler table with an ordered middleware chain.
//!
//! # Responsibilities
//! - Register handlers per method and path pattern
//! - Resolve exact matches before pattern matches
//! - Answer 405 with `Allow` when only other methods match, else 404
//! - Wrap route resolution in the middleware chain
//!
//! # Design Decisions
//! - Patterns are tried in declaration order
//! - Middleware wraps resolution, not the resolved handler, so every
//!   request (including unmatched ones and CORS preflights) passes through it
//! - The first registered middleware is outermost

use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::future::BoxFuture;

use crate::routing::matcher::match_pattern;

/// A type-erased async request handler.
pub type Handler = Arc<dyn Fn(Request<Body>) -> BoxFuture<'static, Response> + Send + Sync>;

/// Wraps a handler into another handler.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Build a [`Handler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// Build a [`Middleware`] from a closure over the next handler.
pub fn middleware_fn<F>(f: F) -> Middleware
where
    F: Fn(Handler) -> Handler + Send + Sync + 'static,
{
    Arc::new(f)
}

struct RouteEntry {
    pattern: String,
    handler: Handler,
}

/// Outcome of resolving a method and path.
pub enum Resolution {
    Found(Handler),
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

/// Hand-rolled HTTP router.
#[derive(Default)]
pub struct Router {
    /// Per-method route lists, in method registration order.
    routes: Vec<(Method, Vec<RouteEntry>)>,
    middleware: Vec<Middleware>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware. Earlier middleware wraps later middleware.
    pub fn use_middleware(&mut self, middleware: Middleware) {
        self.middleware.push(middleware);
    }

    /// Register `handler` for `method` and `pattern`, replacing any handler
    /// previously registered for the same pair.
    pub fn register(&mut self, method: Method, pattern: impl Into<String>, handler: Handler) {
        let pattern = pattern.into();
        let idx = match self.routes.iter().position(|(m, _)| *m == method) {
            Some(idx) => idx,
            None => {
                self.routes.push((method, Vec::new()));
                self.routes.len() - 1
            }
        };
        let entries = &mut self.routes[idx].1;
        match entries.iter_mut().find(|entry| entry.pattern == pattern) {
            Some(entry) => entry.handler = handler,
            None => entries.push(RouteEntry { pattern, handler }),
        }
    }

    pub fn get(&mut self, pattern: impl Into<String>, handler: Handler) {
        self.register(Method::GET, pattern, handler);
    }

    pub fn post(&mut self, pattern: impl Into<String>, handler: Handler) {
        self.register(Method::POST, pattern, handler);
    }

    pub fn put(&mut self, pattern: impl Into<String>, handler: Handler) {
        self.register(Method::PUT, pattern, handler);
    }

    pub fn delete(&mut self, pattern: impl Into<String>, handler: Handler) {
        self.register(Method::DELETE, pattern, handler);
    }

    pub fn patch(&mut self, pattern: impl Into<String>, handler: Handler) {
        self.register(Method::PATCH, pattern, handler);
    }

    pub fn options(&mut self, pattern: impl Into<String>, handler: Handler) {
        self.register(Method::OPTIONS, pattern, handler);
    }

    /// True if a handler is registered for exactly this method and pattern.
    pub fn has_route(&self, method: &Method, pattern: &str) -> bool {
        self.routes
            .iter()
            .filter(|(m, _)| m == method)
            .flat_map(|(_, entries)| entries.iter())
            .any(|entry| entry.pattern == pattern)
    }

    /// Resolve a request target to a handler.
    pub fn resolve(&self, method: &Method, path: &str) -> Resolution {
        if let Some((_, entries)) = self.routes.iter().find(|(m, _)| m == method) {
            if let Some(entry) = entries.iter().find(|entry| entry.pattern == path) {
                return Resolution::Found(entry.handler.clone());
            }
            if let Some(entry) = entries
                .iter()
                .find(|entry| match_pattern(&entry.pattern, path))
            {
                return Resolution::Found(entry.handler.clone());
            }
        }

        let allowed = self.allowed_methods(path);
        if allowed.is_empty() {
            Resolution::NotFound
        } else {
            Resolution::MethodNotAllowed(allowed)
        }
    }

    /// Every method with an exact or pattern match for `path`.
    pub fn allowed_methods(&self, path: &str) -> Vec<Method> {
        self.routes
            .iter()
            .filter(|(_, entries)| {
                entries
                    .iter()
                    .any(|entry| entry.pattern == path || match_pattern(&entry.pattern, path))
            })
            .map(|(method, _)| method.clone())
            .collect()
    }

    /// Wrap `handler` in every registered middleware, first registered outermost.
    pub fn apply_middleware(&self, handler: Handler) -> Handler {
        self.middleware
            .iter()
            .rev()
            .fold(handler, |next, middleware| middleware(next))
    }

    /// Serve one request through the middleware chain.
    pub async fn serve(self: &Arc<Self>, req: Request<Body>) -> Response {
        let router = Arc::clone(self);
        let resolve = handler_fn(move |req: Request<Body>| {
            let router = Arc::clone(&router);
            async move { router.dispatch(req).await }
        });
        self.apply_middleware(resolve)(req).await
    }

    async fn dispatch(&self, req: Request<Body>) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match self.resolve(&method, &path) {
            Resolution::Found(handler) => handler(req).await,
            Resolution::MethodNotAllowed(allowed) => method_not_allowed(&allowed),
            Resolution::NotFound => {
                tracing::debug!(method = %method, path = %path, "No route matched");
                plain_text(StatusCode::NOT_FOUND, "404 page not found")
            }
        }
    }
}

fn method_not_allowed(allowed: &[Method]) -> Response {
    let allow = allowed
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    let mut response = plain_text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    if let Ok(value) = HeaderValue::from_str(&allow) {
        response.headers_mut().insert(header::ALLOW, value);
    }
    response
}

pub(crate) fn plain_text(status: StatusCode, body: &'static str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("{}\n", body),
    )
        .into_response()
}
