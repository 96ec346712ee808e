//! Session cookie extraction.

use axum::body::Body;
use axum::http::{header, HeaderMap, Request};

use crate::http::response::SESSION_COOKIE_NAME;
use crate::routing::{handler_fn, middleware_fn, Handler, Middleware};

/// Session ID carried by the request's `kdeps_session_id` cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(pub String);

/// Value of the session cookie, if present and non-empty.
pub fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE_NAME)
        .map(|(_, value)| value.trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

/// Store the session cookie's value as a [`SessionId`] extension.
pub fn session_middleware() -> Middleware {
    middleware_fn(|next: Handler| {
        handler_fn(move |mut req: Request<Body>| {
            let next = next.clone();
            async move {
                if let Some(session_id) = session_from_headers(req.headers()) {
                    req.extensions_mut().insert(SessionId(session_id));
                }
                next(req).await
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn reads_session_among_other_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; kdeps_session_id=abc123; lang=en"),
        );
        assert_eq!(session_from_headers(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn empty_or_missing_cookie_is_no_session() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_from_headers(&headers), None);

        headers.insert(header::COOKIE, HeaderValue::from_static("kdeps_session_id="));
        assert_eq!(session_from_headers(&headers), None);

        headers.insert(header::COOKIE, HeaderValue::from_static("other_session_id=x"));
        assert_eq!(session_from_headers(&headers), None);
    }

    #[test]
    fn searches_every_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::COOKIE, HeaderValue::from_static("kdeps_session_id=s-2"));
        assert_eq!(session_from_headers(&headers).as_deref(), Some("s-2"));
    }
}
