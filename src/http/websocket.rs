//! WebSocket proxying for app routes.
//!
//! # Data Flow
//! ```text
//! Client ──upgrade──→ Gateway ──dial ws://127.0.0.1:<port>──→ App
//!        ←─ 101 ────          (only after the App accepted)
//!
//! Client ←──── messages ────→ pump ←──── messages ────→ App
//! ```
//!
//! # Design Decisions
//! - The backend is dialed before the client is upgraded, so a dead or
//!   refusing backend yields a plain 502 instead of a half-open socket
//! - Handshake headers are regenerated by the dialer and never forwarded
//! - One task per direction; whichever ends first tears both down
//! - Any origin is accepted

use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::extract::FromRequestParts;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::http::middleware::mark_response_sent;
use crate::observability::metrics;
use crate::routing::router::plain_text;

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Request headers owned by the handshake itself.
const HANDSHAKE_HEADERS: [&str; 6] = [
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "sec-websocket-extensions",
];

/// Error type for dialing the backend.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("invalid WebSocket target {0}: {1}")]
    Request(String, #[source] tungstenite::Error),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend answered the handshake with status {0}")]
    Rejected(u16),
    #[error("{0}")]
    Connect(#[source] tungstenite::Error),
}

/// True for `Upgrade: websocket` requests that also carry `Connection: upgrade`.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}

/// Client headers to replay on the backend handshake.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        if name == header::HOST || HANDSHAKE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

/// Open a WebSocket to `url`, failing after `timeout`.
pub async fn dial_backend(
    url: &str,
    headers: HeaderMap,
    timeout: Duration,
) -> Result<BackendSocket, DialError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| DialError::Request(url.to_string(), e))?;
    request.headers_mut().extend(headers);

    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)).await {
        Err(_) => Err(DialError::Timeout(timeout)),
        Ok(Err(tungstenite::Error::Http(response))) => {
            Err(DialError::Rejected(response.status().as_u16()))
        }
        Ok(Err(e)) => Err(DialError::Connect(e)),
        Ok(Ok((socket, _))) => Ok(socket),
    }
}

/// Proxy an upgrade request to the WebSocket at `target`.
pub async fn proxy_websocket(req: Request<Body>, target: String, handshake_timeout: Duration) -> Response {
    tracing::debug!(url = %target, "Proxying WebSocket connection");

    let headers = forwardable_headers(req.headers());
    let backend = match dial_backend(&target, headers, handshake_timeout).await {
        Ok(backend) => backend,
        Err(e) => {
            metrics::record_proxy_error("websocket");
            let message = match e {
                DialError::Rejected(_) => "WebSocket handshake failed",
                _ => "Failed to connect to WebSocket",
            };
            tracing::error!(url = %target, error = %e, "Failed to connect to backend WebSocket");
            return plain_text(StatusCode::BAD_GATEWAY, message);
        }
    };

    let (mut parts, _body) = req.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            tracing::error!(error = %rejection.body_text(), "Failed to upgrade client connection");
            return rejection.into_response();
        }
    };

    mark_response_sent(&parts.extensions);
    upgrade.on_upgrade(move |client| pump(client, backend))
}

async fn pump(client: WebSocket, backend: BackendSocket) {
    let (client_tx, client_rx) = client.split();
    let (backend_tx, backend_rx) = backend.split();

    let mut to_client = tokio::spawn(backend_to_client(backend_rx, client_tx));
    let mut to_backend = tokio::spawn(client_to_backend(client_rx, backend_tx));

    let ended = tokio::select! {
        _ = &mut to_client => {
            to_backend.abort();
            "backend"
        }
        _ = &mut to_backend => {
            to_client.abort();
            "client"
        }
    };
    tracing::debug!(ended_by = ended, "WebSocket proxy connection closed");
}

async fn backend_to_client(
    mut rx: SplitStream<BackendSocket>,
    mut tx: SplitSink<WebSocket, ws::Message>,
) {
    while let Some(message) = rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "Backend WebSocket read ended");
                break;
            }
        };
        let closing = message.is_close();
        let Some(message) = to_client_message(message) else {
            continue;
        };
        if let Err(e) = tx.send(message).await {
            tracing::debug!(error = %e, "Client WebSocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = tx.close().await;
}

async fn client_to_backend(
    mut rx: SplitStream<WebSocket>,
    mut tx: SplitSink<BackendSocket, Message>,
) {
    while let Some(message) = rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "Client WebSocket read ended");
                break;
            }
        };
        let closing = matches!(message, ws::Message::Close(_));
        if let Err(e) = tx.send(to_backend_message(message)).await {
            tracing::debug!(error = %e, "Backend WebSocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = tx.close().await;
}

fn to_client_message(message: Message) -> Option<ws::Message> {
    let converted = match message {
        Message::Text(text) => ws::Message::Text(text.as_str().to_owned().into()),
        Message::Binary(data) => ws::Message::Binary(data),
        Message::Ping(data) => ws::Message::Ping(data),
        Message::Pong(data) => ws::Message::Pong(data),
        Message::Close(frame) => ws::Message::Close(frame.map(|frame| ws::CloseFrame {
            code: frame.code.into(),
            reason: frame.reason.as_str().to_owned().into(),
        })),
        Message::Frame(_) => return None,
    };
    Some(converted)
}

fn to_backend_message(message: ws::Message) -> Message {
    match message {
        ws::Message::Text(text) => Message::Text(text.as_str().to_owned().into()),
        ws::Message::Binary(data) => Message::Binary(data),
        ws::Message::Ping(data) => Message::Ping(data),
        ws::Message::Pong(data) => Message::Pong(data),
        ws::Message::Close(frame) => Message::Close(frame.map(|frame| CloseFrame {
            code: CloseCode::from(frame.code),
            reason: frame.reason.as_str().to_owned().into(),
        })),
    }
}
