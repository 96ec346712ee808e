//! Per-connection HTTP serving.
//!
//! # Responsibilities
//! - Run the accept loop until shutdown
//! - Serve HTTP/1.1 and HTTP/2 (with upgrades) on each connection
//! - Apply the header-read, response and keep-alive idle timeouts
//! - Drain open connections on shutdown, bounded by the grace period
//!
//! # Design Decisions
//! - The handler is fetched per request, so it may route through whatever
//!   state is current (hot reload swaps happen behind it)
//! - The peer address is exposed as `ConnectInfo<SocketAddr>`
//! - Accept errors are logged and the loop keeps going
//! - An idle connection is shut down gracefully, so a response still
//!   being written completes first

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

use crate::config::schema::TimeoutConfig;
use crate::lifecycle::ShutdownSignal;
use crate::net::connection::{ActivityTracker, ConnectionTracker};
use crate::net::listener::{Listener, ListenerError};
use crate::routing::Handler;

/// Pause after a failed accept (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Serve `handler` on `listener` until `shutdown` fires, then drain.
pub async fn serve(
    listener: Listener,
    handler: Handler,
    timeouts: TimeoutConfig,
    mut shutdown: ShutdownSignal,
) -> Result<(), ListenerError> {
    let tracker = ConnectionTracker::new();
    let read_timeout = Duration::from_secs(timeouts.read_secs);
    let write_timeout = Duration::from_secs(timeouts.write_secs);
    let idle_timeout = Duration::from_secs(timeouts.idle_secs);

    if let Ok(addr) = listener.local_addr() {
        tracing::info!(address = %addr, "HTTP server starting");
    }

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.recv() => break,
        };
        let (stream, peer, permit) = match accepted {
            Ok(accepted) => accepted,
            Err(ListenerError::Accept(e)) => {
                tracing::warn!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
            Err(e) => return Err(e),
        };

        let guard = tracker.track(peer);
        let handler = handler.clone();
        let mut conn_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let connection_id = guard.id();
            let activity = ActivityTracker::new();

            let request_activity = activity.clone();
            let service = ServiceBuilder::new()
                .layer(write_timeout_layer(write_timeout))
                .service_fn(move |mut req: Request<Incoming>| {
                    let handler = handler.clone();
                    let active = request_activity.begin();
                    req.extensions_mut().insert(ConnectInfo(peer));
                    async move {
                        let response = handler(req.map(Body::new)).await;
                        drop(active);
                        Ok::<_, Infallible>(response)
                    }
                });
            let service = TowerToHyperService::new(service);
            let mut builder = auto::Builder::new(TokioExecutor::new());
            builder
                .http1()
                .timer(TokioTimer::new())
                .header_read_timeout(read_timeout);
            let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
            tokio::pin!(conn);

            let result = loop {
                let deadline = activity.idle_deadline(idle_timeout);
                tokio::select! {
                    result = conn.as_mut() => break result,
                    _ = conn_shutdown.recv() => {
                        conn.as_mut().graceful_shutdown();
                        break conn.as_mut().await;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        if activity.is_idle(idle_timeout) {
                            tracing::debug!(connection_id = %connection_id, "Closing idle connection");
                            conn.as_mut().graceful_shutdown();
                            break conn.as_mut().await;
                        }
                    }
                }
            };
            if let Err(e) = result {
                tracing::debug!(connection_id = %connection_id, error = %e, "Connection ended with error");
            }
            drop(guard);
        });
    }

    let grace = Duration::from_secs(timeouts.shutdown_grace_secs);
    tracing::info!(
        active_connections = tracker.active_count(),
        grace_secs = grace.as_secs(),
        "Draining connections"
    );
    if !tracker.wait_idle(grace).await {
        tracing::warn!(
            active_connections = tracker.active_count(),
            "Grace period elapsed with connections still open"
        );
    }
    tracing::info!("HTTP server stopped");
    Ok(())
}

#[allow(deprecated)]
fn write_timeout_layer(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::new(timeout)
}
