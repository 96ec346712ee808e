//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count open connections so shutdown can drain them
//! - Track per-connection request activity for the keep-alive idle timeout

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Relaxed ordering suffices: IDs only need to be unique.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts open connections and wakes waiters when the count reaches zero.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    active: AtomicU64,
    idle: Notify,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection; the guard releases it on drop.
    pub fn track(&self, peer: SocketAddr) -> ConnectionGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let guard = ConnectionGuard {
            inner: Arc::clone(&self.inner),
            id: ConnectionId::new(),
            peer,
            opened: Instant::now(),
        };
        tracing::trace!(connection_id = %guard.id, peer_addr = %peer, "Connection opened");
        guard
    }

    pub fn active_count(&self) -> u64 {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Wait until no connection is open or `timeout` elapses.
    ///
    /// Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.inner.idle.notified();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

/// Tracks one connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    inner: Arc<TrackerInner>,
    id: ConnectionId,
    peer: SocketAddr,
    opened: Instant,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
        tracing::trace!(
            connection_id = %self.id,
            peer_addr = %self.peer,
            duration_ms = self.opened.elapsed().as_millis() as u64,
            "Connection closed"
        );
    }
}

/// Request activity on one connection.
///
/// A connection is idle when no request is in flight and the last one
/// finished (or the connection opened) at least the idle timeout ago.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    inner: Arc<ActivityInner>,
}

#[derive(Debug)]
struct ActivityInner {
    in_flight: AtomicUsize,
    last: Mutex<tokio::time::Instant>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ActivityInner {
                in_flight: AtomicUsize::new(0),
                last: Mutex::new(tokio::time::Instant::now()),
            }),
        }
    }

    /// Mark a request in flight until the guard drops.
    pub fn begin(&self) -> ActivityGuard {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        ActivityGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    fn last(&self) -> tokio::time::Instant {
        *self.inner.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// When the connection becomes idle if nothing else happens.
    pub fn idle_deadline(&self, timeout: Duration) -> tokio::time::Instant {
        if self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::Instant::now() + timeout
        } else {
            self.last() + timeout
        }
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst) == 0 && self.last().elapsed() >= timeout
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// In-flight request marker from [`ActivityTracker::begin`].
#[derive(Debug)]
pub struct ActivityGuard {
    inner: Arc<ActivityInner>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        *self.inner.last.lock().unwrap_or_else(|e| e.into_inner()) = tokio::time::Instant::now();
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
