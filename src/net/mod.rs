//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, connection limit)
//!     → connection.rs (ID, open-connection count)
//!     → server.rs (HTTP/1.1 + HTTP/2 with upgrades, timeouts)
//!     → Handler (ApiServer or WebServer router)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - The listening socket stays bound across workflow reloads

pub mod connection;
pub mod listener;
pub mod server;

pub use listener::{Listener, ListenerError};
pub use server::serve;
