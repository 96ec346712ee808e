//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → net::serve stops accepting → drain connections (bounded)
//!     → WebServer::stop (kill app commands) → ApiServer::close
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, release resources
//! - Draining has a deadline; stragglers are dropped after it

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownSignal};
pub use signals::{spawn_signal_handler, termination_signal};
