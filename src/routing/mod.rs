//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (method, path)
//!     → router.rs (middleware chain → route lookup)
//!     → matcher.rs (segment-wise pattern match)
//!     → handler, or 405 with Allow, or 404
//!
//! Router construction (startup and every reload):
//!     Workflow routes + fixed routes
//!     → register in declaration order
//!     → freeze behind Arc, swapped atomically with its Workflow
//! ```
//!
//! # Design Decisions
//! - Routers are immutable once published; reloads build a new one
//! - No regex in hot path
//! - Exact match first, then first matching pattern

pub mod matcher;
pub mod router;

pub use matcher::match_pattern;
pub use router::{handler_fn, middleware_fn, Handler, Middleware, Resolution, Router};
