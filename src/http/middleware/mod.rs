//! Request middleware.
//!
//! # Order (outermost first)
//! ```text
//! request_id → error_handler(debug) → session → upload_limit → [routes] → cors
//! ```
//! CORS is registered last, so it runs innermost and decorates whatever
//! the route (or the 404/405 fallback) produced.

pub mod cors;
pub mod recovery;
pub mod session;
pub mod upload_limit;

pub use cors::cors_middleware;
pub use recovery::{debug_mode_of, error_handler, mark_response_sent, DebugMode};
pub use session::{session_middleware, SessionId};
pub use upload_limit::upload_limit_middleware;
