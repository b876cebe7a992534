//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → cors.rs (development-only CORS, preflight short-circuit)
//!     → rate_limit.rs (per-IP token buckets and temporary bans)
//!     → auth.rs (X-API-KEY for the protected prefix)
//!     → Pass to handlers
//! ```
//!
//! # Design Decisions
//! - Fail closed: reject on any security check failure
//! - Limiter state is an owned instance, never a global
//! - No trust in client input

pub mod auth;
pub mod cors;
pub mod rate_limit;

pub use rate_limit::{Denial, MethodPolicy, RateLimiter};
