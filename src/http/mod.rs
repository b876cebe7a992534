//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, ConnectInfo, graceful shutdown)
//!     → middleware/ (recover, access log, request id, cors, rate limit, auth)
//!     → middleware/timeout.rs (worker routes only)
//!     → handlers.rs (validate, acquire a worker slot, run the tool)
//!     → error.rs (status + plain-text body on failure)
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;

pub use error::ApiError;
pub use server::{AppState, HttpServer};
