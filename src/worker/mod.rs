//! Worker subsystem: everything between a validated request and the
//! external extraction tool.
//!
//! # Data Flow
//! ```text
//! handler
//!     → gate.rs (bounded admission, cancellable wait)
//!     → media_tool.rs (argument list for the tool)
//!     → process.rs (spawn, cancellable stdout, kill + reap)
//!     → bridge.rs (stdout → response body, disconnect classification)
//! ```

pub mod bridge;
pub mod gate;
pub mod media_tool;
pub mod process;

pub use bridge::{BufferPool, FlushPolicy, PipeOutcome};
pub use gate::{ConcurrencyGate, GateError, GatePermit};
pub use media_tool::{DownloadRequest, MediaKind, MediaTool, ToolError};
pub use process::{WorkerCommand, WorkerError, WorkerProcess};
