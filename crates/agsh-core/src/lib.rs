//! agsh-core: Shared library for the Agent Shell session engine.
//!
//! Provides the error taxonomy used across the control and streaming planes,
//! the JSON control frames multiplexed onto terminal streams, and the
//! deterministic identity→worker routing used for horizontal scale-out.

pub mod error;
pub mod frames;
pub mod routing;

// Re-export commonly used items at crate root.
pub use error::{AgshError, AgshResult};
pub use frames::{ControlFrame, CLOSE_EXITED, CLOSE_NOT_FOUND, CLOSE_UNAUTHENTICATED};
pub use routing::{RouteStrategy, WorkerRouter};
