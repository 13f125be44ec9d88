//! Shared helpers for the mbproxy service
//!
//! Provides the pieces every binary in the workspace needs:
//! - logging initialisation
//! - graceful shutdown signal handling
//! - hex formatting for frame dumps

pub mod hex;
pub mod logging;
pub mod shutdown;

pub use logging::LogConfig;
pub use shutdown::{wait_for_shutdown, ShutdownSignal};
