//! # xedbg Utilities
//!
//! Shared logging helpers for the xedbg workspace.
//!
//! The debugger core only emits `tracing` events; binaries and tests decide
//! where they go by calling one of the initializers in [`logging`].

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{
    init_logging, init_logging_to_file, init_logging_with_level, init_test_logging, LogFormat, LogLevel, LoggingError,
    LoggingGuard,
};
pub use tracing::{debug, error, info, trace, warn};
