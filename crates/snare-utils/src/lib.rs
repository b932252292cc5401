//! # Snare Utilities
//!
//! Helpers shared by the snare binaries; currently the `tracing` subscriber
//! setup used by the CLI.

pub mod logging;

pub use logging::{
    init_logging, init_logging_to_file, init_logging_with_level, LogFormat, LogLevel, LoggingError, LoggingGuard,
};
pub use tracing::{debug, error, info, trace, warn};
