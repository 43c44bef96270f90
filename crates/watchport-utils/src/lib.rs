//! # watchport-utils
//!
//! Shared utilities for Watchport: logging infrastructure built on
//! `tracing`. Kept separate from the core so tests, tools, and future
//! frontends share one logging setup.

pub mod logging;

pub use logging::{init_logging, init_logging_with_level, LogFormat, LogLevel, LoggingError};
