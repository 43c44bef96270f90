//! Convenience re-exports for consumers of the dispatch core.
//!
//! ```rust
//! use watchport_core::prelude::*;
//! ```

pub use crate::debugged_job::DebuggedJob;
pub use crate::error::{CoreError, Result};
pub use crate::filter::{Filter, MatchCase};
pub use crate::message_loop::{MessageLoop, TaskPoster, WatchHandle};
pub use crate::task::{Job, Process};
pub use crate::types::{ExceptionInfo, ExceptionType, Koid, ResumeOptions, WatchId, WatchMode};
pub use crate::watcher::{
    FdWatcher, JobExceptionWatcher, ProcessExceptionWatcher, ProcessStartHandler, SocketWatcher,
};
