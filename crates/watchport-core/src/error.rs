//! # Error Types
//!
//! General error handling for the dispatch core.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.
//!
//! Only *resource acquisition* failures are surfaced as errors: binding a
//! descriptor, claiming the thread-local loop slot, binding an exception
//! channel that is already taken. Expected kernel-style races (a completion
//! arriving for a watch that was already torn down) are logged and recovered
//! inside the loop, and programming-error invariant violations (resuming a
//! thread with no pending exception, a wrong exception subtype on a job
//! watch) panic instead of returning.

use thiserror::Error;

/// Main error type for dispatch-core operations
///
/// ## Error Categories
///
/// 1. **Loop lifecycle errors**: LoopAlreadyCurrent
/// 2. **Registration errors**: InvalidDescriptor, AlreadyBound
/// 3. **Target process errors**: NoExceptionChannel, InvalidArgument
/// 4. **Wait errors**: WaitTimedOut
/// 5. **I/O errors**: Io (pipe creation, poll failures)
#[derive(Error, Debug)]
pub enum CoreError
{
    /// A message loop has already claimed the calling thread.
    ///
    /// Exactly one [`MessageLoop`](crate::MessageLoop) may be current per
    /// thread at a time. Call `cleanup()` on the existing loop first.
    #[error("A message loop is already current on this thread")]
    LoopAlreadyCurrent,

    /// The descriptor passed to a readiness watch is not open.
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(i32),

    /// The task's exception channel is already bound to a watch.
    ///
    /// A job or process accepts at most one exception-channel binding at a
    /// time. The existing watch must be dropped before a new one can bind.
    #[error("Exception channel already bound for {0}")]
    AlreadyBound(String),

    /// The process has no exception channel bound.
    ///
    /// Raising a synthetic exception requires a live process-exception
    /// watch; without one there is nobody to deliver the packet to.
    #[error("No exception channel bound for {0}")]
    NoExceptionChannel(String),

    /// Invalid argument passed to a dispatch-core function
    ///
    /// Examples:
    /// - Raising a lifecycle subtype (`ThreadStarting` etc.) as a synthetic
    ///   exception
    /// - Spawning with an empty program name
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Timed out waiting for a target process to exit
    #[error("Timed out waiting for process exit")]
    WaitTimedOut,

    /// I/O error (pipe creation, poll, etc.)
    ///
    /// This is a standard Rust `std::io::Error` converted to our error type.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for `Result<T, CoreError>`
pub type Result<T> = std::result::Result<T, CoreError>;
