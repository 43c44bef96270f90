//! # watchport-core
//!
//! Event and exception multiplexing core for the Watchport debug agent.
//!
//! This crate provides the foundational dispatch machinery, including:
//! - A single-threaded message loop that multiplexes descriptor/socket
//!   readiness, task exception channels, and posted tasks on one wait
//!   primitive
//! - RAII watch registration with guaranteed deregistration
//! - A job/process exception-watching layer that turns raw exception
//!   packets into structured callbacks and filters newly started
//!   processes against an attach policy
//!
//! ## Architecture
//!
//! The [`MessageLoop`] owns everything: the watch registry, the pending
//! exception table, and the wake signal. Watchers are small trait objects
//! (one per capability set) that the loop calls back synchronously on its
//! own thread. [`DebuggedJob`] sits on top of the job-exception stream and
//! decides which newly started processes are forwarded to the agent.
//!
//! ## Why unsafe code is needed
//!
//! The loop's blocking primitive is `poll(2)` and its wake signal is a
//! pipe, both driven through raw `libc` calls. All unsafe code lives in
//! the small `sys` module; everything above it is safe.

#![allow(unsafe_code)] // Required for the raw poll/pipe plumbing in `sys`

pub mod debugged_job;
pub mod error;
pub mod filter;
pub mod message_loop;
pub mod prelude;
pub mod task;
pub mod types;
pub mod watcher;

mod sys;

pub use debugged_job::DebuggedJob;
// Re-export commonly used types
pub use error::{CoreError, Result};
pub use filter::{Filter, MatchCase};
pub use message_loop::{MessageLoop, TaskPoster, WatchHandle};
pub use task::{Job, Process};
pub use types::{ExceptionInfo, ExceptionType, Koid, ResumeOptions, WatchId, WatchMode};
