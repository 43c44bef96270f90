//! Watcher callback traits.
//!
//! The message loop is polymorphic over a small closed set of callback
//! capability sets, one trait per watch kind. A watch registration bundles
//! the matching trait object at construction time, so the registry's kind
//! tag and its callback capability can never disagree.
//!
//! All callbacks run synchronously on the loop's own thread, never
//! concurrently with each other. A callback may deregister its own watch
//! (or another), post tasks, or request loop exit; it must not block for
//! long, since that stalls the entire loop.
//!
//! ## Why traits with `&self`?
//!
//! Watchers are registered as `Rc<dyn Trait>` and the loop keeps only a
//! weak reference: the caller owns the watcher and must keep it alive for
//! as long as the registration is live. Taking `&self` pushes mutability
//! into the watcher (Cell/RefCell), which keeps re-entrant deregistration
//! from a callback safe.

use std::os::unix::io::RawFd;

use crate::task::Process;
use crate::types::{ExceptionInfo, Koid};

/// Callbacks for a descriptor readiness watch.
pub trait FdWatcher
{
    /// The descriptor became ready.
    ///
    /// When `errored` is true the readiness flags are unreliable, so
    /// `readable` and `writable` are both false: handle the error and tear
    /// the watch down.
    fn on_fd_ready(&self, fd: RawFd, readable: bool, writable: bool, errored: bool);
}

/// Callbacks for a socket readiness watch.
///
/// Unlike [`FdWatcher`], the socket variant distinguishes a peer-closed
/// condition, which suppresses read/write callbacks entirely.
pub trait SocketWatcher
{
    /// The socket has data to read.
    fn on_socket_readable(&self, fd: RawFd)
    {
        let _ = fd;
    }

    /// The socket can accept more data.
    fn on_socket_writable(&self, fd: RawFd)
    {
        let _ = fd;
    }

    /// The socket errored or the peer closed it.
    fn on_socket_error(&self, fd: RawFd)
    {
        let _ = fd;
    }
}

/// Callbacks for a process exception watch.
///
/// Every exception callback (`on_thread_starting`, `on_thread_exiting`,
/// `on_exception`) leaves the triggering thread halted with a pending
/// exception recorded in the loop; the watcher must eventually call
/// [`MessageLoop::resume_from_exception`](crate::MessageLoop::resume_from_exception)
/// for that thread or the target stays wedged.
pub trait ProcessExceptionWatcher
{
    /// A thread started in the watched process.
    fn on_thread_starting(&self, exception: ExceptionInfo);

    /// A thread is exiting in the watched process.
    fn on_thread_exiting(&self, exception: ExceptionInfo);

    /// A fault-type exception (page fault, breakpoint, etc.) occurred.
    fn on_exception(&self, exception: ExceptionInfo);

    /// The watched process terminated. Delivered as a signal, not an
    /// exception: there is nothing to resume.
    fn on_process_terminated(&self, process: Koid);
}

/// Callbacks for a job exception watch.
///
/// The only subtype a job channel delivers is process-starting; anything
/// else reaching this watcher is a bug in the loop.
pub trait JobExceptionWatcher
{
    /// A process started somewhere in the watched job tree. Its initial
    /// thread is halted until the exception is resumed.
    fn on_process_starting(&self, exception: ExceptionInfo);
}

/// Consumer of processes accepted for debugging.
///
/// Implemented by the debug agent proper; [`DebuggedJob`](crate::DebuggedJob)
/// invokes it for each newly started process that matches the attach
/// filter, before the initial thread is resumed.
pub trait ProcessStartHandler
{
    /// A process was accepted for debugging. Ownership of the process
    /// handle transfers to the handler.
    fn on_process_start(&self, process: Process);
}
