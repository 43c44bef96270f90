//! # Message Loop
//!
//! The single-threaded dispatch core: one blocking wait primitive per
//! loop, multiplexing descriptor/socket readiness, job/process exception
//! channels, and posted tasks, with fan-out to typed watcher callbacks.
//!
//! ## Threading model
//!
//! Each `MessageLoop` is thread-affine: `init()`, all watch registration
//! and deregistration, `run()`, and `cleanup()` must happen on the same
//! thread, and every watcher callback executes synchronously on that
//! thread. The only operation that is safe from other threads is posting a
//! task (via [`TaskPoster`]) or an exception packet (done internally by
//! task monitor threads). Multiple loops may exist on different threads;
//! exactly one may be current per thread at a time, claimed by `init()`
//! and released by `cleanup()`.
//!
//! ## Ordering guarantees
//!
//! Posted tasks run in FIFO order, strictly before other completions are
//! dispatched on a wake, and are re-checked after every dispatched
//! completion, so a task enqueued by a callback always runs before the
//! loop blocks again. Readiness for one watch on one wake is ordered
//! read-then-write, re-validating the watch between the two. Completions
//! across different watches follow delivery order only.
//!
//! ## Stale completions
//!
//! Unregistering a watch does not purge completions already queued under
//! its id; a packet keyed to a freed id is an expected race, logged at
//! warning level and dropped.

pub(crate) mod port;
mod registry;
mod waiter;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::{debug, error, warn};

use crate::error::{CoreError, Result};
use crate::message_loop::port::{LoopPort, Packet, PacketPayload};
use crate::message_loop::registry::{DispatchCapability, WatchInfo, WatchRegistry};
use crate::message_loop::waiter::ExceptionWaiter;
use crate::sys;
use crate::task::{ExceptionSink, ExceptionToken, Job, Process};
use crate::types::{ExceptionType, Koid, ResumeOptions, WatchId, WatchMode};
use crate::watcher::{FdWatcher, JobExceptionWatcher, ProcessExceptionWatcher, SocketWatcher};

thread_local! {
    // The explicit per-thread current-loop slot. Claimed by init(),
    // released by cleanup(); double-claiming is a checked error.
    static CURRENT_LOOP: RefCell<Option<Rc<LoopInner>>> = const { RefCell::new(None) };
}

struct LoopInner
{
    port: Arc<LoopPort>,
    registry: WatchRegistry,
    // Thread koid -> token to resume it. Loop-thread only.
    pending_exceptions: RefCell<HashMap<Koid, ExceptionToken>>,
    quit_requested: Cell<bool>,
}

/// The dispatch loop. Cheap to clone; clones refer to the same loop.
#[derive(Clone)]
pub struct MessageLoop
{
    inner: Rc<LoopInner>,
}

/// RAII token for one live watch registration.
///
/// Dropping the handle deregisters the watch on the loop that is current
/// on the dropping thread, which must be the loop that created it. After
/// deregistration no further callbacks are invoked for the watch's id,
/// even if a completion for it was already queued.
#[derive(Debug)]
#[must_use = "dropping the handle stops the watch"]
pub struct WatchHandle
{
    id: WatchId,
    watching: bool,
}

impl WatchHandle
{
    /// Id of the registration this handle represents.
    #[must_use]
    pub fn id(&self) -> WatchId
    {
        self.id
    }

    /// Whether the registration is still live.
    #[must_use]
    pub fn watching(&self) -> bool
    {
        self.watching
    }

    /// Deregister early, before the handle is dropped.
    pub fn stop(mut self)
    {
        self.release();
    }

    fn release(&mut self)
    {
        if self.watching {
            self.watching = false;
            match MessageLoop::current() {
                Some(message_loop) => message_loop.stop_watching(self.id),
                None => warn!(
                    watch_id = self.id.raw(),
                    "watch handle dropped with no current loop; registration leaked"
                ),
            }
        }
    }
}

impl Drop for WatchHandle
{
    fn drop(&mut self)
    {
        self.release();
    }
}

/// Cross-thread task poster for one loop.
///
/// Posting is the only loop operation that is safe off the loop thread.
/// Holds a weak reference: posting after the loop is gone reports failure
/// instead of keeping the loop alive.
#[derive(Clone)]
pub struct TaskPoster
{
    port: std::sync::Weak<LoopPort>,
}

impl TaskPoster
{
    /// Post a task to run on the loop thread. Returns false if the loop
    /// no longer exists.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool
    {
        match self.port.upgrade() {
            Some(port) => {
                port.post_task(Box::new(task));
                true
            }
            None => false,
        }
    }
}

impl MessageLoop
{
    /// Create a loop. The loop is not current anywhere until `init()` is
    /// called on the thread that will run it.
    ///
    /// ## Errors
    ///
    /// - `Io`: the wake signal could not be created
    pub fn new() -> Result<MessageLoop>
    {
        Ok(MessageLoop {
            inner: Rc::new(LoopInner {
                port: LoopPort::new()?,
                registry: WatchRegistry::new(),
                pending_exceptions: RefCell::new(HashMap::new()),
                quit_requested: Cell::new(false),
            }),
        })
    }

    /// Claim the calling thread as this loop's thread.
    ///
    /// ## Errors
    ///
    /// - `LoopAlreadyCurrent`: another loop already claimed this thread
    pub fn init(&self) -> Result<()>
    {
        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            if current.is_some() {
                return Err(CoreError::LoopAlreadyCurrent);
            }
            *current = Some(Rc::clone(&self.inner));
            Ok(())
        })
    }

    /// The loop current on the calling thread, if any.
    #[must_use]
    pub fn current() -> Option<MessageLoop>
    {
        CURRENT_LOOP.with(|current| {
            current.borrow().as_ref().map(|inner| MessageLoop {
                inner: Rc::clone(inner),
            })
        })
    }

    /// Release the calling thread. Must be called after `run()` has
    /// returned and with no outstanding watches.
    pub fn cleanup(&self)
    {
        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            match current.take() {
                Some(inner) if Rc::ptr_eq(&inner, &self.inner) => {
                    let remaining = self.inner.registry.len();
                    if remaining > 0 {
                        warn!(remaining, "cleanup with outstanding watches");
                    }
                }
                other => {
                    warn!("cleanup on a thread this loop is not current on");
                    *current = other;
                }
            }
        });
    }

    /// A cloneable, `Send` poster for this loop's task queue.
    #[must_use]
    pub fn task_poster(&self) -> TaskPoster
    {
        TaskPoster {
            port: Arc::downgrade(&self.inner.port),
        }
    }

    /// Post a task to run on the loop thread, FIFO with other tasks.
    pub fn post_task(&self, task: impl FnOnce() + Send + 'static)
    {
        self.inner.port.post_task(Box::new(task));
    }

    /// Request loop exit. Idempotent; safe to call from inside a
    /// callback. Takes effect at the top of the next loop iteration, so
    /// the current callback always runs to completion.
    pub fn quit_now(&self)
    {
        self.inner.quit_requested.set(true);
        self.inner.port.wake();
    }

    /// Register interest in readiness of a descriptor.
    ///
    /// ## Errors
    ///
    /// - `InvalidDescriptor`: `fd` is not an open descriptor
    pub fn watch_fd(&self, mode: WatchMode, fd: RawFd, watcher: Rc<dyn FdWatcher>) -> Result<WatchHandle>
    {
        if !sys::is_valid_fd(fd) {
            return Err(CoreError::InvalidDescriptor(fd));
        }
        let id = self.inner.registry.register_with(|_| {
            Ok(WatchInfo::Fd {
                fd,
                mode,
                watcher: Rc::downgrade(&watcher),
            })
        })?;
        debug!(watch_id = id.raw(), fd, "fd watch registered");
        Ok(WatchHandle { id, watching: true })
    }

    /// Register interest in readiness of a socket-like descriptor. The
    /// socket variant additionally distinguishes peer-closed, which
    /// suppresses read/write callbacks.
    ///
    /// ## Errors
    ///
    /// - `InvalidDescriptor`: `fd` is not an open descriptor
    pub fn watch_socket(&self, mode: WatchMode, fd: RawFd, watcher: Rc<dyn SocketWatcher>) -> Result<WatchHandle>
    {
        if !sys::is_valid_fd(fd) {
            return Err(CoreError::InvalidDescriptor(fd));
        }
        let id = self.inner.registry.register_with(|_| {
            Ok(WatchInfo::Socket {
                fd,
                mode,
                watcher: Rc::downgrade(&watcher),
            })
        })?;
        debug!(watch_id = id.raw(), fd, "socket watch registered");
        Ok(WatchHandle { id, watching: true })
    }

    /// Bind to a process's exception stream. Also watches the process's
    /// terminated signal.
    ///
    /// ## Errors
    ///
    /// - `AlreadyBound`: the process already has a bound exception channel
    pub fn watch_process_exceptions(
        &self,
        process: &Process,
        watcher: Rc<dyn ProcessExceptionWatcher>,
    ) -> Result<WatchHandle>
    {
        let port = Arc::clone(&self.inner.port);
        let id = self.inner.registry.register_with(|id| {
            let waiter = ExceptionWaiter::bind_process(process, ExceptionSink::new(id, &port))?;
            Ok(WatchInfo::ProcessExceptions {
                process: process.clone(),
                watcher: Rc::downgrade(&watcher),
                waiter,
            })
        })?;
        debug!(watch_id = id.raw(), process = process.koid().raw(), "process exception watch registered");
        Ok(WatchHandle { id, watching: true })
    }

    /// Bind to a job's exception stream ("process starting" notifications
    /// for the whole job tree).
    ///
    /// ## Errors
    ///
    /// - `AlreadyBound`: the job already has a bound exception channel
    pub fn watch_job_exceptions(&self, job: &Job, watcher: Rc<dyn JobExceptionWatcher>) -> Result<WatchHandle>
    {
        let port = Arc::clone(&self.inner.port);
        let id = self.inner.registry.register_with(|id| {
            let waiter = ExceptionWaiter::bind_job(job, ExceptionSink::new(id, &port))?;
            Ok(WatchInfo::JobExceptions {
                job: job.clone(),
                watcher: Rc::downgrade(&watcher),
                waiter,
            })
        })?;
        debug!(watch_id = id.raw(), job = job.koid().raw(), "job exception watch registered");
        Ok(WatchHandle { id, watching: true })
    }

    /// Resume the thread halted by a pending exception.
    ///
    /// ## Panics
    ///
    /// Panics if `thread` has no pending exception: that indicates a bug
    /// in the caller (double resume, or resuming a thread that never
    /// faulted), not a runtime condition to recover from.
    pub fn resume_from_exception(&self, thread: Koid, options: ResumeOptions)
    {
        let token = self.inner.pending_exceptions.borrow_mut().remove(&thread);
        match token {
            Some(token) => token.resume(options),
            None => panic!("resume_from_exception: no pending exception for thread {thread}"),
        }
    }

    /// Run the loop until `quit_now()` is called.
    pub fn run(&self)
    {
        self.run_loop(None);
    }

    /// Run the loop until `quit_now()` is called or `timeout` elapses.
    /// Intended for polling/test use.
    pub fn run_until_timeout(&self, timeout: Duration)
    {
        self.run_loop(Some(Instant::now() + timeout));
    }

    fn run_loop(&self, deadline: Option<Instant>)
    {
        self.inner.quit_requested.set(false);

        'dispatch: loop {
            if self.process_tasks() {
                break;
            }

            while let Some(packet) = self.inner.port.pop_packet() {
                self.dispatch_packet(packet);
                if self.process_tasks() {
                    break 'dispatch;
                }
            }

            let timeout_ms = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    i32::try_from((deadline - now).as_millis().max(1)).unwrap_or(i32::MAX)
                }
                None => -1,
            };

            let entries = self.inner.registry.readiness_entries();
            let mut pollfds: SmallVec<[libc::pollfd; 8]> = SmallVec::with_capacity(entries.len() + 1);
            pollfds.push(libc::pollfd {
                fd: self.inner.port.wake_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            for entry in &entries {
                let mut events: libc::c_short = 0;
                if entry.mode.accepts_read() {
                    events |= libc::POLLIN;
                }
                if entry.mode.accepts_write() {
                    events |= libc::POLLOUT;
                }
                pollfds.push(libc::pollfd {
                    fd: entry.fd,
                    events,
                    revents: 0,
                });
            }

            let ready = match sys::poll(&mut pollfds, timeout_ms) {
                Ok(ready) => ready,
                Err(err) => {
                    error!(%err, "poll failed; exiting loop");
                    break;
                }
            };
            if ready == 0 {
                continue;
            }

            if pollfds[0].revents != 0 {
                self.inner.port.drain_wake();
            }

            for (index, entry) in entries.iter().enumerate() {
                let readiness = sys::Readiness::from_revents(pollfds[index + 1].revents);
                if !readiness.any() {
                    continue;
                }
                self.dispatch_readiness(entry.id, readiness);
                if self.process_tasks() {
                    break 'dispatch;
                }
            }
        }
    }

    /// Run queued tasks FIFO until the queue is empty or quit is
    /// requested. Returns whether quit was requested.
    fn process_tasks(&self) -> bool
    {
        while !self.inner.quit_requested.get() {
            let Some(task) = self.inner.port.pop_task() else {
                break;
            };
            task();
        }
        self.inner.quit_requested.get()
    }

    fn dispatch_readiness(&self, id: WatchId, readiness: sys::Readiness)
    {
        let Some(capability) = self.inner.registry.capability(id) else {
            warn!(watch_id = id.raw(), "readiness for unregistered watch; dropping");
            return;
        };

        match capability {
            DispatchCapability::Fd { fd, mode, watcher } => {
                let Some(watcher) = watcher.upgrade() else {
                    self.drop_dead_watch(id);
                    return;
                };
                if readiness.errored {
                    // Readiness flags are unreliable alongside an error;
                    // report only the error.
                    watcher.on_fd_ready(fd, false, false, true);
                    return;
                }
                // A hangup means EOF, which reads report.
                let readable = (readiness.readable || readiness.hangup) && mode.accepts_read();
                let writable = readiness.writable && mode.accepts_write();
                if readable || writable {
                    watcher.on_fd_ready(fd, readable, writable, false);
                } else if readiness.hangup {
                    // A hangup the mode cannot express as readable EOF.
                    // POLLHUP is level-triggered, so staying silent would
                    // spin the loop hot; report it as an error instead.
                    watcher.on_fd_ready(fd, false, false, true);
                }
            }
            DispatchCapability::Socket { fd, mode, watcher } => {
                let Some(watcher) = watcher.upgrade() else {
                    self.drop_dead_watch(id);
                    return;
                };
                if readiness.errored || readiness.hangup {
                    // Peer closed or errored: suppress read/write entirely.
                    watcher.on_socket_error(fd);
                    return;
                }
                if readiness.readable && mode.accepts_read() {
                    watcher.on_socket_readable(fd);
                }
                // The read callback may have deregistered this watch (or a
                // peer); re-validate before the write callback.
                if readiness.writable && mode.accepts_write() && self.inner.registry.contains(id) {
                    watcher.on_socket_writable(fd);
                }
            }
            DispatchCapability::ProcessExceptions { .. } | DispatchCapability::JobExceptions { .. } => {
                error!(watch_id = id.raw(), "readiness completion for exception watch");
                debug_assert!(false, "readiness completion for exception watch");
            }
        }
    }

    fn dispatch_packet(&self, packet: Packet)
    {
        let Some(capability) = self.inner.registry.capability(packet.key) else {
            // Expected race: the watch was torn down while this packet was
            // already queued.
            warn!(watch_id = packet.key.raw(), "completion for unregistered watch; dropping");
            return;
        };

        match capability {
            DispatchCapability::JobExceptions { watcher } => match packet.payload {
                PacketPayload::Exception { info, token } => {
                    assert!(
                        info.ty == ExceptionType::ProcessStarting,
                        "job exception watch received {:?}",
                        info.ty
                    );
                    match watcher.upgrade() {
                        Some(watcher) => {
                            self.record_pending(info.thread, token);
                            watcher.on_process_starting(info);
                        }
                        None => {
                            warn!(
                                watch_id = packet.key.raw(),
                                "job exception watcher gone; resuming thread"
                            );
                            token.resume(ResumeOptions::default());
                        }
                    }
                }
                PacketPayload::Terminated { .. } => {
                    panic!("job exception watch received a terminated signal")
                }
            },
            DispatchCapability::ProcessExceptions { watcher } => match packet.payload {
                PacketPayload::Exception { info, token } => {
                    assert!(
                        info.ty != ExceptionType::ProcessStarting,
                        "process exception watch received process-starting"
                    );
                    match watcher.upgrade() {
                        Some(watcher) => {
                            self.record_pending(info.thread, token);
                            match info.ty {
                                ExceptionType::ThreadStarting => watcher.on_thread_starting(info),
                                ExceptionType::ThreadExiting => watcher.on_thread_exiting(info),
                                _ => watcher.on_exception(info),
                            }
                        }
                        None => {
                            warn!(
                                watch_id = packet.key.raw(),
                                "process exception watcher gone; resuming thread"
                            );
                            token.resume(ResumeOptions::default());
                        }
                    }
                }
                PacketPayload::Terminated { process } => match watcher.upgrade() {
                    Some(watcher) => watcher.on_process_terminated(process),
                    None => warn!(
                        watch_id = packet.key.raw(),
                        "process exception watcher gone; dropping terminated signal"
                    ),
                },
            },
            DispatchCapability::Fd { .. } | DispatchCapability::Socket { .. } => {
                panic!("exception packet keyed to a readiness watch")
            }
        }
    }

    fn record_pending(&self, thread: Koid, token: ExceptionToken)
    {
        let previous = self.inner.pending_exceptions.borrow_mut().insert(thread, token);
        if previous.is_some() {
            warn!(thread = thread.raw(), "pending exception replaced without resume");
            debug_assert!(false, "duplicate pending exception for thread {thread}");
        }
    }

    /// Deregister a watch. Must run on the loop's own thread.
    pub(crate) fn stop_watching(&self, id: WatchId)
    {
        let Some(info) = self.inner.registry.remove(id) else {
            warn!(watch_id = id.raw(), "stop requested for unknown watch");
            return;
        };
        match info {
            WatchInfo::ProcessExceptions { process, mut waiter, .. } => {
                waiter.unbind();
                debug!(watch_id = id.raw(), process = %process.name(), "process exception watch stopped");
            }
            WatchInfo::JobExceptions { job, mut waiter, .. } => {
                waiter.unbind();
                debug!(watch_id = id.raw(), job = %job.name(), "job exception watch stopped");
            }
            WatchInfo::Fd { fd, .. } | WatchInfo::Socket { fd, .. } => {
                debug!(watch_id = id.raw(), fd, "watch stopped");
            }
        }
    }

    /// A watcher object died while its registration was still live: a
    /// caller bug, but not one worth wedging the loop over. Drop the
    /// registration so poll does not spin on it.
    fn drop_dead_watch(&self, id: WatchId)
    {
        warn!(watch_id = id.raw(), "watcher dropped while registered; removing watch");
        self.stop_watching(id);
    }
}
