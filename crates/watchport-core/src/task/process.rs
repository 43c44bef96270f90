//! Processes: staged launch, exception delivery, exit monitoring.

use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::error::{CoreError, Result};
use crate::task::{allocate_koid, ExceptionSink, ExceptionToken};
use crate::types::{ExceptionInfo, ExceptionType, Koid, ResumeOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase
{
    /// Created; initial thread halted pending a process-starting resume
    /// (or an immediate launch when the job is unwatched).
    Held,
    /// Thread-starting posted on the process channel; launch pending its
    /// resume.
    Notifying,
    /// Target child is running.
    Running,
    /// Target exited (or never launched).
    Exited,
}

/// A process under a [`Job`](crate::Job).
///
/// The process's display name is independent of the program it runs; the
/// attach filter matches against the name. The underlying target is a real
/// OS child process, launched only once every pending lifecycle exception
/// for it has been resumed.
///
/// `Process` is a cheap handle (`Arc` inside); clones refer to the same
/// process.
#[derive(Clone)]
pub struct Process
{
    inner: Arc<ProcessInner>,
}

struct ProcessInner
{
    koid: Koid,
    name: String,
    initial_thread: Koid,
    state: Mutex<ProcessState>,
    exited: Condvar,
}

struct ProcessState
{
    phase: Phase,
    command: Option<Command>,
    sink: Option<ExceptionSink>,
    exit_code: Option<i32>,
    child_pid: Option<i32>,
}

impl Process
{
    pub(crate) fn new(name: impl Into<String>, program: &str, args: &[&str]) -> Process
    {
        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

        Process {
            inner: Arc::new(ProcessInner {
                koid: allocate_koid(),
                name: name.into(),
                initial_thread: allocate_koid(),
                state: Mutex::new(ProcessState {
                    phase: Phase::Held,
                    command: Some(command),
                    sink: None,
                    exit_code: None,
                    child_pid: None,
                }),
                exited: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn koid(&self) -> Koid
    {
        self.inner.koid
    }

    /// Human-readable process name (diagnostics and filter matching).
    #[must_use]
    pub fn name(&self) -> &str
    {
        &self.inner.name
    }

    /// Koid of the process's initial thread.
    #[must_use]
    pub fn initial_thread_koid(&self) -> Koid
    {
        self.inner.initial_thread
    }

    /// Block until the target exits and return its exit code.
    ///
    /// ## Errors
    ///
    /// - `WaitTimedOut`: the target did not exit within `timeout`
    pub fn wait_exit(&self, timeout: Duration) -> Result<i32>
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(code) = state.exit_code {
                return Ok(code);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CoreError::WaitTimedOut);
            }
            let (next, _) = self.inner.exited.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }

    /// Inject a synthetic fault-type exception on the initial thread.
    ///
    /// The thread is considered halted until the exception is resumed.
    /// Requires a running target and a bound process-exception channel.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: `ty` is a lifecycle subtype, or the target is
    ///   not running
    /// - `NoExceptionChannel`: no process-exception watch is bound
    pub fn raise_exception(&self, ty: ExceptionType) -> Result<()>
    {
        if ty.is_lifecycle() {
            return Err(CoreError::InvalidArgument(format!(
                "cannot raise lifecycle exception {ty:?}"
            )));
        }

        let sink = {
            let state = self.inner.state.lock().unwrap();
            if state.phase != Phase::Running {
                return Err(CoreError::InvalidArgument(format!(
                    "process {} is not running",
                    self.inner.name
                )));
            }
            state.sink.clone()
        };

        let Some(sink) = sink else {
            return Err(CoreError::NoExceptionChannel(self.inner.name.clone()));
        };

        let info = ExceptionInfo {
            process: self.inner.koid,
            thread: self.inner.initial_thread,
            ty,
        };
        if !sink.post_exception(info, ExceptionToken::fault(self.clone())) {
            return Err(CoreError::NoExceptionChannel(self.inner.name.clone()));
        }
        Ok(())
    }

    /// Forcibly terminate the target, if it is running.
    pub fn kill(&self)
    {
        let pid = self.inner.state.lock().unwrap().child_pid;
        if let Some(pid) = pid {
            crate::sys::kill_process(pid);
        }
    }

    pub(crate) fn bind_exception_sink(&self, sink: ExceptionSink) -> Result<()>
    {
        let mut state = self.inner.state.lock().unwrap();
        if state.sink.is_some() {
            return Err(CoreError::AlreadyBound(format!("process {}", self.inner.name)));
        }
        state.sink = Some(sink);
        Ok(())
    }

    pub(crate) fn unbind_exception_sink(&self)
    {
        self.inner.state.lock().unwrap().sink = None;
    }

    /// Resume from the process-starting exception: if a process-level
    /// channel is bound, hold again for thread-starting; otherwise the
    /// target launches now.
    pub(crate) fn resume_process_start(&self, _options: ResumeOptions)
    {
        let sink = {
            let mut state = self.inner.state.lock().unwrap();
            if state.phase != Phase::Held {
                warn!(process = %self.inner.name, phase = ?state.phase, "process-start resume in unexpected phase");
                return;
            }
            match state.sink.clone() {
                Some(sink) => {
                    state.phase = Phase::Notifying;
                    Some(sink)
                }
                None => None,
            }
        };

        match sink {
            Some(sink) => {
                let info = ExceptionInfo {
                    process: self.inner.koid,
                    thread: self.inner.initial_thread,
                    ty: ExceptionType::ThreadStarting,
                };
                // A dead loop drops the token, which launches the target.
                let _ = sink.post_exception(info, ExceptionToken::thread_start(self.clone()));
            }
            None => self.launch(),
        }
    }

    /// Resume from the thread-starting exception: the target launches.
    pub(crate) fn resume_thread_start(&self, _options: ResumeOptions)
    {
        self.launch();
    }

    /// Acknowledge a fault or thread-exiting exception.
    pub(crate) fn acknowledge_exception(&self, _options: ResumeOptions)
    {
        trace!(process = %self.inner.name, "exception acknowledged");
    }

    /// Start the underlying OS child and the monitor thread that reports
    /// its exit. Idempotent: a second call is a no-op.
    pub(crate) fn launch(&self)
    {
        let mut state = self.inner.state.lock().unwrap();
        if matches!(state.phase, Phase::Running | Phase::Exited) {
            return;
        }
        let Some(mut command) = state.command.take() else {
            return;
        };

        match command.spawn() {
            Ok(child) => {
                state.phase = Phase::Running;
                state.child_pid = Some(child.id() as i32);
                drop(state);
                debug!(process = %self.inner.name, koid = self.inner.koid.raw(), "target launched");

                let process = self.clone();
                let reaper = thread::Builder::new()
                    .name(format!("watchport-reap-{}", self.inner.koid.raw()))
                    .spawn(move || process.reap(child));
                if let Err(err) = reaper {
                    error!(process = %self.inner.name, %err, "failed to start reaper thread");
                }
            }
            Err(err) => {
                error!(process = %self.inner.name, %err, "failed to launch target process");
                state.phase = Phase::Exited;
                state.exit_code = Some(127);
                let sink = state.sink.clone();
                drop(state);
                self.inner.exited.notify_all();
                if let Some(sink) = sink {
                    sink.post_terminated(self.inner.koid);
                }
            }
        }
    }

    fn reap(&self, mut child: Child)
    {
        let code = match child.wait() {
            Ok(status) => status.code().unwrap_or(-1),
            Err(err) => {
                error!(process = %self.inner.name, %err, "wait on target failed");
                -1
            }
        };

        let sink = {
            let mut state = self.inner.state.lock().unwrap();
            state.phase = Phase::Exited;
            state.exit_code = Some(code);
            state.child_pid = None;
            state.sink.clone()
        };
        self.inner.exited.notify_all();
        debug!(process = %self.inner.name, koid = self.inner.koid.raw(), code, "target exited");

        if let Some(sink) = sink {
            // Thread-exiting precedes the terminated signal, matching
            // kernel delivery order.
            let info = ExceptionInfo {
                process: self.inner.koid,
                thread: self.inner.initial_thread,
                ty: ExceptionType::ThreadExiting,
            };
            let _ = sink.post_exception(info, ExceptionToken::thread_exit(self.clone()));
            let _ = sink.post_terminated(self.inner.koid);
        }
    }
}
