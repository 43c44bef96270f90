//! Jobs: containers of watched processes.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{CoreError, Result};
use crate::task::{allocate_koid, ExceptionSink, ExceptionToken, Process};
use crate::types::{ExceptionInfo, ExceptionType, Koid};

/// A container of processes.
///
/// A job's exception channel delivers one notification: "a process is
/// starting in this job". While that notification is pending, the new
/// process's initial thread is halted; resuming the exception lets the
/// launch proceed. A job with no bound channel launches processes
/// immediately.
///
/// `Job` is a cheap handle (`Arc` inside); clones refer to the same job.
#[derive(Clone)]
pub struct Job
{
    inner: Arc<JobInner>,
}

struct JobInner
{
    koid: Koid,
    name: String,
    state: Mutex<JobState>,
}

struct JobState
{
    sink: Option<ExceptionSink>,
    processes: Vec<Process>,
}

impl Job
{
    /// Create an empty job. No kernel interaction; binding an exception
    /// channel and spawning processes are separate steps.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Job
    {
        Job {
            inner: Arc::new(JobInner {
                koid: allocate_koid(),
                name: name.into(),
                state: Mutex::new(JobState {
                    sink: None,
                    processes: Vec::new(),
                }),
            }),
        }
    }

    #[must_use]
    pub fn koid(&self) -> Koid
    {
        self.inner.koid
    }

    #[must_use]
    pub fn name(&self) -> &str
    {
        &self.inner.name
    }

    /// Spawn `program` as a new process named `name` under this job.
    ///
    /// If the job's exception channel is bound, a process-starting
    /// exception is posted and the launch is held until the exception is
    /// resumed; otherwise the process launches immediately.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: empty program name
    pub fn spawn(&self, name: impl Into<String>, program: &str, args: &[&str]) -> Result<Process>
    {
        if program.is_empty() {
            return Err(CoreError::InvalidArgument("empty program name".to_string()));
        }

        let process = Process::new(name, program, args);
        let sink = {
            let mut state = self.inner.state.lock().unwrap();
            state.processes.push(process.clone());
            state.sink.clone()
        };

        match sink {
            Some(sink) => {
                debug!(
                    job = %self.inner.name,
                    process = %process.name(),
                    process_koid = process.koid().raw(),
                    "holding new process for process-starting notification"
                );
                let info = ExceptionInfo {
                    process: process.koid(),
                    thread: process.initial_thread_koid(),
                    ty: ExceptionType::ProcessStarting,
                };
                // If the loop is gone, the unconsumed token's drop resumes
                // the process anyway.
                let _ = sink.post_exception(info, ExceptionToken::process_start(process.clone()));
            }
            None => process.launch(),
        }

        Ok(process)
    }

    /// All processes ever spawned under this job, in spawn order.
    #[must_use]
    pub fn processes(&self) -> Vec<Process>
    {
        self.inner.state.lock().unwrap().processes.clone()
    }

    /// Look up a process by koid.
    #[must_use]
    pub fn process_by_koid(&self, koid: Koid) -> Option<Process>
    {
        self.inner
            .state
            .lock()
            .unwrap()
            .processes
            .iter()
            .find(|process| process.koid() == koid)
            .cloned()
    }

    pub(crate) fn bind_exception_sink(&self, sink: ExceptionSink) -> Result<()>
    {
        let mut state = self.inner.state.lock().unwrap();
        if state.sink.is_some() {
            return Err(CoreError::AlreadyBound(format!("job {}", self.inner.name)));
        }
        state.sink = Some(sink);
        Ok(())
    }

    pub(crate) fn unbind_exception_sink(&self)
    {
        self.inner.state.lock().unwrap().sink = None;
    }
}
