//! Wait-primitive wrappers.
//!
//! [`SignalWaiter`] wraps the loop's wake signal (a self-pipe) and re-arms
//! it after each delivery. [`ExceptionWaiter`] wraps one live
//! exception-channel binding for a process or job and unbinds it when the
//! watch is torn down: an `active` flag, explicit early release,
//! best-effort release on drop.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::Result;
use crate::sys::Pipe;
use crate::task::{ExceptionSink, Job, Process};

/// The loop's wake signal.
///
/// Arming writes one byte to the pipe; draining reads them all back. The
/// pipe's read end is the first entry in every poll set.
#[derive(Debug)]
pub(crate) struct SignalWaiter
{
    pipe: Pipe,
}

impl SignalWaiter
{
    pub(crate) fn new() -> io::Result<SignalWaiter>
    {
        Ok(SignalWaiter { pipe: Pipe::new()? })
    }

    pub(crate) fn fd(&self) -> RawFd
    {
        self.pipe.read_fd()
    }

    pub(crate) fn arm(&self)
    {
        self.pipe.notify();
    }

    pub(crate) fn drain(&self)
    {
        self.pipe.drain();
    }
}

enum ExceptionTarget
{
    Process(Process),
    Job(Job),
}

/// One live exception-channel binding.
///
/// Owned by the watch registry entry it belongs to; dropping it (or calling
/// [`ExceptionWaiter::unbind`]) detaches the sink from the task so no new
/// packets are posted under the watch's key. Packets already queued stay
/// queued; the dispatch path drops them as stale.
pub(crate) struct ExceptionWaiter
{
    target: ExceptionTarget,
    active: bool,
}

impl ExceptionWaiter
{
    /// Bind `sink` as the process's exception channel.
    ///
    /// ## Errors
    ///
    /// - `AlreadyBound`: the process already has a bound channel
    pub(crate) fn bind_process(process: &Process, sink: ExceptionSink) -> Result<ExceptionWaiter>
    {
        process.bind_exception_sink(sink)?;
        Ok(ExceptionWaiter {
            target: ExceptionTarget::Process(process.clone()),
            active: true,
        })
    }

    /// Bind `sink` as the job's exception channel.
    ///
    /// ## Errors
    ///
    /// - `AlreadyBound`: the job already has a bound channel
    pub(crate) fn bind_job(job: &Job, sink: ExceptionSink) -> Result<ExceptionWaiter>
    {
        job.bind_exception_sink(sink)?;
        Ok(ExceptionWaiter {
            target: ExceptionTarget::Job(job.clone()),
            active: true,
        })
    }

    pub(crate) fn unbind(&mut self)
    {
        if self.active {
            match &self.target {
                ExceptionTarget::Process(process) => process.unbind_exception_sink(),
                ExceptionTarget::Job(job) => job.unbind_exception_sink(),
            }
            self.active = false;
        }
    }
}

impl Drop for ExceptionWaiter
{
    fn drop(&mut self)
    {
        self.unbind();
    }
}
