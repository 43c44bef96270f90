//! Watched-task model: jobs, processes, and their exception channels.
//!
//! The dispatch core treats the kernel as a collaborator reached through a
//! narrow interface: bind an exception channel to a job or process, receive
//! exception packets, resume halted threads. This module is that interface.
//! A [`Job`] is a container of processes; spawning a process under a job
//! whose exception channel is bound posts a process-starting packet and
//! holds the new process's initial thread until the exception is resumed.
//! A [`Process`] stages its launch the same way: thread-starting is
//! delivered (and held) if a process-level channel is bound, and the real
//! child only starts once that is resumed. A monitor thread reports
//! thread-exiting and termination when the child ends.
//!
//! Exception channels do not purge queued packets when they are unbound;
//! a packet can therefore arrive at the loop keyed to a watch that no
//! longer exists, which the dispatch path must tolerate.

mod job;
mod process;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub use job::Job;
pub use process::Process;

use crate::message_loop::port::{LoopPort, Packet, PacketPayload};
use crate::types::{ExceptionInfo, Koid, ResumeOptions, WatchId};

// Koids start well above zero so they are visually distinct from watch ids
// and fds in logs.
static NEXT_KOID: AtomicU64 = AtomicU64::new(0x1000);

pub(crate) fn allocate_koid() -> Koid
{
    Koid(NEXT_KOID.fetch_add(1, Ordering::Relaxed))
}

/// Delivery end of an exception channel: posts packets into the owning
/// loop's port under the watch's key.
///
/// Holds only a weak reference to the port; if the loop is gone, posting
/// reports failure and the task layer lets the target run unobserved.
#[derive(Clone)]
pub(crate) struct ExceptionSink
{
    key: WatchId,
    port: Weak<LoopPort>,
}

impl ExceptionSink
{
    pub(crate) fn new(key: WatchId, port: &Arc<LoopPort>) -> ExceptionSink
    {
        ExceptionSink {
            key,
            port: Arc::downgrade(port),
        }
    }

    /// Post an exception packet. Returns false if the loop is gone.
    pub(crate) fn post_exception(&self, info: ExceptionInfo, token: ExceptionToken) -> bool
    {
        match self.port.upgrade() {
            Some(port) => {
                port.post_packet(Packet {
                    key: self.key,
                    payload: PacketPayload::Exception { info, token },
                });
                true
            }
            None => false,
        }
    }

    /// Post a process-terminated signal. Returns false if the loop is gone.
    pub(crate) fn post_terminated(&self, process: Koid) -> bool
    {
        match self.port.upgrade() {
            Some(port) => {
                port.post_packet(Packet {
                    key: self.key,
                    payload: PacketPayload::Terminated { process },
                });
                true
            }
            None => false,
        }
    }
}

/// Opaque token needed to resume the thread halted by one exception.
///
/// Created when an exception packet is posted, stored in the loop's
/// pending-exception table, and consumed by
/// [`MessageLoop::resume_from_exception`](crate::MessageLoop::resume_from_exception).
/// What "resume" means depends on where the thread is halted: a
/// process-starting resume advances the staged launch, a thread-starting
/// resume actually starts the target, and fault/exit resumes acknowledge
/// the exception.
///
/// A token dropped unconsumed (stale packet, watcher gone, loop teardown)
/// performs the default resume itself: closing an exception channel
/// releases every thread it was holding, so a torn-down watch can never
/// wedge a target.
pub(crate) struct ExceptionToken
{
    halt: Option<HaltPoint>,
}

enum HaltPoint
{
    ProcessStart(Process),
    ThreadStart(Process),
    ThreadExit(Process),
    Fault(Process),
}

impl ExceptionToken
{
    pub(crate) fn process_start(process: Process) -> ExceptionToken
    {
        ExceptionToken {
            halt: Some(HaltPoint::ProcessStart(process)),
        }
    }

    pub(crate) fn thread_start(process: Process) -> ExceptionToken
    {
        ExceptionToken {
            halt: Some(HaltPoint::ThreadStart(process)),
        }
    }

    pub(crate) fn thread_exit(process: Process) -> ExceptionToken
    {
        ExceptionToken {
            halt: Some(HaltPoint::ThreadExit(process)),
        }
    }

    pub(crate) fn fault(process: Process) -> ExceptionToken
    {
        ExceptionToken {
            halt: Some(HaltPoint::Fault(process)),
        }
    }

    pub(crate) fn resume(mut self, options: ResumeOptions)
    {
        if let Some(halt) = self.halt.take() {
            halt.resume(options);
        }
    }
}

impl Drop for ExceptionToken
{
    fn drop(&mut self)
    {
        if let Some(halt) = self.halt.take() {
            halt.resume(ResumeOptions::default());
        }
    }
}

impl HaltPoint
{
    fn resume(self, options: ResumeOptions)
    {
        match self {
            HaltPoint::ProcessStart(process) => process.resume_process_start(options),
            HaltPoint::ThreadStart(process) => process.resume_thread_start(options),
            HaltPoint::ThreadExit(process) | HaltPoint::Fault(process) => {
                process.acknowledge_exception(options);
            }
        }
    }
}
