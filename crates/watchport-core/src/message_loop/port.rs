//! The loop's completion port.
//!
//! One queue of posted tasks (the reserved key-0 signal) and one queue of
//! exception/termination packets keyed by watch id, both paired with a
//! single wake signal. This is the only part of the loop that is safe to
//! touch from other threads: task layers post packets here from monitor
//! threads, and [`TaskPoster`](crate::TaskPoster) posts tasks.
//!
//! Unbinding a watch does not purge packets already queued under its key;
//! the dispatch path treats those as expected stale deliveries.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::message_loop::waiter::SignalWaiter;
use crate::task::ExceptionToken;
use crate::types::{ExceptionInfo, Koid, WatchId};

/// A posted task: runs once on the loop thread.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Payload of one queued completion.
pub(crate) enum PacketPayload
{
    /// An exception packet; carries the token needed to later resume the
    /// triggering thread.
    Exception
    {
        info: ExceptionInfo,
        token: ExceptionToken,
    },
    /// The watched process terminated.
    Terminated
    {
        process: Koid
    },
}

/// One queued completion, keyed to a watch id.
pub(crate) struct Packet
{
    pub key: WatchId,
    pub payload: PacketPayload,
}

pub(crate) struct LoopPort
{
    tasks: Mutex<VecDeque<Task>>,
    packets: Mutex<VecDeque<Packet>>,
    waker: SignalWaiter,
}

impl LoopPort
{
    pub(crate) fn new() -> io::Result<Arc<LoopPort>>
    {
        Ok(Arc::new(LoopPort {
            tasks: Mutex::new(VecDeque::new()),
            packets: Mutex::new(VecDeque::new()),
            waker: SignalWaiter::new()?,
        }))
    }

    pub(crate) fn wake_fd(&self) -> RawFd
    {
        self.waker.fd()
    }

    /// Re-arm the wake signal without queueing anything. Used by
    /// `quit_now` to pop a blocked poll.
    pub(crate) fn wake(&self)
    {
        self.waker.arm();
    }

    pub(crate) fn drain_wake(&self)
    {
        self.waker.drain();
    }

    pub(crate) fn post_task(&self, task: Task)
    {
        self.tasks.lock().unwrap().push_back(task);
        self.waker.arm();
    }

    /// Pop one task in FIFO order. If more tasks remain queued, the wake
    /// signal is re-armed so the next wait call is not starved.
    pub(crate) fn pop_task(&self) -> Option<Task>
    {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.pop_front();
        if task.is_some() && !tasks.is_empty() {
            self.waker.arm();
        }
        task
    }

    pub(crate) fn post_packet(&self, packet: Packet)
    {
        self.packets.lock().unwrap().push_back(packet);
        self.waker.arm();
    }

    pub(crate) fn pop_packet(&self) -> Option<Packet>
    {
        self.packets.lock().unwrap().pop_front()
    }
}
