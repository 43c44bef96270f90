//! The watch registry.
//!
//! Maps watch ids to [`WatchInfo`] entries. Id allocation and table
//! insertion happen as one step under the registry lock, so a half-created
//! entry can never be observed and the id counter cannot race. Lookups for
//! dispatch copy the minimal callback capability out of the table before
//! the lock is released; no borrow into the table is ever held across a
//! watcher callback, which is what makes re-entrant deregistration from a
//! callback safe.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::rc::Weak;
use std::sync::Mutex;

use smallvec::SmallVec;

use crate::error::Result;
use crate::message_loop::waiter::ExceptionWaiter;
use crate::task::{Job, Process};
use crate::types::{WatchId, WatchMode};
use crate::watcher::{FdWatcher, JobExceptionWatcher, ProcessExceptionWatcher, SocketWatcher};

/// One live registration: kind tag plus kind-specific handles and the
/// non-owning watcher reference. Exception variants also own the channel
/// binding used to cancel delivery on unregistration.
pub(crate) enum WatchInfo
{
    Fd
    {
        fd: RawFd,
        mode: WatchMode,
        watcher: Weak<dyn FdWatcher>,
    },
    Socket
    {
        fd: RawFd,
        mode: WatchMode,
        watcher: Weak<dyn SocketWatcher>,
    },
    ProcessExceptions
    {
        process: Process,
        watcher: Weak<dyn ProcessExceptionWatcher>,
        waiter: ExceptionWaiter,
    },
    JobExceptions
    {
        job: Job,
        watcher: Weak<dyn JobExceptionWatcher>,
        waiter: ExceptionWaiter,
    },
}

/// Callback capability copied out of the table for one dispatch.
pub(crate) enum DispatchCapability
{
    Fd
    {
        fd: RawFd,
        mode: WatchMode,
        watcher: Weak<dyn FdWatcher>,
    },
    Socket
    {
        fd: RawFd,
        mode: WatchMode,
        watcher: Weak<dyn SocketWatcher>,
    },
    ProcessExceptions
    {
        watcher: Weak<dyn ProcessExceptionWatcher>
    },
    JobExceptions
    {
        watcher: Weak<dyn JobExceptionWatcher>
    },
}

/// A readiness entry snapshot used to build the poll set.
pub(crate) struct ReadinessEntry
{
    pub id: WatchId,
    pub fd: RawFd,
    pub mode: WatchMode,
}

struct RegistryState
{
    // Monotonic, starts at 1; 0 is the reserved task-signal key. Never
    // rewinds, so ids are never reused.
    next_watch_id: u64,
    watches: BTreeMap<WatchId, WatchInfo>,
}

pub(crate) struct WatchRegistry
{
    state: Mutex<RegistryState>,
}

impl WatchRegistry
{
    pub(crate) fn new() -> WatchRegistry
    {
        WatchRegistry {
            state: Mutex::new(RegistryState {
                next_watch_id: 1,
                watches: BTreeMap::new(),
            }),
        }
    }

    /// Allocate an id and insert the entry `build` produces for it, as one
    /// atomic step. If `build` fails the id is consumed but nothing is
    /// inserted; ids are cheap and never reused.
    pub(crate) fn register_with<F>(&self, build: F) -> Result<WatchId>
    where
        F: FnOnce(WatchId) -> Result<WatchInfo>,
    {
        let mut state = self.state.lock().unwrap();
        let id = WatchId(state.next_watch_id);
        state.next_watch_id += 1;
        let info = build(id)?;
        state.watches.insert(id, info);
        Ok(id)
    }

    pub(crate) fn remove(&self, id: WatchId) -> Option<WatchInfo>
    {
        self.state.lock().unwrap().watches.remove(&id)
    }

    pub(crate) fn contains(&self, id: WatchId) -> bool
    {
        self.state.lock().unwrap().watches.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize
    {
        self.state.lock().unwrap().watches.len()
    }

    /// Copy out the callback capability for `id`, or `None` if the watch
    /// is gone (the expected stale-completion race).
    pub(crate) fn capability(&self, id: WatchId) -> Option<DispatchCapability>
    {
        let state = self.state.lock().unwrap();
        state.watches.get(&id).map(|info| match info {
            WatchInfo::Fd { fd, mode, watcher } => DispatchCapability::Fd {
                fd: *fd,
                mode: *mode,
                watcher: watcher.clone(),
            },
            WatchInfo::Socket { fd, mode, watcher } => DispatchCapability::Socket {
                fd: *fd,
                mode: *mode,
                watcher: watcher.clone(),
            },
            WatchInfo::ProcessExceptions { watcher, .. } => DispatchCapability::ProcessExceptions {
                watcher: watcher.clone(),
            },
            WatchInfo::JobExceptions { watcher, .. } => DispatchCapability::JobExceptions {
                watcher: watcher.clone(),
            },
        })
    }

    /// Snapshot of all readiness watches, in id order, for building the
    /// poll set.
    pub(crate) fn readiness_entries(&self) -> SmallVec<[ReadinessEntry; 8]>
    {
        let state = self.state.lock().unwrap();
        state
            .watches
            .iter()
            .filter_map(|(id, info)| match info {
                WatchInfo::Fd { fd, mode, .. } | WatchInfo::Socket { fd, mode, .. } => Some(ReadinessEntry {
                    id: *id,
                    fd: *fd,
                    mode: *mode,
                }),
                _ => None,
            })
            .collect()
    }
}
