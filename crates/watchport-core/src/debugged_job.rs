//! # DebuggedJob
//!
//! The policy layer atop job-exception delivery: holds the attach-filter
//! list, matches newly started process names against it, forwards accepted
//! processes to a [`ProcessStartHandler`], and unconditionally resumes the
//! triggering thread.
//!
//! ## Why resume unconditionally?
//!
//! Once attached, the handler receives a "thread starting" notification
//! for the same thread through the normal process-exception channel and
//! can hold it there if it wants the target paused. Failing to resume here
//! would wedge every new process in the job, filtered or not.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::filter::{Filter, MatchCase};
use crate::message_loop::{MessageLoop, WatchHandle};
use crate::task::Job;
use crate::types::{ExceptionInfo, ExceptionType, ResumeOptions};
use crate::watcher::{JobExceptionWatcher, ProcessStartHandler};

/// Watches one job for starting processes and applies the attach policy.
///
/// ## Lifecycle
///
/// 1. Construct with [`DebuggedJob::new`] (no kernel interaction)
/// 2. Wrap in `Rc` and call [`DebuggedJob::init`]; discard the object if
///    that fails
/// 3. Mutate the filter set with [`DebuggedJob::set_filters`] /
///    [`DebuggedJob::append_filter`]
/// 4. Drop it to stop watching; no callbacks arrive after that
pub struct DebuggedJob
{
    message_loop: MessageLoop,
    job: Job,
    handler: Rc<dyn ProcessStartHandler>,
    match_case: MatchCase,
    filters: RefCell<Vec<Filter>>,
    watch: RefCell<Option<WatchHandle>>,
}

impl DebuggedJob
{
    /// Pure construction; registration happens in [`DebuggedJob::init`].
    ///
    /// The handler is caller-owned and must outlive the watcher's
    /// registration; the loop reference must not outlive the loop's
    /// thread.
    #[must_use]
    pub fn new(message_loop: MessageLoop, job: Job, handler: Rc<dyn ProcessStartHandler>) -> DebuggedJob
    {
        DebuggedJob::with_match_case(message_loop, job, handler, MatchCase::default())
    }

    /// Like [`DebuggedJob::new`] with an explicit filter case policy.
    #[must_use]
    pub fn with_match_case(
        message_loop: MessageLoop,
        job: Job,
        handler: Rc<dyn ProcessStartHandler>,
        match_case: MatchCase,
    ) -> DebuggedJob
    {
        DebuggedJob {
            message_loop,
            job,
            handler,
            match_case,
            filters: RefCell::new(Vec::new()),
            watch: RefCell::new(None),
        }
    }

    /// Register for job-exception delivery. The object is unusable if
    /// this fails; the caller must discard it.
    ///
    /// ## Errors
    ///
    /// - `AlreadyBound`: the job already has a bound exception channel
    pub fn init(self: &Rc<Self>) -> Result<()>
    {
        let watcher: Rc<dyn JobExceptionWatcher> = self.clone();
        let handle = self.message_loop.watch_job_exceptions(&self.job, watcher)?;
        *self.watch.borrow_mut() = Some(handle);
        Ok(())
    }

    /// Replace the filter list wholesale, in the given order.
    pub fn set_filters(&self, patterns: Vec<String>)
    {
        let filters = patterns
            .into_iter()
            .map(|pattern| Filter::new(pattern, self.match_case))
            .collect();
        *self.filters.borrow_mut() = filters;
    }

    /// Add one filter. Idempotent: a filter equal to an existing raw
    /// pattern is a no-op.
    pub fn append_filter(&self, pattern: impl Into<String>)
    {
        let pattern = pattern.into();
        let mut filters = self.filters.borrow_mut();
        if filters.iter().any(|filter| filter.pattern() == pattern) {
            debug!(job = %self.job.name(), pattern = %pattern, "filter already present");
            return;
        }
        filters.push(Filter::new(pattern, self.match_case));
    }

    /// Raw patterns of the effective filter set, in registration order.
    #[must_use]
    pub fn filters(&self) -> Vec<String>
    {
        self.filters
            .borrow()
            .iter()
            .map(|filter| filter.pattern().to_string())
            .collect()
    }

    #[must_use]
    pub fn job(&self) -> &Job
    {
        &self.job
    }
}

impl JobExceptionWatcher for DebuggedJob
{
    fn on_process_starting(&self, exception: ExceptionInfo)
    {
        debug_assert_eq!(exception.ty, ExceptionType::ProcessStarting);

        match self.job.process_by_koid(exception.process) {
            Some(process) => {
                let name = process.name().to_string();
                // First match wins; registration order, not best match.
                let matched = self.filters.borrow().iter().find(|filter| filter.matches(&name)).map(|filter| {
                    filter.pattern().to_string()
                });
                match matched {
                    Some(pattern) => {
                        debug!(
                            job = %self.job.name(),
                            process = %name,
                            process_koid = exception.process.raw(),
                            pattern = %pattern,
                            "process accepted for debugging"
                        );
                        self.handler.on_process_start(process);
                    }
                    None => {
                        debug!(job = %self.job.name(), process = %name, "process did not match any filter");
                    }
                }
            }
            None => {
                warn!(
                    job = %self.job.name(),
                    process_koid = exception.process.raw(),
                    "starting process is already gone"
                );
            }
        }

        // Always resume, match or not: the new-thread notification on the
        // process channel is where a consumer pauses the target.
        self.message_loop.resume_from_exception(exception.thread, ResumeOptions::default());
    }
}
