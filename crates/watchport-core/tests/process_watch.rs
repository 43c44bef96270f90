//! Integration tests for process-exception delivery: the full attach flow
//! from "process starting" through thread lifecycle to termination, and
//! synthetic fault injection.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use watchport_core::prelude::*;

fn init_test_logging()
{
    let _ = watchport_utils::init_logging();
}

/// Shared event log plus the state the watcher callbacks need.
struct Flow
{
    events: RefCell<Vec<&'static str>>,
    process: RefCell<Option<Process>>,
    watch: RefCell<Option<WatchHandle>>,
    raise_on_start: bool,
}

impl Flow
{
    fn new(raise_on_start: bool) -> Rc<Flow>
    {
        Rc::new(Flow {
            events: RefCell::new(Vec::new()),
            process: RefCell::new(None),
            watch: RefCell::new(None),
            raise_on_start,
        })
    }

    fn events(&self) -> Vec<&'static str>
    {
        self.events.borrow().clone()
    }
}

/// Attaches a process-exception watch to every accepted process.
struct Attacher
{
    flow: Rc<Flow>,
    watcher: Rc<LifecycleWatcher>,
}

impl ProcessStartHandler for Attacher
{
    fn on_process_start(&self, process: Process)
    {
        let message_loop = MessageLoop::current().expect("current");
        let handle = message_loop
            .watch_process_exceptions(&process, Rc::clone(&self.watcher) as Rc<dyn ProcessExceptionWatcher>)
            .expect("attach");
        *self.flow.watch.borrow_mut() = Some(handle);
        *self.flow.process.borrow_mut() = Some(process);
    }
}

/// Records lifecycle events in delivery order and resumes every halted
/// thread.
struct LifecycleWatcher
{
    flow: Rc<Flow>,
}

impl ProcessExceptionWatcher for LifecycleWatcher
{
    fn on_thread_starting(&self, exception: ExceptionInfo)
    {
        assert_eq!(exception.ty, ExceptionType::ThreadStarting);
        self.flow.events.borrow_mut().push("thread-starting");

        let message_loop = MessageLoop::current().expect("current");
        message_loop.resume_from_exception(exception.thread, ResumeOptions::default());

        if self.flow.raise_on_start {
            // The resume above launched the target; it is now running and
            // can take a synthetic fault.
            let process = self.flow.process.borrow().clone().expect("process");
            process.raise_exception(ExceptionType::SoftwareBreakpoint).expect("raise");
        }
    }

    fn on_thread_exiting(&self, exception: ExceptionInfo)
    {
        assert_eq!(exception.ty, ExceptionType::ThreadExiting);
        self.flow.events.borrow_mut().push("thread-exiting");
        MessageLoop::current()
            .expect("current")
            .resume_from_exception(exception.thread, ResumeOptions::default());
    }

    fn on_exception(&self, exception: ExceptionInfo)
    {
        assert_eq!(exception.ty, ExceptionType::SoftwareBreakpoint);
        self.flow.events.borrow_mut().push("exception");
        MessageLoop::current()
            .expect("current")
            .resume_from_exception(exception.thread, ResumeOptions::default());

        // Nothing more to observe from a sleeping target; tear it down.
        let process = self.flow.process.borrow().clone().expect("process");
        process.kill();
    }

    fn on_process_terminated(&self, _process: Koid)
    {
        self.flow.events.borrow_mut().push("terminated");
        // Drop the watch before quitting so cleanup sees no outstanding
        // registrations.
        self.flow.watch.borrow_mut().take();
        MessageLoop::current().expect("current").quit_now();
    }
}

fn run_attach_flow(flow: &Rc<Flow>, name: &str, program: &str, args: &[&str]) -> Process
{
    let message_loop = MessageLoop::new().expect("loop");
    message_loop.init().expect("init");

    let job = Job::new("attach-job");
    let watcher = Rc::new(LifecycleWatcher { flow: Rc::clone(flow) });
    let handler = Rc::new(Attacher {
        flow: Rc::clone(flow),
        watcher,
    });
    let debugged = Rc::new(DebuggedJob::new(
        message_loop.clone(),
        job.clone(),
        handler as Rc<dyn ProcessStartHandler>,
    ));
    debugged.init().expect("init debugged job");
    debugged.set_filters(vec![name.to_string()]);

    let process = job.spawn(name, program, args).expect("spawn");
    message_loop.run();

    drop(debugged);
    message_loop.cleanup();
    process
}

#[test]
fn test_full_attach_flow_event_order()
{
    init_test_logging();

    let flow = Flow::new(false);
    let process = run_attach_flow(&flow, "true", "true", &[]);

    assert_eq!(flow.events(), vec!["thread-starting", "thread-exiting", "terminated"]);
    assert_eq!(process.wait_exit(Duration::from_secs(5)).expect("exit"), 0);
}

#[test]
fn test_synthetic_exception_then_kill()
{
    init_test_logging();

    let flow = Flow::new(true);
    // A target that outlives the fault injection; the watcher kills it
    // after acknowledging the breakpoint.
    let process = run_attach_flow(&flow, "sleep-target", "sleep", &["30"]);

    assert_eq!(
        flow.events(),
        vec!["thread-starting", "exception", "thread-exiting", "terminated"]
    );
    // Killed by signal: no exit code to report.
    assert_eq!(process.wait_exit(Duration::from_secs(5)).expect("exit"), -1);
}

#[test]
fn test_raise_exception_requires_running_target()
{
    init_test_logging();

    let job = Job::new("attach-job");
    let process = job.spawn("held", "true", &[]).expect("spawn");
    // Without a bound channel the process launched immediately, but a
    // lifecycle subtype is never raisable.
    let err = process
        .raise_exception(ExceptionType::ThreadStarting)
        .expect_err("lifecycle raise must fail");
    assert!(matches!(err, CoreError::InvalidArgument(_)));

    let _ = process.wait_exit(Duration::from_secs(5));
}

#[test]
fn test_second_process_watch_is_rejected()
{
    init_test_logging();

    struct NopWatcher;

    impl ProcessExceptionWatcher for NopWatcher
    {
        fn on_thread_starting(&self, _exception: ExceptionInfo) {}

        fn on_thread_exiting(&self, _exception: ExceptionInfo) {}

        fn on_exception(&self, _exception: ExceptionInfo) {}

        fn on_process_terminated(&self, _process: Koid) {}
    }

    let message_loop = MessageLoop::new().expect("loop");
    message_loop.init().expect("init");

    let job = Job::new("attach-job");
    let process = job.spawn("target", "sleep", &["30"]).expect("spawn");

    let first = message_loop
        .watch_process_exceptions(&process, Rc::new(NopWatcher) as Rc<dyn ProcessExceptionWatcher>)
        .expect("first watch");
    let err = message_loop
        .watch_process_exceptions(&process, Rc::new(NopWatcher) as Rc<dyn ProcessExceptionWatcher>)
        .expect_err("second watch must fail");
    assert!(matches!(err, CoreError::AlreadyBound(_)));

    process.kill();
    let _ = process.wait_exit(Duration::from_secs(5));
    first.stop();
    message_loop.cleanup();
}
