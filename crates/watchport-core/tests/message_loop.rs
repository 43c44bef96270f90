//! Integration tests for the dispatch loop: task ordering, descriptor and
//! socket readiness, and loop lifecycle.

use std::cell::{Cell, RefCell};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use watchport_core::prelude::*;

fn init_test_logging()
{
    let _ = watchport_utils::init_logging();
}

/// A raw pipe owned by a test. `sys`-level plumbing is private to the
/// crate, so tests build their own.
struct TestPipe
{
    read_fd: RawFd,
    write_fd: RawFd,
}

impl TestPipe
{
    fn new() -> TestPipe
    {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe(2) failed");
        TestPipe {
            read_fd: fds[0],
            write_fd: fds[1],
        }
    }

    fn write(&self, bytes: &[u8])
    {
        let n = unsafe { libc::write(self.write_fd, bytes.as_ptr().cast(), bytes.len()) };
        assert_eq!(n, bytes.len() as isize);
    }

    fn close_read(&self)
    {
        unsafe {
            libc::close(self.read_fd);
        }
    }

    fn close_write(&self)
    {
        unsafe {
            libc::close(self.write_fd);
        }
    }
}

impl Drop for TestPipe
{
    fn drop(&mut self)
    {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[test]
fn test_posted_tasks_run_in_fifo_order()
{
    init_test_logging();

    let message_loop = MessageLoop::new().expect("loop");
    message_loop.init().expect("init");

    let order = Arc::new(Mutex::new(Vec::new()));

    let first = Arc::clone(&order);
    message_loop.post_task(move || first.lock().unwrap().push(1));

    // The second task enqueues a fourth; it must run after the already
    // queued third, not immediately.
    let second = Arc::clone(&order);
    message_loop.post_task(move || {
        second.lock().unwrap().push(2);
        let nested = Arc::clone(&second);
        MessageLoop::current().expect("current").post_task(move || {
            nested.lock().unwrap().push(4);
            MessageLoop::current().expect("current").quit_now();
        });
    });

    let third = Arc::clone(&order);
    message_loop.post_task(move || third.lock().unwrap().push(3));

    message_loop.run();
    message_loop.cleanup();

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn test_fd_watch_reports_readable()
{
    init_test_logging();

    struct ReadWatcher
    {
        hits: Cell<u32>,
    }

    impl FdWatcher for ReadWatcher
    {
        fn on_fd_ready(&self, _fd: RawFd, readable: bool, writable: bool, errored: bool)
        {
            assert!(readable);
            assert!(!writable);
            assert!(!errored);
            self.hits.set(self.hits.get() + 1);
            MessageLoop::current().expect("current").quit_now();
        }
    }

    let message_loop = MessageLoop::new().expect("loop");
    message_loop.init().expect("init");

    let pipe = TestPipe::new();
    let watcher = Rc::new(ReadWatcher { hits: Cell::new(0) });
    let handle = message_loop
        .watch_fd(WatchMode::Read, pipe.read_fd, Rc::clone(&watcher) as Rc<dyn FdWatcher>)
        .expect("watch");

    // The write happens from inside the loop, so the data is guaranteed
    // to be pending when poll runs.
    let write_fd = pipe.write_fd;
    message_loop.post_task(move || {
        let bytes = [0u8; 5];
        let n = unsafe { libc::write(write_fd, bytes.as_ptr().cast(), bytes.len()) };
        assert_eq!(n, 5);
    });

    message_loop.run();

    assert_eq!(watcher.hits.get(), 1);
    handle.stop();
    message_loop.cleanup();
}

#[test]
fn test_fd_watch_reports_error_alone()
{
    init_test_logging();

    struct ErrorWatcher
    {
        errors: Cell<u32>,
    }

    impl FdWatcher for ErrorWatcher
    {
        fn on_fd_ready(&self, _fd: RawFd, readable: bool, writable: bool, errored: bool)
        {
            // An errored descriptor reports only the error, even when the
            // kernel also flags it writable.
            assert!(errored);
            assert!(!readable);
            assert!(!writable);
            self.errors.set(self.errors.get() + 1);
            MessageLoop::current().expect("current").quit_now();
        }
    }

    let message_loop = MessageLoop::new().expect("loop");
    message_loop.init().expect("init");

    let pipe = TestPipe::new();
    pipe.close_read();

    let watcher = Rc::new(ErrorWatcher { errors: Cell::new(0) });
    let handle = message_loop
        .watch_fd(WatchMode::Write, pipe.write_fd, Rc::clone(&watcher) as Rc<dyn FdWatcher>)
        .expect("watch");

    message_loop.run();

    assert_eq!(watcher.errors.get(), 1);
    handle.stop();
    // read_fd was closed above; forget the pipe so drop does not close it
    // twice.
    let write_fd = pipe.write_fd;
    std::mem::forget(pipe);
    unsafe {
        libc::close(write_fd);
    }
    message_loop.cleanup();
}

#[test]
fn test_fd_hangup_outside_watch_mode_reports_error()
{
    init_test_logging();

    struct HangupWatcher
    {
        errors: Cell<u32>,
    }

    impl FdWatcher for HangupWatcher
    {
        fn on_fd_ready(&self, _fd: RawFd, readable: bool, writable: bool, errored: bool)
        {
            // A write-only watch cannot see the hangup as readable EOF, so
            // it must arrive as an error rather than no callback at all.
            assert!(errored);
            assert!(!readable);
            assert!(!writable);
            self.errors.set(self.errors.get() + 1);
            MessageLoop::current().expect("current").quit_now();
        }
    }

    let message_loop = MessageLoop::new().expect("loop");
    message_loop.init().expect("init");

    let pipe = TestPipe::new();
    pipe.close_write();

    let watcher = Rc::new(HangupWatcher { errors: Cell::new(0) });
    let handle = message_loop
        .watch_fd(WatchMode::Write, pipe.read_fd, Rc::clone(&watcher) as Rc<dyn FdWatcher>)
        .expect("watch");

    message_loop.run();

    assert_eq!(watcher.errors.get(), 1);
    handle.stop();
    // write_fd was closed above; forget the pipe so drop does not close it
    // twice.
    let read_fd = pipe.read_fd;
    std::mem::forget(pipe);
    unsafe {
        libc::close(read_fd);
    }
    message_loop.cleanup();
}

#[test]
fn test_socket_peer_close_reports_error_only()
{
    init_test_logging();

    struct PeerWatcher
    {
        readable: Cell<u32>,
        writable: Cell<u32>,
        errors: Cell<u32>,
    }

    impl SocketWatcher for PeerWatcher
    {
        fn on_socket_readable(&self, _fd: RawFd)
        {
            self.readable.set(self.readable.get() + 1);
        }

        fn on_socket_writable(&self, _fd: RawFd)
        {
            self.writable.set(self.writable.get() + 1);
        }

        fn on_socket_error(&self, _fd: RawFd)
        {
            self.errors.set(self.errors.get() + 1);
            MessageLoop::current().expect("current").quit_now();
        }
    }

    let message_loop = MessageLoop::new().expect("loop");
    message_loop.init().expect("init");

    let (local, peer) = UnixStream::pair().expect("socketpair");
    drop(peer);

    let watcher = Rc::new(PeerWatcher {
        readable: Cell::new(0),
        writable: Cell::new(0),
        errors: Cell::new(0),
    });
    let handle = message_loop
        .watch_socket(
            WatchMode::ReadWrite,
            local.as_raw_fd(),
            Rc::clone(&watcher) as Rc<dyn SocketWatcher>,
        )
        .expect("watch");

    message_loop.run();

    // Peer-closed suppresses the read/write callbacks entirely.
    assert_eq!(watcher.errors.get(), 1);
    assert_eq!(watcher.readable.get(), 0);
    assert_eq!(watcher.writable.get(), 0);
    handle.stop();
    message_loop.cleanup();
}

#[test]
fn test_socket_write_skipped_after_read_deregisters()
{
    init_test_logging();

    struct SelfStoppingWatcher
    {
        handle: RefCell<Option<WatchHandle>>,
        readable: Cell<u32>,
        writable: Cell<u32>,
    }

    impl SocketWatcher for SelfStoppingWatcher
    {
        fn on_socket_readable(&self, _fd: RawFd)
        {
            self.readable.set(self.readable.get() + 1);
            // Deregister mid-wake: the write half of this same wake must
            // not be delivered.
            if let Some(handle) = self.handle.borrow_mut().take() {
                handle.stop();
            }
            MessageLoop::current().expect("current").quit_now();
        }

        fn on_socket_writable(&self, _fd: RawFd)
        {
            self.writable.set(self.writable.get() + 1);
        }
    }

    let message_loop = MessageLoop::new().expect("loop");
    message_loop.init().expect("init");

    let (local, peer) = UnixStream::pair().expect("socketpair");
    use std::io::Write;
    (&peer).write_all(b"x").expect("peer write");

    let watcher = Rc::new(SelfStoppingWatcher {
        handle: RefCell::new(None),
        readable: Cell::new(0),
        writable: Cell::new(0),
    });
    let handle = message_loop
        .watch_socket(
            WatchMode::ReadWrite,
            local.as_raw_fd(),
            Rc::clone(&watcher) as Rc<dyn SocketWatcher>,
        )
        .expect("watch");
    *watcher.handle.borrow_mut() = Some(handle);

    message_loop.run();

    assert_eq!(watcher.readable.get(), 1);
    assert_eq!(watcher.writable.get(), 0);
    drop(peer);
    message_loop.cleanup();
}

#[test]
fn test_one_current_loop_per_thread()
{
    init_test_logging();

    let first = MessageLoop::new().expect("loop");
    first.init().expect("init");

    let second = MessageLoop::new().expect("loop");
    let err = second.init().expect_err("second init must fail");
    assert!(matches!(err, CoreError::LoopAlreadyCurrent));

    first.cleanup();

    // With the thread released, a fresh claim succeeds.
    second.init().expect("init after cleanup");
    second.cleanup();
}

#[test]
fn test_run_until_timeout_elapses()
{
    init_test_logging();

    let message_loop = MessageLoop::new().expect("loop");
    message_loop.init().expect("init");

    let start = Instant::now();
    message_loop.run_until_timeout(Duration::from_millis(100));
    assert!(start.elapsed() >= Duration::from_millis(100));

    message_loop.cleanup();
}

#[test]
fn test_watch_rejects_closed_descriptor()
{
    init_test_logging();

    struct NopWatcher;

    impl FdWatcher for NopWatcher
    {
        fn on_fd_ready(&self, _fd: RawFd, _readable: bool, _writable: bool, _errored: bool) {}
    }

    let message_loop = MessageLoop::new().expect("loop");
    message_loop.init().expect("init");

    let err = message_loop
        .watch_fd(WatchMode::Read, -1, Rc::new(NopWatcher) as Rc<dyn FdWatcher>)
        .expect_err("invalid fd must be rejected");
    assert!(matches!(err, CoreError::InvalidDescriptor(-1)));

    message_loop.cleanup();
}

#[test]
fn test_task_poster_works_from_another_thread()
{
    init_test_logging();

    let message_loop = MessageLoop::new().expect("loop");
    message_loop.init().expect("init");

    let poster = message_loop.task_poster();
    let posted = std::thread::spawn(move || {
        poster.post(|| {
            MessageLoop::current().expect("current").quit_now();
        })
    })
    .join()
    .expect("poster thread");
    assert!(posted);

    message_loop.run();
    message_loop.cleanup();
}
