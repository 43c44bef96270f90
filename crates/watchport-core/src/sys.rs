//! Raw poll/pipe plumbing.
//!
//! This is the only module that talks to `libc` directly. It wraps the two
//! primitives the message loop is built on: a non-blocking self-pipe used
//! as the wake signal, and `poll(2)` as the blocking wait call. Everything
//! above this module is safe code.

use std::io;
use std::os::unix::io::RawFd;

/// A non-blocking pipe used as a wake/notify signal.
///
/// Writing one byte wakes any `poll` that includes the read end; draining
/// the read end re-arms it. Both ends are close-on-exec so spawned target
/// processes do not inherit them.
#[derive(Debug)]
pub(crate) struct Pipe
{
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Pipe
{
    pub(crate) fn new() -> io::Result<Pipe>
    {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds is a valid 2-element array for pipe(2) to fill.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let pipe = Pipe {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        for fd in [pipe.read_fd, pipe.write_fd] {
            set_nonblocking(fd)?;
            set_cloexec(fd)?;
        }
        Ok(pipe)
    }

    pub(crate) fn read_fd(&self) -> RawFd
    {
        self.read_fd
    }

    /// Write one byte to the pipe. A full pipe already wakes the reader,
    /// so `EAGAIN` is ignored.
    pub(crate) fn notify(&self)
    {
        let byte = [1u8];
        // SAFETY: write_fd is owned by self and open until drop.
        let _ = unsafe { libc::write(self.write_fd, byte.as_ptr().cast(), 1) };
    }

    /// Drain all queued bytes from the read end.
    pub(crate) fn drain(&self)
    {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: read_fd is owned by self; buf is a valid buffer.
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Pipe
{
    fn drop(&mut self)
    {
        // SAFETY: both fds were created by pipe(2) and are closed exactly once.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// Decoded `revents` bits from one pollfd.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Readiness
{
    pub readable: bool,
    pub writable: bool,
    pub errored: bool,
    pub hangup: bool,
}

impl Readiness
{
    pub(crate) fn from_revents(revents: libc::c_short) -> Readiness
    {
        Readiness {
            readable: revents & libc::POLLIN != 0,
            writable: revents & libc::POLLOUT != 0,
            errored: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
            hangup: revents & libc::POLLHUP != 0,
        }
    }

    pub(crate) fn any(self) -> bool
    {
        self.readable || self.writable || self.errored || self.hangup
    }
}

/// Blocking wait on a set of descriptors.
///
/// `timeout_ms` of -1 blocks indefinitely. Interruption by a signal is
/// reported as zero ready descriptors; the loop re-evaluates and polls
/// again, which is the behavior we want for a dispatch loop.
pub(crate) fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize>
{
    // SAFETY: fds points to a valid slice of pollfd for the given length.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(rc as usize)
}

/// Send SIGKILL to a process, best effort.
pub(crate) fn kill_process(pid: i32)
{
    // SAFETY: kill(2) with a stale pid fails with ESRCH, which is fine.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

/// Whether `fd` refers to an open descriptor.
pub(crate) fn is_valid_fd(fd: RawFd) -> bool
{
    // SAFETY: F_GETFD is side-effect free for any integer argument.
    unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()>
{
    // SAFETY: fd is a live descriptor owned by the caller.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> io::Result<()>
{
    // SAFETY: fd is a live descriptor owned by the caller.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_pipe_notify_and_drain()
    {
        let pipe = Pipe::new().expect("pipe");
        pipe.notify();
        pipe.notify();

        let mut fds = [libc::pollfd {
            fd: pipe.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let ready = poll(&mut fds, 0).expect("poll");
        assert_eq!(ready, 1);
        assert!(Readiness::from_revents(fds[0].revents).readable);

        pipe.drain();
        fds[0].revents = 0;
        let ready = poll(&mut fds, 0).expect("poll");
        assert_eq!(ready, 0);
    }

    #[test]
    fn test_invalid_fd_detection()
    {
        let pipe = Pipe::new().expect("pipe");
        assert!(is_valid_fd(pipe.read_fd()));
        assert!(!is_valid_fd(-1));
    }
}
