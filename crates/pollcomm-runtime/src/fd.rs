//! Raw descriptor helpers
//!
//! Thin wrappers over the few syscalls std does not expose: eventfd,
//! pipe2 and single-descriptor poll. Everything returns owned
//! descriptors so closing is tied to `Drop`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::error::{CommError, CommResult};

/// Non-blocking `read(2)` on a raw descriptor.
#[inline]
pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let r = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(r as usize)
}

/// Non-blocking `write(2)` on a raw descriptor.
#[inline]
pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let r = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(r as usize)
}

/// Toggle `O_NONBLOCK` on a descriptor.
pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> CommResult<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(CommError::os("fcntl(F_GETFL)"));
    }
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(CommError::os("fcntl(F_SETFL)"));
    }
    Ok(())
}

/// Create a close-on-exec pipe; the read end is non-blocking.
pub(crate) fn pipe() -> CommResult<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(CommError::os("pipe2"));
    }
    // Safety: pipe2 succeeded, both descriptors are ours
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_nonblocking(read.as_raw_fd(), true)?;
    Ok((read, write))
}

/// Readiness of a single descriptor after [`poll_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PollOutcome {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
    pub invalid: bool,
}

/// Wait on one descriptor. `None` waits forever.
///
/// Returns `Ok(None)` on timeout. `EINTR` is retried.
pub(crate) fn poll_one(fd: RawFd, events: libc::c_short, timeout: Option<Duration>) -> CommResult<Option<PollOutcome>> {
    let timeout_ms = match timeout {
        None => -1,
        Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
    };
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    loop {
        let r = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if r < 0 {
            let err = CommError::os("poll");
            if matches!(err, CommError::Os { errno: nix::errno::Errno::EINTR, .. }) {
                continue;
            }
            return Err(err);
        }
        if r == 0 {
            return Ok(None);
        }
        let rev = pfd.revents;
        return Ok(Some(PollOutcome {
            readable: rev & (libc::POLLIN | libc::POLLPRI) != 0,
            writable: rev & libc::POLLOUT != 0,
            error: rev & libc::POLLERR != 0,
            hangup: rev & (libc::POLLHUP | libc::POLLRDHUP) != 0,
            invalid: rev & libc::POLLNVAL != 0,
        }));
    }
}

/// An eventfd counter.
///
/// In semaphore mode every read decrements the counter by one, which is
/// what the inter-thread queues rely on: one unit per queued message.
#[derive(Debug)]
pub(crate) struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// Create a new non-blocking, close-on-exec eventfd.
    pub fn create(semaphore: bool) -> CommResult<Self> {
        let mut flags = libc::EFD_NONBLOCK | libc::EFD_CLOEXEC;
        if semaphore {
            flags |= libc::EFD_SEMAPHORE;
        }
        let fd = unsafe { libc::eventfd(0, flags) };
        if fd < 0 {
            return Err(CommError::os("eventfd"));
        }
        // Safety: eventfd returned a fresh descriptor
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Add `n` to the counter.
    pub fn notify(&self, n: u64) -> CommResult<()> {
        let r = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &n as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if r < 0 {
            return Err(CommError::os("eventfd write"));
        }
        Ok(())
    }

    /// Read the counter (one unit in semaphore mode).
    ///
    /// `Ok(None)` when the counter is zero.
    pub fn take(&self) -> CommResult<Option<u64>> {
        let mut value: u64 = 0;
        let r = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if r < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(CommError::os("eventfd read"));
        }
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventfd_semaphore() {
        let ev = EventFd::create(true).unwrap();
        assert_eq!(ev.take().unwrap(), None);
        ev.notify(1).unwrap();
        ev.notify(1).unwrap();
        assert_eq!(ev.take().unwrap(), Some(1));
        assert_eq!(ev.take().unwrap(), Some(1));
        assert_eq!(ev.take().unwrap(), None);
    }

    #[test]
    fn test_eventfd_counter() {
        let ev = EventFd::create(false).unwrap();
        ev.notify(3).unwrap();
        ev.notify(4).unwrap();
        assert_eq!(ev.take().unwrap(), Some(7));
    }

    #[test]
    fn test_pipe_and_poll() {
        let (r, w) = pipe().unwrap();
        let out = poll_one(r.as_raw_fd(), libc::POLLIN, Some(Duration::from_millis(1))).unwrap();
        assert!(out.is_none());

        assert_eq!(write_fd(w.as_raw_fd(), b"x").unwrap(), 1);
        let out = poll_one(r.as_raw_fd(), libc::POLLIN, Some(Duration::from_millis(100)))
            .unwrap()
            .unwrap();
        assert!(out.readable);

        let mut buf = [0u8; 4];
        assert_eq!(read_fd(r.as_raw_fd(), &mut buf).unwrap(), 1);
        let again = read_fd(r.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(again.kind(), io::ErrorKind::WouldBlock);
    }
}
