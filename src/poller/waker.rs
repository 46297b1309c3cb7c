//! Cross-thread wake-up for a blocked `epoll_wait`, backed by a Linux
//! event-counter descriptor (`eventfd`).

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: eventfd just returned a freshly owned fd.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Waker { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Makes the waker's descriptor readable. Safe to call from any thread,
    /// any number of times; the kernel collapses concurrent increments into
    /// the counter's 64-bit sum.
    pub fn wake(&self) -> io::Result<()> {
        let buf: u64 = 1;
        match syscall!(write(
            self.fd.as_raw_fd(),
            &buf as *const u64 as *const libc::c_void,
            8
        )) {
            Ok(_) => Ok(()),
            // The counter is already saturated; another wake is already
            // pending, which is all we need.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drains the counter back to zero after a wake-up. Must be called from
    /// the loop thread once the waker's channel reports readable.
    pub fn reset(&self) -> io::Result<()> {
        let mut buf: u64 = 0;
        match syscall!(read(
            self.fd.as_raw_fd(),
            &mut buf as *mut u64 as *mut libc::c_void,
            8
        )) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}
