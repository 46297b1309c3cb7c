//! The level-triggered epoll readiness multiplexer.
//!
//! This deliberately never sets `EPOLLET`. The reactor's connection and
//! channel state machines are written against level-triggered semantics
//! (for example, writable interest is disabled as soon as the output
//! buffer drains, rather than relying on edge-triggered re-arming), and
//! turning edge-triggered mode on here would silently reintroduce a busy
//! spin on every writable descriptor with nothing left to write.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::interest::{Interest, Revents};
use crate::poller::events::Events;

/// Tracks whether the kernel currently knows about a descriptor, mirroring
/// the three-state bookkeeping the event loop keeps per channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegistrationState {
    New,
    Added,
    Deleted,
}

pub struct Selector {
    epoll_fd: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // SAFETY: epoll_create1 just returned a freshly owned fd.
        let epoll_fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Selector { epoll_fd })
    }

    pub fn register(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token,
        };
        syscall!(epoll_ctl(
            self.epoll_fd.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event
        ))?;
        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token,
        };
        syscall!(epoll_ctl(
            self.epoll_fd.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            fd,
            &mut event
        ))?;
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // The event argument is ignored for EPOLL_CTL_DEL on modern kernels,
        // but older kernels (pre-2.6.9) require a non-null pointer.
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(
            self.epoll_fd.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            &mut event
        ))?;
        Ok(())
    }

    /// Blocks for up to `timeout`, filling `events` with ready descriptors.
    /// A `None` timeout blocks indefinitely. Returns the number of ready
    /// events, which may be 0 on a timeout or on `EINTR`.
    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            Some(duration) => duration.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };

        events.clear();
        let n = loop {
            match syscall!(epoll_wait(
                self.epoll_fd.as_raw_fd(),
                events.as_mut_ptr(),
                events.capacity() as i32,
                timeout_ms
            )) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    log::trace!("epoll_wait interrupted, retrying");
                    return Ok(0);
                }
                Err(e) => return Err(e),
            }
        };
        // SAFETY: epoll_wait just initialized the first `n` elements.
        unsafe { events.set_len(n as usize) };
        Ok(n as usize)
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut bits = 0u32;
    if interest.is_readable() {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    if interest.is_priority() {
        bits |= libc::EPOLLPRI as u32;
    }
    bits
}

pub fn revents_from_epoll(raw: u32) -> Revents {
    Revents::from_raw(
        raw & (libc::EPOLLIN as u32) != 0,
        raw & (libc::EPOLLOUT as u32) != 0,
        raw & (libc::EPOLLPRI as u32) != 0,
        raw & (libc::EPOLLHUP as u32) != 0,
        raw & (libc::EPOLLERR as u32) != 0,
    )
}
