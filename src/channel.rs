//! A `Channel` binds one file descriptor to its interest mask and its four
//! event callbacks. It never owns the descriptor's lifetime (whoever holds
//! the `Channel` also holds whatever owns the fd) and it never closes the
//! descriptor itself.

use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::event_loop::EventLoop;
use crate::interest::{Interest, Revents};
use crate::poller::RegistrationState;

type ReadCallback = Box<dyn Fn(Instant) + Send + Sync>;
type EventCallback = Box<dyn Fn() + Send + Sync>;

struct Callbacks {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

impl Default for Callbacks {
    fn default() -> Callbacks {
        Callbacks {
            read: None,
            write: None,
            close: None,
            error: None,
        }
    }
}

struct State {
    interest: Interest,
    revents: Revents,
    registration: RegistrationState,
}

/// Binds a descriptor to its owning loop, its interest mask, and its
/// callbacks. Shared between the owning object (strong) and the loop's
/// dispatch table (weak).
pub struct Channel {
    fd: RawFd,
    event_loop: EventLoop,
    state: Mutex<State>,
    callbacks: Mutex<Callbacks>,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Channel {
    pub(crate) fn new(event_loop: EventLoop, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            fd,
            event_loop,
            state: Mutex::new(State {
                interest: Interest::NONE,
                revents: Revents::EMPTY,
                registration: RegistrationState::New,
            }),
            callbacks: Mutex::new(Callbacks::default()),
            tie: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn set_read_callback<F>(&self, cb: F)
    where
        F: Fn(Instant) + Send + Sync + 'static,
    {
        self.callbacks.lock().read = Some(Box::new(cb));
    }

    pub fn set_write_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.lock().write = Some(Box::new(cb));
    }

    pub fn set_close_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.lock().close = Some(Box::new(cb));
    }

    pub fn set_error_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.lock().error = Some(Box::new(cb));
    }

    /// Ties this channel's lifetime guard to `owner`. During `handle_event`
    /// the weak reference is promoted and kept alive on the stack across
    /// every callback invoked in that dispatch, so `owner` cannot be
    /// destroyed mid-callback even if every other strong reference to it
    /// disappears concurrently.
    pub fn tie<T: Any + Send + Sync + 'static>(&self, owner: &Arc<T>) {
        *self.tie.lock() = Some(Arc::downgrade(owner) as Weak<dyn Any + Send + Sync>);
    }

    pub(crate) fn set_revents(&self, revents: Revents) {
        self.state.lock().revents = revents;
    }

    pub(crate) fn registration_state(&self) -> RegistrationState {
        self.state.lock().registration
    }

    pub(crate) fn set_registration_state(&self, registration: RegistrationState) {
        self.state.lock().registration = registration;
    }

    pub fn interest(&self) -> Interest {
        self.state.lock().interest
    }

    pub fn is_reading(&self) -> bool {
        self.interest().is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest().is_writable()
    }

    pub fn enable_reading(&self) {
        self.modify_interest(|i| i.add(Interest::READABLE));
    }

    pub fn disable_reading(&self) {
        self.modify_interest(|i| i.remove(Interest::READABLE));
    }

    pub fn enable_writing(&self) {
        self.modify_interest(|i| i.add(Interest::WRITABLE));
    }

    pub fn disable_writing(&self) {
        self.modify_interest(|i| i.remove(Interest::WRITABLE));
    }

    pub fn disable_all(&self) {
        self.modify_interest(|_| Interest::NONE);
    }

    fn modify_interest(&self, f: impl FnOnce(Interest) -> Interest) {
        {
            let mut state = self.state.lock();
            state.interest = f(state.interest);
        }
        self.event_loop.update_channel(self);
    }

    /// Permanently removes this channel from its loop's multiplexer.
    /// Called once, on the owning loop's thread, when the channel's owner
    /// is being torn down.
    pub fn remove(&self) {
        self.event_loop.remove_channel(self);
    }

    /// Dispatches one readiness notification. Invoked only from the owning
    /// loop's thread, during `EventLoop::run`.
    pub(crate) fn handle_event(&self, receive_time: Instant) {
        let tie = self.tie.lock().clone();
        let guard = match tie {
            Some(weak) => match weak.upgrade() {
                Some(strong) => Some(strong),
                // The tie was set but no longer promotes: the owner is gone.
                None => return,
            },
            None => None,
        };
        let revents = self.state.lock().revents;
        let callbacks = self.callbacks.lock();

        if revents.is_readable() {
            if let Some(cb) = &callbacks.read {
                cb(receive_time);
            }
        }
        if revents.is_writable() {
            if let Some(cb) = &callbacks.write {
                cb();
            }
        }
        if revents.is_hup() && !revents.is_readable() {
            if let Some(cb) = &callbacks.close {
                cb();
            }
        }
        if revents.is_error() {
            if let Some(cb) = &callbacks.error {
                cb();
            }
        }
        // `guard` is dropped here, at the very end of dispatch, keeping the
        // tied owner alive across every callback above.
        drop(guard);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &state.interest)
            .field("registration", &state.registration)
            .finish()
    }
}
