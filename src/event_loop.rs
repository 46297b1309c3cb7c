//! The per-thread reactor: one multiplexer, one channel set, one deferred
//! task queue, one thread for its entire life.

use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::poller::{revents_from_epoll, Events, RegistrationState, Selector, Waker};

/// 10 seconds, matching the source library's poll timeout: long enough that
/// an idle loop doesn't spin, short enough that a stuck `quit()` delivery
/// (a bug we don't expect, but the timeout exists precisely so it can never
/// wedge forever) is still bounded.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT_LOOP: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

struct Inner {
    thread_id: ThreadId,
    selector: Selector,
    waker: Waker,
    channels: Mutex<HashMap<RawFd, std::sync::Weak<Channel>>>,
    pending_tasks: Mutex<Vec<Task>>,
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending_tasks: AtomicBool,
}

/// A cheap, cloneable handle to a reactor loop. Every clone refers to the
/// same loop; cloning is how a `Channel` or `Connection` keeps a way to
/// post work back to its owning thread without owning the loop itself.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

impl EventLoop {
    /// Constructs a new loop bound to the calling thread. Fails if this
    /// thread already hosts a loop, or if the multiplexer or wake-up
    /// descriptor cannot be created.
    pub fn new() -> io::Result<EventLoop> {
        let thread_id = std::thread::current().id();
        let already = CURRENT_LOOP.with(|cell| cell.get());
        if already.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "another EventLoop already exists on this thread",
            ));
        }

        let selector = Selector::new()?;
        let waker = Waker::new()?;
        selector.register(waker.as_raw_fd(), WAKER_TOKEN, crate::interest::Interest::READABLE)?;

        CURRENT_LOOP.with(|cell| cell.set(Some(thread_id)));
        log::debug!("EventLoop created on thread {:?}", thread_id);

        Ok(EventLoop {
            inner: Arc::new(Inner {
                thread_id,
                selector,
                waker,
                channels: Mutex::new(HashMap::new()),
                pending_tasks: Mutex::new(Vec::new()),
                looping: AtomicBool::new(false),
                quit: AtomicBool::new(false),
                calling_pending_tasks: AtomicBool::new(false),
            }),
        })
    }

    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.inner.thread_id
    }

    fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "operation must run on the owning EventLoop's thread"
        );
    }

    /// Runs the dispatch cycle until `quit()` takes effect. Must be called
    /// from the thread that constructed this loop.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        self.inner.looping.store(true, Ordering::SeqCst);
        self.inner.quit.store(false, Ordering::SeqCst);
        log::debug!("EventLoop {:?} start looping", self.inner.thread_id);

        let mut events = Events::default();
        while !self.inner.quit.load(Ordering::SeqCst) {
            let n = match self.inner.selector.select(&mut events, Some(POLL_TIMEOUT)) {
                Ok(n) => n,
                Err(e) => {
                    log::error!("epoll_wait failed: {e}");
                    0
                }
            };
            if events.was_full() {
                events.grow();
            }
            let receive_time = Instant::now();

            let channels = self.inner.channels.lock();
            let mut ready: Vec<Arc<Channel>> = Vec::with_capacity(n);
            for raw_event in events.iter() {
                if raw_event.u64 == WAKER_TOKEN {
                    let _ = self.inner.waker.reset();
                    continue;
                }
                let fd = raw_event.u64 as i32 as RawFd;
                if let Some(channel) = channels.get(&fd).and_then(std::sync::Weak::upgrade) {
                    channel.set_revents(revents_from_epoll(raw_event.events));
                    ready.push(channel);
                }
            }
            drop(channels);

            for channel in ready {
                channel.handle_event(receive_time);
            }

            self.run_pending_tasks();
        }

        self.inner.looping.store(false, Ordering::SeqCst);
        log::debug!("EventLoop {:?} stop looping", self.inner.thread_id);
    }

    fn run_pending_tasks(&self) {
        self.inner.calling_pending_tasks.store(true, Ordering::SeqCst);
        let tasks = std::mem::take(&mut *self.inner.pending_tasks.lock());
        for task in tasks {
            task();
        }
        self.inner.calling_pending_tasks.store(false, Ordering::SeqCst);
    }

    /// Runs `task` now if called from the owning thread, otherwise defers
    /// it via [`EventLoop::queue_in_loop`].
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the deferred queue. Wakes the loop if the caller
    /// is on a different thread, or if the loop is currently in the middle
    /// of running a previous batch of pending tasks (so a task queued by
    /// another task in this same batch is not left waiting for the next
    /// full `poll` timeout).
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.pending_tasks.lock().push(Box::new(task));
        if !self.is_in_loop_thread() || self.inner.calling_pending_tasks.load(Ordering::SeqCst) {
            if let Err(e) = self.inner.waker.wake() {
                log::error!("failed to wake EventLoop: {e}");
            }
        }
    }

    /// Requests termination. Takes effect at the top of the next dispatch
    /// iteration; if called from another thread, also wakes the loop so it
    /// does not wait out the full poll timeout first.
    pub fn quit(&self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            let _ = self.inner.waker.wake();
        }
    }

    pub(crate) fn new_channel(&self, fd: RawFd) -> Arc<Channel> {
        Channel::new(self.clone(), fd)
    }

    pub(crate) fn update_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        let fd = channel.fd();
        let state = channel.registration_state();
        match state {
            RegistrationState::New => {
                match self.inner.selector.register(fd, fd as u64, channel.interest()) {
                    Ok(()) => channel.set_registration_state(RegistrationState::Added),
                    Err(e) => log::error!("epoll_ctl(ADD) failed for fd {fd}: {e}"),
                }
            }
            RegistrationState::Added => {
                if channel.interest().is_empty() {
                    match self.inner.selector.deregister(fd) {
                        Ok(()) => channel.set_registration_state(RegistrationState::Deleted),
                        Err(e) => log::error!("epoll_ctl(DEL) failed for fd {fd}: {e}"),
                    }
                } else if let Err(e) = self.inner.selector.reregister(fd, fd as u64, channel.interest()) {
                    log::error!("epoll_ctl(MOD) failed for fd {fd}: {e}");
                }
            }
            RegistrationState::Deleted => {
                match self.inner.selector.register(fd, fd as u64, channel.interest()) {
                    Ok(()) => channel.set_registration_state(RegistrationState::Added),
                    Err(e) => log::error!("epoll_ctl(ADD) failed for fd {fd}: {e}"),
                }
            }
        }
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        let fd = channel.fd();
        self.inner.channels.lock().remove(&fd);

        // Comparing, not assigning: only ask the selector to forget a
        // descriptor it was actually told to track. A channel that was
        // enabled then immediately disabled back to `New`, or one that
        // failed registration, was never added to begin with.
        if channel.registration_state() == RegistrationState::Added {
            if let Err(e) = self.inner.selector.deregister(fd) {
                log::error!("epoll_ctl(DEL) failed for fd {fd}: {e}");
            }
        }
        channel.set_registration_state(RegistrationState::New);
    }

    pub(crate) fn track_channel(&self, channel: &Arc<Channel>) {
        self.inner
            .channels
            .lock()
            .insert(channel.fd(), Arc::downgrade(channel));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|cell| cell.set(None));
    }
}

const WAKER_TOKEN: u64 = u64::MAX;
