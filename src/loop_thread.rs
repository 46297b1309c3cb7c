//! Spins up a single OS thread that hosts exactly one `EventLoop` for its
//! entire lifetime, handing the loop back to the constructing thread once
//! it's ready to accept registrations.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::event_loop::EventLoop;

type InitCallback = Box<dyn FnOnce(&EventLoop) + Send + 'static>;

struct Shared {
    event_loop: Mutex<Option<EventLoop>>,
    ready: Condvar,
}

pub struct LoopThread {
    shared: Arc<Shared>,
    join_handle: Option<JoinHandle<()>>,
    name: String,
}

impl LoopThread {
    /// Spawns the thread, but does not yet wait for the loop to come up.
    pub fn new(name: String, init_cb: Option<InitCallback>) -> LoopThread {
        let shared = Arc::new(Shared {
            event_loop: Mutex::new(None),
            ready: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread_name = name.clone();
        let join_handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(l) => l,
                    Err(e) => {
                        log::error!("thread {thread_name}: failed to create EventLoop: {e}");
                        return;
                    }
                };
                if let Some(cb) = init_cb {
                    cb(&event_loop);
                }
                {
                    let mut guard = thread_shared.event_loop.lock().unwrap();
                    *guard = Some(event_loop.clone());
                    thread_shared.ready.notify_one();
                }
                event_loop.run();
            })
            .expect("failed to spawn loop thread");

        LoopThread {
            shared,
            join_handle: Some(join_handle),
            name,
        }
    }

    /// Blocks until the spawned thread has constructed its loop, then
    /// returns a handle to it.
    pub fn start_loop(&self) -> EventLoop {
        let mut guard = self.shared.event_loop.lock().unwrap();
        while guard.is_none() {
            guard = self.shared.ready.wait(guard).unwrap();
        }
        guard.as_ref().unwrap().clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Some(guard) = self.shared.event_loop.lock().unwrap().as_ref() {
            guard.quit();
        }
        self.join();
    }
}
