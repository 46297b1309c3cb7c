//! Distributes connections across a fixed set of worker loops, round-robin.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::event_loop::EventLoop;
use crate::loop_thread::LoopThread;

pub struct EventLoopThreadPool {
    base_loop: EventLoop,
    name: String,
    num_threads: usize,
    threads: Vec<LoopThread>,
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: EventLoop, name: String) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name,
            num_threads: 0,
            threads: Vec::new(),
            loops: Vec::new(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn set_thread_num(&mut self, n: usize) {
        self.num_threads = n;
    }

    /// Spawns `num_threads` worker threads, each running `init_cb` on its
    /// own loop before entering dispatch. With zero configured threads,
    /// `init_cb` runs once, directly on the base loop, and all connections
    /// are served from the base loop instead.
    pub fn start<F>(&mut self, init_cb: Option<F>)
    where
        F: Fn(&EventLoop) + Send + Sync + Clone + 'static,
    {
        for i in 0..self.num_threads {
            let thread_name = format!("{}{}", self.name, i);
            let cb = init_cb.clone();
            let loop_thread = LoopThread::new(
                thread_name,
                cb.map(|cb| -> Box<dyn FnOnce(&EventLoop) + Send> { Box::new(move |l: &EventLoop| cb(l)) }),
            );
            let event_loop = loop_thread.start_loop();
            self.loops.push(event_loop);
            self.threads.push(loop_thread);
        }

        // Comparing, not assigning: only fire the callback on the base loop
        // when there are truly zero workers to have received it instead.
        if self.num_threads == 0 {
            if let Some(cb) = init_cb {
                cb(&self.base_loop);
            }
        }
    }

    /// Returns the next worker loop in round-robin order, or the base loop
    /// if no worker threads were started.
    pub fn get_next_loop(&self) -> EventLoop {
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let i = self.next.fetch_add(1, Ordering::SeqCst) % self.loops.len();
        self.loops[i].clone()
    }

    pub fn get_all_loops(&self) -> Vec<EventLoop> {
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_threads_returns_base_loop_repeatedly() {
        let base = EventLoop::new().expect("base loop");
        let mut pool = EventLoopThreadPool::new(base.clone(), "Test".to_string());
        pool.start::<fn(&EventLoop)>(None);
        for _ in 0..4 {
            assert!(pool.get_next_loop().is_in_loop_thread());
        }
    }
}
