//! Reactor pool with round-robin dispatch.
//!
//! The pool owns N extra loop threads; new connections are fanned out
//! across them cyclically. With zero threads the pool degenerates to
//! the base loop: all I/O happens on the accepting thread.

use crate::event_loop::EventLoop;
use crate::loop_thread::{EventLoopThread, ThreadInitHook};
use muxr_core::minfo;
use std::sync::Arc;

pub struct EventLoopPool {
    base_loop: Arc<EventLoop>,
    name: String,
    num_threads: usize,
    started: bool,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<EventLoop>>,
}

impl EventLoopPool {
    pub fn new(base_loop: Arc<EventLoop>, name: String) -> Self {
        Self {
            base_loop,
            name,
            num_threads: 0,
            started: false,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Number of extra reactor threads. 0 keeps everything on the base
    /// loop. Must be set before `start`.
    pub fn set_thread_num(&mut self, n: usize) {
        self.num_threads = n;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn start(&mut self, hook: Option<ThreadInitHook>) {
        self.started = true;
        for i in 0..self.num_threads {
            let name = format!("{}-loop-{}", self.name, i);
            let t = EventLoopThread::start(name, hook.clone());
            self.loops.push(t.event_loop());
            self.threads.push(t);
        }
        minfo!(
            "pool {}: started with {} sub-loop(s)",
            self.name,
            self.num_threads
        );
        if self.num_threads == 0 {
            if let Some(hook) = hook {
                hook(&self.base_loop);
            }
        }
    }

    /// Next loop in round-robin order; the base loop when the pool is
    /// empty.
    pub fn next_loop(&mut self) -> Arc<EventLoop> {
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let lp = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        lp
    }

    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
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
    fn empty_pool_hands_out_base_loop() {
        let base = EventLoop::new();
        let mut pool = EventLoopPool::new(base.clone(), "t".into());
        pool.start(None);
        for _ in 0..5 {
            assert!(Arc::ptr_eq(&pool.next_loop(), &base));
        }
        assert_eq!(pool.all_loops().len(), 1);
    }

    #[test]
    fn round_robin_is_i_mod_p() {
        let base = EventLoop::new();
        let mut pool = EventLoopPool::new(base.clone(), "t".into());
        pool.set_thread_num(3);
        pool.start(None);
        let loops = pool.all_loops();
        assert_eq!(loops.len(), 3);
        for i in 0..10 {
            let got = pool.next_loop();
            assert!(Arc::ptr_eq(&got, &loops[i % 3]), "connection {} misassigned", i);
            assert!(!Arc::ptr_eq(&got, &base));
        }
    }

    #[test]
    fn init_hook_runs_on_every_pool_loop() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let base = EventLoop::new();
        let mut pool = EventLoopPool::new(base, "t".into());
        pool.set_thread_num(2);
        let hits = Arc::new(AtomicUsize::new(0));
        let hook: ThreadInitHook = {
            let hits = hits.clone();
            Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        pool.start(Some(hook));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
