//! EventLoop — one reactor, one OS thread.
//!
//! The loop cycle is poll -> dispatch -> drain: block in the poller up
//! to a bounded timeout, run every ready channel's handlers with the
//! poll return timestamp, then execute all tasks queued since the last
//! drain, in FIFO order. Readiness handlers of a cycle always run
//! before that cycle's drained tasks; tasks never interleave
//! mid-dispatch.
//!
//! Cross-thread handoff is the only synchronization point: a
//! mutex-protected task queue plus an eventfd waker. Everything else
//! the loop owns (poller, channel table, per-connection state) is
//! touched only on the owning thread, which is asserted, not locked.

use crate::channel::Channel;
use crate::poller::{default_poller, Poller};
use crate::registry;
use crate::waker::Waker;
use muxr_core::{mdebug, mfatal, minfo, Timestamp};
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

const POLL_TIMEOUT_MS: i32 = 10_000;

pub type Task = Box<dyn FnOnce() + Send>;

pub struct EventLoop {
    id: u64,
    thread: thread::ThreadId,
    poller: RefCell<Box<dyn Poller>>,
    waker: Waker,
    wake_channel: RefCell<Option<Arc<Channel>>>,
    pending: Mutex<Vec<Task>>,
    looping: AtomicBool,
    quit: AtomicBool,
    /// True while the drain phase runs; submissions during it must
    /// wake the loop so they are not stranded until the next event.
    draining: AtomicBool,
    poll_return: Cell<Timestamp>,
}

// The RefCell/Cell interior is owner-thread-only (asserted); the
// Mutex, atomics and waker are the cross-thread surface.
unsafe impl Send for EventLoop {}
unsafe impl Sync for EventLoop {}

impl EventLoop {
    /// Create a loop owned by the calling thread. Fatal if this thread
    /// already owns one, or if the wake eventfd cannot be created.
    pub fn new() -> Arc<EventLoop> {
        muxr_core::mlog::init();
        let id = registry::allocate_id();
        if !registry::claim(id) {
            mfatal!(
                "event loop {} already owns thread {:?}, refusing to create another",
                registry::current(),
                thread::current().id()
            );
        }
        let waker = match Waker::create() {
            Ok(w) => w,
            Err(e) => mfatal!("event loop: {}", e),
        };

        let lp = Arc::new(EventLoop {
            id,
            thread: thread::current().id(),
            poller: RefCell::new(default_poller()),
            waker,
            wake_channel: RefCell::new(None),
            pending: Mutex::new(Vec::new()),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            poll_return: Cell::new(Timestamp::invalid()),
        });

        let wake_channel = Channel::new(&lp, lp.waker.fd());
        let weak = Arc::downgrade(&lp);
        wake_channel.set_read_handler(Box::new(move |_| {
            if let Some(lp) = weak.upgrade() {
                lp.waker.drain();
            }
        }));
        wake_channel.enable_reading();
        *lp.wake_channel.borrow_mut() = Some(wake_channel);

        mdebug!("event loop {} created on {:?}", id, lp.thread);
        lp
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            mfatal!(
                "event loop {} touched from {:?}, owned by {:?}",
                self.id,
                thread::current().id(),
                self.thread
            );
        }
    }

    /// Timestamp of the most recent poll return.
    pub fn poll_return_time(&self) -> Timestamp {
        self.poll_return.get()
    }

    /// Run the poll/dispatch/drain cycle until `stop()`. Must be called
    /// from the owning thread.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::Release);
        minfo!("event loop {} start", self.id);

        let mut active: Vec<Arc<Channel>> = Vec::with_capacity(16);
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            let ts = self.poller.borrow_mut().poll(POLL_TIMEOUT_MS, &mut active);
            self.poll_return.set(ts);
            for channel in &active {
                channel.dispatch(ts);
            }
            self.drain_pending();
        }

        self.looping.store(false, Ordering::Release);
        minfo!("event loop {} stop", self.id);
    }

    /// Ask the loop to exit after it finishes the current cycle's
    /// dispatch and task drain. Thread-safe, best-effort: from a
    /// foreign thread the blocked poll is woken, otherwise the flag is
    /// observed within the poll timeout.
    pub fn stop(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.waker.wake();
        }
    }

    /// Run `f` on the loop thread: immediately when called from it,
    /// queued (and woken if needed) otherwise.
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.submit_deferred(f);
        }
    }

    /// Always queue `f` for the drain phase, even from the loop thread.
    /// Required when running `f` immediately would re-enter state that
    /// is mid-mutation (registration changes from inside callbacks,
    /// destruction of the object whose handler is running).
    pub fn submit_deferred<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.push(Box::new(f));
        }
        // A wakeup is redundant only when the loop thread itself queues
        // outside the drain phase: the drain at the end of this cycle
        // will pick the task up anyway.
        if !self.is_in_loop_thread() || self.draining.load(Ordering::Acquire) {
            self.waker.wake();
        }
    }

    fn drain_pending(&self) {
        self.draining.store(true, Ordering::Release);
        let tasks: Vec<Task> = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }
        self.draining.store(false, Ordering::Release);
    }

    /// Push `channel`'s interest set to the poller. Owner thread only.
    pub fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    /// Unregister `channel` from the poller. Owner thread only.
    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Some(wake_channel) = self.wake_channel.borrow_mut().take() {
            // Direct teardown against our own poller: the channel's weak
            // owner reference is already unupgradable at this point.
            wake_channel.reset_interest();
            self.poller.borrow_mut().remove_channel(&wake_channel);
        }
        registry::release(self.id);
        mdebug!("event loop {} destroyed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_thread::EventLoopThread;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn second_loop_on_thread_is_fatal() {
        muxr_core::mlog::set_log_level(muxr_core::mlog::LogLevel::Off);
        let result = thread::spawn(|| {
            let _first = EventLoop::new();
            let _second = EventLoop::new(); // must die
        })
        .join();
        assert!(result.is_err(), "second loop on one thread must be fatal");
    }

    #[test]
    fn loop_recreatable_after_teardown() {
        let first = EventLoop::new();
        let id = first.id();
        drop(first);
        let second = EventLoop::new();
        assert_ne!(second.id(), id);
    }

    #[test]
    fn submit_on_loop_thread_runs_immediately() {
        let lp = EventLoop::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        lp.submit(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst), "in-thread submit is synchronous");
    }

    #[test]
    fn cross_thread_submit_runs_once_on_owner() {
        let t = EventLoopThread::start("muxr-submit-test".into(), None);
        let lp = t.event_loop();
        assert!(!lp.is_in_loop_thread());

        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        {
            let count = count.clone();
            lp.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
                tx.send(thread::current().id()).unwrap();
            });
        }
        let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(ran_on, thread::current().id());
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn foreign_submit_wakes_blocked_poll_promptly() {
        // Poll timeout is 10s; a sub-second turnaround proves the wake.
        let t = EventLoopThread::start("muxr-wake-test".into(), None);
        let lp = t.event_loop();
        std::thread::sleep(Duration::from_millis(50)); // let it block in poll

        let start = Instant::now();
        let (tx, rx) = mpsc::channel();
        lp.submit(move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn deferred_tasks_run_in_fifo_order() {
        let t = EventLoopThread::start("muxr-fifo-test".into(), None);
        let lp = t.event_loop();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let order = order.clone();
            let tx = tx.clone();
            lp.submit_deferred(move || {
                order.lock().unwrap().push(i);
                if i == 7 {
                    tx.send(()).unwrap();
                }
            });
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn stop_from_foreign_thread_exits_loop() {
        let t = EventLoopThread::start("muxr-stop-test".into(), None);
        let lp = t.event_loop();
        std::thread::sleep(Duration::from_millis(50));
        lp.stop();
        // EventLoopThread::drop joins; reaching the end without hanging
        // is the assertion.
        drop(t);
    }
}
