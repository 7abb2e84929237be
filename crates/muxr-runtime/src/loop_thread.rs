//! One OS thread hosting one event loop.
//!
//! The loop is constructed on its own thread (the one-loop-per-thread
//! registry demands it), so the handle is passed back to the spawner
//! through a mutex+condvar slot before `run()` starts. The slot is
//! always filled: a drop guard on the spawned thread signals failure
//! when loop construction or the init hook panics, so the spawner
//! never waits on a thread that already died.

use crate::event_loop::EventLoop;
use muxr_core::mfatal;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Hook run once on each loop thread after its loop exists, before it
/// starts polling.
pub type ThreadInitHook = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// `None` = not signaled yet, `Some(None)` = the thread died during
/// startup, `Some(Some(lp))` = the loop is up.
type StartSlot = Arc<(Mutex<Option<Option<Arc<EventLoop>>>>, Condvar)>;

/// Fills the slot with `None` on unwind unless a loop was sent first.
struct StartSignal {
    slot: StartSlot,
    sent: bool,
}

impl StartSignal {
    fn send(&mut self, event_loop: Option<Arc<EventLoop>>) {
        let (lock, cv) = &*self.slot;
        let mut guard = lock.lock().unwrap_or_else(|p| p.into_inner());
        *guard = Some(event_loop);
        cv.notify_one();
        self.sent = true;
    }
}

impl Drop for StartSignal {
    fn drop(&mut self) {
        if !self.sent {
            self.send(None);
        }
    }
}

pub struct EventLoopThread {
    event_loop: Arc<EventLoop>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    /// Spawn `name`, create its loop, run `hook`, start polling.
    /// Returns once the loop exists; fatal if the thread dies first.
    pub fn start(name: String, hook: Option<ThreadInitHook>) -> Self {
        let slot: StartSlot = Arc::new((Mutex::new(None), Condvar::new()));
        let slot_in_thread = slot.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut signal = StartSignal {
                    slot: slot_in_thread,
                    sent: false,
                };
                let event_loop = EventLoop::new();
                if let Some(hook) = hook {
                    hook(&event_loop);
                }
                signal.send(Some(event_loop.clone()));
                event_loop.run();
            });
        let handle = match handle {
            Ok(h) => h,
            Err(e) => mfatal!("failed to spawn loop thread {}: {}", name, e),
        };

        let event_loop = {
            let (lock, cv) = &*slot;
            let mut guard = lock.lock().unwrap_or_else(|p| p.into_inner());
            while guard.is_none() {
                guard = cv.wait(guard).unwrap_or_else(|p| p.into_inner());
            }
            match guard.take() {
                Some(Some(lp)) => lp,
                _ => {
                    drop(guard);
                    let _ = handle.join(); // reap before reporting
                    mfatal!("loop thread {} died during startup", name);
                }
            }
        };

        Self {
            event_loop,
            handle: Some(handle),
        }
    }

    pub fn event_loop(&self) -> Arc<EventLoop> {
        self.event_loop.clone()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.event_loop.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
