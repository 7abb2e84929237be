//! Channel — one file descriptor's event registration.
//!
//! A channel binds an fd's interest set and its event handlers to the
//! loop that owns the fd. It never owns the fd itself; the listener or
//! connection that created it does, and that owner is responsible for
//! removing the channel before closing the fd.
//!
//! All mutation happens on the owning loop's thread. The `Cell`/
//! `RefCell` interior is safe to share across threads only because the
//! loop asserts thread affinity before every registration change and
//! every dispatch; the `unsafe impl Send/Sync` below encodes exactly
//! that contract. Handlers are installed before the channel is first
//! registered and are not replaced from within dispatch.
//!
//! The tie: readiness events are raw fd-tagged data from the poller,
//! and a task that ran earlier in the same cycle may already have torn
//! the fd's owner down. A tied channel therefore upgrades its weak
//! owner reference before invoking any handler and silently skips the
//! dispatch when the upgrade fails.

use crate::event_loop::EventLoop;
use crate::poller::RegState;
use muxr_core::{merror, Interest, Ready, Timestamp};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

pub type ReadHandler = Box<dyn FnMut(Timestamp) + Send>;
pub type EventHandler = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Handlers {
    read: Option<ReadHandler>,
    write: Option<EventHandler>,
    close: Option<EventHandler>,
    error: Option<EventHandler>,
}

pub struct Channel {
    fd: RawFd,
    owner: Weak<EventLoop>,
    interest: Cell<Interest>,
    ready: Cell<Ready>,
    state: Cell<RegState>,
    tied: Cell<bool>,
    tie: RefCell<Weak<dyn Any + Send + Sync>>,
    handlers: RefCell<Handlers>,
}

// Interior mutability is guarded by loop-thread affinity, not locks;
// see the module docs for the contract.
unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl Channel {
    pub fn new(owner: &Arc<EventLoop>, fd: RawFd) -> Arc<Channel> {
        let dead: Weak<dyn Any + Send + Sync> = Weak::<()>::new();
        Arc::new(Channel {
            fd,
            owner: Arc::downgrade(owner),
            interest: Cell::new(Interest::NONE),
            ready: Cell::new(Ready::EMPTY),
            state: Cell::new(RegState::Unregistered),
            tied: Cell::new(false),
            tie: RefCell::new(dead),
            handlers: RefCell::new(Handlers::default()),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn interest(&self) -> Interest {
        self.interest.get()
    }

    /// Current multiplexer registration state.
    #[inline]
    pub fn state(&self) -> RegState {
        self.state.get()
    }

    /// Poller-side: record the registration state transition.
    pub fn set_state(&self, state: RegState) {
        self.state.set(state);
    }

    /// Poller-side: record this cycle's reported readiness.
    pub fn set_ready(&self, ready: Ready) {
        self.ready.set(ready);
    }

    pub fn set_read_handler(&self, h: ReadHandler) {
        self.handlers.borrow_mut().read = Some(h);
    }

    pub fn set_write_handler(&self, h: EventHandler) {
        self.handlers.borrow_mut().write = Some(h);
    }

    pub fn set_close_handler(&self, h: EventHandler) {
        self.handlers.borrow_mut().close = Some(h);
    }

    pub fn set_error_handler(&self, h: EventHandler) {
        self.handlers.borrow_mut().error = Some(h);
    }

    /// Keep `owner` alive for the duration of each dispatch. Stored
    /// weak; upgraded around handler invocation.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.borrow_mut() = Arc::downgrade(owner);
        self.tied.set(true);
    }

    /// Drop the owner reference; subsequent dispatches are no-ops once
    /// the owner itself is gone.
    pub fn untie(&self) {
        let dead: Weak<dyn Any + Send + Sync> = Weak::<()>::new();
        *self.tie.borrow_mut() = dead;
        self.tied.set(false);
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.interest.get().contains(Interest::READ)
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.interest.get().contains(Interest::WRITE)
    }

    pub fn enable_reading(self: &Arc<Self>) {
        let mut i = self.interest.get();
        i.insert(Interest::READ);
        self.interest.set(i);
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        let mut i = self.interest.get();
        i.remove(Interest::READ);
        self.interest.set(i);
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        let mut i = self.interest.get();
        i.insert(Interest::WRITE);
        self.interest.set(i);
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        let mut i = self.interest.get();
        i.remove(Interest::WRITE);
        self.interest.set(i);
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.interest.set(Interest::NONE);
        self.update();
    }

    /// Unregister from the owning loop's poller. Interest must already
    /// be empty (`disable_all` first).
    pub fn remove(self: &Arc<Self>) {
        match self.owner.upgrade() {
            Some(lp) => lp.remove_channel(self),
            None => merror!("channel fd {}: remove after owning loop was destroyed", self.fd),
        }
    }

    /// Used by loop teardown, which unregisters the wake channel
    /// directly against its own poller.
    pub(crate) fn reset_interest(&self) {
        self.interest.set(Interest::NONE);
    }

    fn update(self: &Arc<Self>) {
        match self.owner.upgrade() {
            Some(lp) => lp.update_channel(self),
            None => merror!("channel fd {}: update after owning loop was destroyed", self.fd),
        }
    }

    /// Deliver this cycle's readiness to the handlers. Sole call site
    /// through which socket readiness becomes an application event.
    pub fn dispatch(self: &Arc<Self>, ts: Timestamp) {
        if self.tied.get() {
            let guard = self.tie.borrow().upgrade();
            match guard {
                // `_owner` pins the logical owner across the handlers.
                Some(_owner) => self.handle_event(ts),
                None => {} // owner already torn down; skip silently
            }
        } else {
            self.handle_event(ts);
        }
    }

    fn handle_event(&self, ts: Timestamp) {
        let ready = self.ready.get();

        // Fixed priority: hangup without readable data first, then
        // error, then read, then write.
        if ready.contains(Ready::HUP) && !ready.is_readable() {
            if let Some(h) = self.handlers.borrow_mut().close.as_mut() {
                h();
            }
        }
        if ready.contains(Ready::ERROR) {
            if let Some(h) = self.handlers.borrow_mut().error.as_mut() {
                h();
            }
        }
        if ready.is_readable() {
            if let Some(h) = self.handlers.borrow_mut().read.as_mut() {
                h(ts);
            }
        }
        if ready.contains(Ready::WRITE) {
            if let Some(h) = self.handlers.borrow_mut().write.as_mut() {
                h();
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Owners must unregister before letting the channel go.
        debug_assert!(
            self.state.get() != RegState::Added,
            "channel fd {} dropped while still registered",
            self.fd
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_thread::EventLoopThread;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn dead_tie_skips_dispatch() {
        let t = EventLoopThread::start("muxr-tie-test".into(), None);
        let lp = t.event_loop();
        let (r, w) = make_pipe();

        let hits = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel::<Arc<Channel>>();
        {
            let lp2 = lp.clone();
            let hits2 = hits.clone();
            lp.submit(move || {
                let ch = Channel::new(&lp2, r);
                let h = hits2.clone();
                ch.set_read_handler(Box::new(move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                }));
                // Tie to an owner that is gone before any event fires.
                let owner: Arc<dyn std::any::Any + Send + Sync> = Arc::new(());
                ch.tie(&owner);
                drop(owner);
                ch.enable_reading();
                tx.send(ch).unwrap();
            });
        }
        let ch = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let n = unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 0, "dispatch must skip a dead tie");

        // Untied channels dispatch normally again.
        {
            let ch2 = ch.clone();
            lp.submit(move || ch2.untie());
        }
        std::thread::sleep(Duration::from_millis(200));
        assert!(hits.load(Ordering::SeqCst) >= 1);

        let (done_tx, done_rx) = mpsc::channel::<()>();
        {
            let ch2 = ch.clone();
            lp.submit(move || {
                ch2.disable_all();
                ch2.remove();
                done_tx.send(()).unwrap();
            });
        }
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
