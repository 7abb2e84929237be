//! TcpConnection — one accepted socket's state machine.
//!
//! States move one way: Connecting -> Connected -> Disconnecting ->
//! Disconnected, with Connected -> Disconnected on peer close or
//! error. There is no path back to Connected once Disconnecting is
//! entered.
//!
//! A connection is pinned to one loop for its whole life. Its buffers
//! and channel are touched only on that thread; the only lock-free
//! cross-thread surface is the state atom (read by `send` before
//! marshalling) and the `Arc` itself, shared between the server's
//! connection table and any queued task. The connection dies only
//! after the table entry is gone and all queued destruction work ran.

use crate::observer::ConnectionObserver;
use crate::sockets::{self, Socket};
use muxr_core::{mdebug, merror, minfo, Buffer, Timestamp};
use muxr_runtime::{Channel, EventLoop};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

pub type TcpConnectionRef = Arc<TcpConnection>;

/// Server-internal close notification, set after construction.
pub type CloseHook = Box<dyn Fn(&TcpConnectionRef) + Send + Sync>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    high_water_mark: Cell<usize>,
    observer: Arc<dyn ConnectionObserver>,
    close_hook: RefCell<Option<CloseHook>>,
}

// Interior mutability rides on loop-thread affinity: buffers, channel
// and hooks are touched only on the pinned loop; state is atomic.
unsafe impl Send for TcpConnection {}
unsafe impl Sync for TcpConnection {}

impl TcpConnection {
    /// Adopt `fd` on `event_loop`. The connection starts in
    /// `Connecting`; call `establish` on the loop thread to go live.
    pub fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        fd: RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        observer: Arc<dyn ConnectionObserver>,
    ) -> TcpConnectionRef {
        let socket = Socket::from_fd(fd);
        socket.set_keep_alive(true);
        let channel = Channel::new(&event_loop, fd);

        let conn = Arc::new(TcpConnection {
            event_loop,
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            socket,
            channel,
            local_addr,
            peer_addr,
            input: RefCell::new(Buffer::new()),
            output: RefCell::new(Buffer::new()),
            high_water_mark: Cell::new(DEFAULT_HIGH_WATER_MARK),
            observer,
            close_hook: RefCell::new(None),
        });
        minfo!("connection {}: adopted fd {} peer {}", conn.name, fd, conn.peer_addr);

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_handler(Box::new(move |ts| {
            if let Some(c) = weak.upgrade() {
                c.handle_read(ts);
            }
        }));
        let weak = Arc::downgrade(&conn);
        conn.channel.set_write_handler(Box::new(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_write();
            }
        }));
        let weak = Arc::downgrade(&conn);
        conn.channel.set_close_handler(Box::new(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_close();
            }
        }));
        let weak = Arc::downgrade(&conn);
        conn.channel.set_error_handler(Box::new(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_error();
            }
        }));
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The loop this connection is pinned to.
    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Threshold for `on_high_water_mark`, in buffered output bytes.
    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.set(bytes);
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        self.socket.set_tcp_nodelay(on);
    }

    /// Installed by the server so it can erase its table entry.
    pub fn set_close_hook(&self, hook: CloseHook) {
        *self.close_hook.borrow_mut() = Some(hook);
    }

    /// Go live: register read interest, tie the channel to this
    /// connection, tell the observer. Loop thread only; runs once.
    pub fn establish(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);
        let owner: Arc<dyn Any + Send + Sync> = self.clone();
        self.channel.tie(&owner);
        self.channel.enable_reading();
        self.observer.on_connection(self);
    }

    /// Final teardown, queued by the server after the table entry is
    /// erased. Loop thread only. Safe to reach without a prior close
    /// (server shutdown with live connections).
    pub fn destroy(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if self.state() != ConnState::Disconnected {
            // Forced teardown (server shutdown, or a half-closed
            // connection torn down before the peer answered).
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();
            self.observer.on_connection(self);
        }
        self.channel.remove();
    }

    /// Queue `data` for delivery. Not `Connected`: dropped with a log
    /// line. Off-thread calls are marshalled to the pinned loop.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            merror!("connection {}: send while not connected, {} bytes dropped", self.name, data.len());
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let me = self.clone();
            let owned = data.to_vec();
            self.event_loop.submit(move || me.send_in_loop(&owned));
        }
    }

    /// Ask for a half-close once pending output drains. No-op outside
    /// `Connected`.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let me = self.clone();
            self.event_loop.submit(move || me.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        // Still flushing: handle_write completes the half-close after
        // the last byte goes out.
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            merror!("connection {}: disconnected, give up writing", self.name);
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;
        let mut output = self.output.borrow_mut();

        // Idle write path: nothing queued and no write interest, try
        // the socket directly and only buffer the remainder.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            let n = unsafe {
                libc::write(
                    self.channel.fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };
            if n >= 0 {
                nwrote = n as usize;
                remaining = data.len() - nwrote;
                if remaining == 0 {
                    let me = self.clone();
                    self.event_loop
                        .submit_deferred(move || me.observer.on_write_complete(&me));
                }
            } else {
                let errno = muxr_core::last_errno();
                if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
                    merror!("connection {}: write failed: errno {}", self.name, errno);
                    if errno == libc::EPIPE || errno == libc::ECONNRESET {
                        fault = true;
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.get();
            // Fires exactly on the below -> at-or-above transition; a
            // send that lands on the mark from zero counts.
            if old_len + remaining >= mark && old_len < mark {
                let me = self.clone();
                let buffered = old_len + remaining;
                self.event_loop
                    .submit_deferred(move || me.observer.on_high_water_mark(&me, buffered));
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn handle_read(self: &Arc<Self>, ts: Timestamp) {
        let result = self.input.borrow_mut().read_from_fd(self.channel.fd());
        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                let mut input = self.input.borrow_mut();
                self.observer.on_message(self, &mut input, ts);
            }
            Err(errno) if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK => {
                // No progress this call.
            }
            Err(errno) => {
                merror!("connection {}: read failed: errno {}", self.name, errno);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.channel.is_writing() {
            // Anomalous but survivable: readiness raced a disable.
            merror!(
                "connection {}: writable event on fd {} with write interest disabled",
                self.name,
                self.channel.fd()
            );
            return;
        }
        let mut drained = false;
        {
            let mut output = self.output.borrow_mut();
            match output.write_to_fd(self.channel.fd()) {
                Ok(n) => {
                    output.retrieve(n);
                    if output.readable_bytes() == 0 {
                        drained = true;
                        self.channel.disable_writing();
                        let me = self.clone();
                        self.event_loop
                            .submit_deferred(move || me.observer.on_write_complete(&me));
                    }
                }
                Err(errno) => {
                    if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
                        merror!("connection {}: flush failed: errno {}", self.name, errno);
                    }
                }
            }
        }
        if drained && self.state() == ConnState::Disconnecting {
            self.shutdown_in_loop();
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            return; // close already handled this cycle
        }
        minfo!(
            "connection {}: fd {} closed (state {:?})",
            self.name,
            self.channel.fd(),
            self.state()
        );
        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();
        self.channel.untie();

        self.observer.on_connection(self);
        if let Some(hook) = self.close_hook.borrow().as_ref() {
            hook(self);
        }
    }

    fn handle_error(&self) {
        let err = sockets::socket_error(self.channel.fd());
        merror!("connection {}: SO_ERROR = {}", self.name, err);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        mdebug!(
            "connection {}: dropped, fd {} state {:?}",
            self.name,
            self.channel.fd(),
            self.state()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use muxr_runtime::EventLoopThread;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    struct CountingObserver {
        high_water: AtomicUsize,
        write_complete: AtomicUsize,
    }

    impl ConnectionObserver for CountingObserver {
        fn on_high_water_mark(&self, _conn: &TcpConnectionRef, _buffered: usize) {
            self.high_water.fetch_add(1, Ordering::SeqCst);
        }
        fn on_write_complete(&self, _conn: &TcpConnectionRef) {
            self.write_complete.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stream_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        // The connection side must be nonblocking like a real accept4 fd.
        unsafe {
            let flags = libc::fcntl(fds[0], libc::F_GETFL);
            libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        (fds[0], fds[1])
    }

    fn set_small_sndbuf(fd: RawFd) {
        let size: libc::c_int = 8 * 1024;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    fn spawn_conn(
        lp: &std::sync::Arc<EventLoop>,
        fd: RawFd,
        observer: Arc<dyn ConnectionObserver>,
    ) -> TcpConnectionRef {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (tx, rx) = mpsc::channel();
        let lp2 = lp.clone();
        lp.submit(move || {
            let conn = TcpConnection::new(lp2, "test#1".into(), fd, addr, addr, observer);
            conn.set_high_water_mark(64 * 1024);
            conn.establish();
            tx.send(conn).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn drain_peer(fd: RawFd, mut total: usize) {
        let mut buf = vec![0u8; 64 * 1024];
        while total > 0 {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            assert!(n > 0, "peer read failed or hit EOF early");
            total -= n as usize;
        }
    }

    fn wait_for(counter: &AtomicUsize, want: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= want {
                return;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        panic!("counter stuck below {}", want);
    }

    // Backpressure fires exactly once per below -> at-or-above crossing.
    #[test]
    fn high_water_mark_once_per_crossing() {
        let t = EventLoopThread::start("muxr-hwm-test".into(), None);
        let lp = t.event_loop();
        let (a, b) = stream_pair();
        set_small_sndbuf(a);

        let observer = Arc::new(CountingObserver {
            high_water: AtomicUsize::new(0),
            write_complete: AtomicUsize::new(0),
        });
        let conn = spawn_conn(&lp, a, observer.clone());

        // 512 KiB against a tiny send buffer: the immediate write
        // leaves far more than the 64 KiB mark queued. One crossing.
        let first = vec![1u8; 512 * 1024];
        {
            let c = conn.clone();
            let payload = first.clone();
            lp.submit(move || c.send_in_loop(&payload));
        }
        wait_for(&observer.high_water, 1);

        // Still above the mark: a further send must not re-fire.
        let second = vec![2u8; 128 * 1024];
        {
            let c = conn.clone();
            let payload = second.clone();
            lp.submit(move || c.send_in_loop(&payload));
        }
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(observer.high_water.load(Ordering::SeqCst), 1);

        // Drain everything through the peer; output empties and the
        // write-complete callback proves it.
        drain_peer(b, first.len() + second.len());
        wait_for(&observer.write_complete, 1);

        // Below the mark again: the next crossing re-fires.
        {
            let c = conn.clone();
            lp.submit(move || c.send_in_loop(&vec![3u8; 512 * 1024]));
        }
        wait_for(&observer.high_water, 2);

        drain_peer(b, 512 * 1024);
        let (done_tx, done_rx) = mpsc::channel();
        {
            let c = conn.clone();
            lp.submit(move || {
                c.destroy();
                done_tx.send(()).unwrap();
            });
        }
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        unsafe {
            libc::close(b);
        }
    }

    #[test]
    fn send_outside_connected_is_dropped() {
        let t = EventLoopThread::start("muxr-drop-test".into(), None);
        let lp = t.event_loop();
        let (a, b) = stream_pair();
        let conn = spawn_conn(&lp, a, Arc::new(NoopObserver));

        let (done_tx, done_rx) = mpsc::channel();
        {
            let c = conn.clone();
            lp.submit(move || {
                c.destroy();
                done_tx.send(()).unwrap();
            });
        }
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(conn.state(), ConnState::Disconnected);

        // Dropped, not queued; once the fd closes the peer must see a
        // bare EOF with no data in front of it.
        conn.send(b"late");
        drop(conn); // last reference: the owned fd closes here
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(b, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert_eq!(n, 0, "peer should see EOF and no data");
        unsafe {
            libc::close(b);
        }
    }

    #[test]
    fn shutdown_is_noop_outside_connected() {
        let t = EventLoopThread::start("muxr-shut-test".into(), None);
        let lp = t.event_loop();
        let (a, b) = stream_pair();
        let conn = spawn_conn(&lp, a, Arc::new(NoopObserver));

        conn.shutdown();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(conn.state(), ConnState::Disconnecting);
        conn.shutdown(); // second call: no state change, no panic
        assert_eq!(conn.state(), ConnState::Disconnecting);

        let (done_tx, done_rx) = mpsc::channel();
        {
            let c = conn.clone();
            lp.submit(move || {
                c.destroy();
                done_tx.send(()).unwrap();
            });
        }
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        unsafe {
            libc::close(b);
        }
    }
}
