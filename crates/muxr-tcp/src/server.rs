//! TcpServer — composition root.
//!
//! Binds the acceptor, the reactor pool and the connection table
//! together. The table is owned and mutated only on the base loop's
//! thread; connections are pinned to the pool loop they were dealt to
//! and never migrate. A connection leaves the process in two steps: the
//! close hook erases the table entry on the base loop, then `destroy`
//! runs as deferred work on the connection's own loop, so no callback
//! ever holds the last reference mid-dispatch.

use crate::acceptor::Acceptor;
use crate::connection::{TcpConnection, TcpConnectionRef};
use crate::observer::ConnectionObserver;
use crate::sockets;
use muxr_core::{merror, minfo};
use muxr_runtime::{EventLoop, EventLoopPool, ThreadInitHook};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct TcpServer {
    event_loop: Arc<EventLoop>,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: RefCell<EventLoopPool>,
    observer: Arc<dyn ConnectionObserver>,
    thread_init: RefCell<Option<ThreadInitHook>>,
    started: AtomicBool,
    next_conn_id: Cell<u64>,
    connections: RefCell<HashMap<String, TcpConnectionRef>>,
}

// All RefCell/Cell state is base-loop-thread-only; construction and
// drop must happen on that thread too.
unsafe impl Send for TcpServer {}
unsafe impl Sync for TcpServer {}

impl TcpServer {
    pub fn new(
        event_loop: Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: String,
        reuse_port: bool,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Arc<TcpServer> {
        let acceptor = Acceptor::new(&event_loop, &listen_addr, reuse_port);
        let ip_port = acceptor
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| listen_addr.to_string());
        let pool = EventLoopPool::new(event_loop.clone(), name.clone());

        let server = Arc::new(TcpServer {
            event_loop,
            name,
            ip_port,
            acceptor,
            pool: RefCell::new(pool),
            observer,
            thread_init: RefCell::new(None),
            started: AtomicBool::new(false),
            next_conn_id: Cell::new(1),
            connections: RefCell::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_accept_handler(Box::new(move |fd, peer| {
                if let Some(s) = weak.upgrade() {
                    s.new_connection(fd, peer);
                }
            }));
        server
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound listening address; resolves a port-0 bind.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Number of sub-reactor threads; 0 keeps all I/O on the accepting
    /// loop. Call before `start`.
    pub fn set_thread_num(&self, n: usize) {
        self.pool.borrow_mut().set_thread_num(n);
    }

    /// Hook run once per reactor thread at startup.
    pub fn set_thread_init(&self, hook: ThreadInitHook) {
        *self.thread_init.borrow_mut() = Some(hook);
    }

    /// Start the pool and the listener. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        minfo!("server {}: starting on {}", self.name, self.ip_port);
        let hook = self.thread_init.borrow_mut().take();
        self.pool.borrow_mut().start(hook);
        let acceptor = self.acceptor.clone();
        self.event_loop.submit(move || acceptor.listen());
    }

    fn new_connection(self: &Arc<Self>, fd: RawFd, peer_addr: SocketAddr) {
        self.event_loop.assert_in_loop_thread();
        let io_loop = self.pool.borrow_mut().next_loop();
        let id = self.next_conn_id.get();
        self.next_conn_id.set(id + 1);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        minfo!("server {}: connection {} from {}", self.name, conn_name, peer_addr);

        let local_addr = match sockets::local_addr(fd) {
            Some(addr) => addr,
            None => {
                merror!("server {}: no local address for fd {}, dropping", self.name, fd);
                unsafe {
                    libc::close(fd);
                }
                return;
            }
        };

        let conn = TcpConnection::new(
            io_loop.clone(),
            conn_name.clone(),
            fd,
            local_addr,
            peer_addr,
            self.observer.clone(),
        );
        let weak = Arc::downgrade(self);
        conn.set_close_hook(Box::new(move |c| {
            if let Some(s) = weak.upgrade() {
                s.remove_connection(c);
            }
        }));
        self.connections.borrow_mut().insert(conn_name, conn.clone());
        io_loop.submit(move || conn.establish());
    }

    /// Close-hook entry: may fire on any pool loop, so hop to the base
    /// loop where the table lives.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionRef) {
        let server = self.clone();
        let conn = conn.clone();
        self.event_loop
            .submit(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionRef) {
        self.event_loop.assert_in_loop_thread();
        minfo!("server {}: removing connection {}", self.name, conn.name());
        self.connections.borrow_mut().remove(conn.name());
        let io_loop = conn.owner_loop().clone();
        let conn = conn.clone();
        // Deferred: the connection may still be mid-dispatch on its
        // loop, and destroy unregisters the channel being dispatched.
        io_loop.submit_deferred(move || conn.destroy());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.event_loop.assert_in_loop_thread();
        minfo!("server {}: shutting down", self.name);
        for (_, conn) in self.connections.borrow_mut().drain() {
            let io_loop = conn.owner_loop().clone();
            io_loop.submit(move || conn.destroy());
        }
        // Field drop order finishes the job: the acceptor unregisters,
        // then the pool stops and joins its loops, which drains the
        // queued destroys first.
    }
}
