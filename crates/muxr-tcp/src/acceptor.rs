//! Acceptor — the listening socket's registration on the base loop.
//!
//! Owns the listening fd and its channel; hands freshly accepted
//! descriptors to whatever the server installed. Accept failures drop
//! the attempt and keep the listener alive; fd-table exhaustion gets
//! its own log line because it starves every connection, not just one.

use crate::sockets::{self, Socket};
use muxr_core::{merror, minfo};
use muxr_runtime::{Channel, EventLoop};
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

pub type AcceptHandler = Box<dyn FnMut(RawFd, SocketAddr) + Send>;

pub struct Acceptor {
    socket: Socket,
    channel: Arc<Channel>,
    listening: Cell<bool>,
    on_accept: RefCell<Option<AcceptHandler>>,
}

// Touched only on the base loop's thread once listening; the channel
// asserts that on every registration change.
unsafe impl Send for Acceptor {}
unsafe impl Sync for Acceptor {}

impl Acceptor {
    /// Create, configure and bind the listening socket. Binding
    /// happens here, so `local_addr` is valid before `listen`.
    pub fn new(event_loop: &Arc<EventLoop>, listen_addr: &SocketAddr, reuse_port: bool) -> Arc<Acceptor> {
        let socket = Socket::new_nonblocking(listen_addr);
        socket.set_reuse_addr(true);
        socket.set_reuse_port(reuse_port);
        socket.bind(listen_addr);
        let channel = Channel::new(event_loop, socket.fd());

        let acceptor = Arc::new(Acceptor {
            socket,
            channel,
            listening: Cell::new(false),
            on_accept: RefCell::new(None),
        });
        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_handler(Box::new(move |_| {
            if let Some(a) = weak.upgrade() {
                a.handle_read();
            }
        }));
        acceptor
    }

    pub fn set_accept_handler(&self, handler: AcceptHandler) {
        *self.on_accept.borrow_mut() = Some(handler);
    }

    pub fn listening(&self) -> bool {
        self.listening.get()
    }

    /// The bound address (resolves port 0 to the kernel's pick).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        sockets::local_addr(self.socket.fd())
    }

    /// Start accepting. Base loop thread only.
    pub fn listen(self: &Arc<Self>) {
        self.listening.set(true);
        self.socket.listen();
        self.channel.enable_reading();
        minfo!(
            "acceptor: listening on {}",
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "<unknown>".into())
        );
    }

    /// Level-triggered readiness: take everything the backlog has.
    fn handle_read(&self) {
        loop {
            match self.socket.accept() {
                Ok((fd, peer)) => {
                    let mut handler = self.on_accept.borrow_mut();
                    match handler.as_mut() {
                        Some(h) => h(fd, peer),
                        None => {
                            merror!("acceptor: no handler installed, closing fd {}", fd);
                            unsafe {
                                libc::close(fd);
                            }
                        }
                    }
                }
                Err(e) => {
                    let errno = e.errno();
                    if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                        break; // backlog drained
                    }
                    merror!("acceptor: {}", e);
                    if errno == libc::EMFILE {
                        merror!("acceptor: fd table exhausted, dropping connection attempts");
                    }
                    break;
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.listening.get() {
            self.channel.disable_all();
            self.channel.remove();
        }
    }
}
