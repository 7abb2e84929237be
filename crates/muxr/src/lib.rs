//! # muxr - multi-reactor TCP runtime
//!
//! A non-blocking TCP server library built on the one-loop-per-thread
//! reactor pattern: a base loop accepts connections and deals them
//! round-robin to a pool of I/O loops, where each connection lives for
//! its whole life. Readiness comes from epoll (level-triggered); all
//! per-connection work runs on the connection's own loop thread, so
//! application callbacks never need locks of their own.
//!
//! ## Quick start
//!
//! ```ignore
//! use muxr::{ConnectionObserver, EventLoop, TcpConnectionRef, TcpServer};
//! use muxr::{Buffer, Timestamp};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl ConnectionObserver for Echo {
//!     fn on_message(&self, conn: &TcpConnectionRef, buf: &mut Buffer, _ts: Timestamp) {
//!         let data = buf.retrieve_all_as_vec();
//!         conn.send(&data);
//!     }
//! }
//!
//! fn main() {
//!     let base = EventLoop::new();
//!     let server = TcpServer::new(
//!         base.clone(),
//!         "0.0.0.0:7000".parse().unwrap(),
//!         "echo".to_string(),
//!         false,
//!         Arc::new(Echo),
//!     );
//!     server.set_thread_num(4);
//!     server.start();
//!     base.run();
//! }
//! ```
//!
//! The pieces are usable on their own: [`EventLoop`] plus [`Channel`]
//! for arbitrary fd readiness, [`Buffer`] for byte queuing,
//! [`EventLoopPool`] for loop fan-out.

pub use muxr_core::{Buffer, Interest, MuxError, Ready, Result, Timestamp};
pub use muxr_runtime::{Channel, EventLoop, EventLoopPool, EventLoopThread, ThreadInitHook};
pub use muxr_tcp::{
    Acceptor, ConnState, ConnectionObserver, NoopObserver, Socket, TcpConnection,
    TcpConnectionRef, TcpServer, DEFAULT_HIGH_WATER_MARK,
};

pub use muxr_core::{mdebug, merror, mfatal, minfo, mtrace, mwarn};
