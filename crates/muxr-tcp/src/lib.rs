//! TCP plumbing on top of the reactor runtime: listening sockets, the
//! per-connection state machine, and the multi-reactor server that
//! deals accepted connections across a loop pool.

pub mod acceptor;
pub mod connection;
pub mod observer;
pub mod server;
pub mod sockets;

pub use acceptor::Acceptor;
pub use connection::{ConnState, TcpConnection, TcpConnectionRef, DEFAULT_HIGH_WATER_MARK};
pub use observer::{ConnectionObserver, NoopObserver};
pub use server::TcpServer;
pub use sockets::Socket;
