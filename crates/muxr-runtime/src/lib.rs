//! # muxr-runtime
//!
//! The reactor: multiplexing, registration, and the loop itself.
//!
//! One `EventLoop` per OS thread, each owning one `Poller` (epoll by
//! default) and a cross-thread task queue. `Channel`s bind fds to
//! handlers; `EventLoopPool` fans connections out across extra loop
//! threads round-robin.
//!
//! ## Modules
//!
//! - `event_loop` - poll/dispatch/drain cycle, cross-thread submit
//! - `channel` - per-fd event registration and dispatch
//! - `poller` - multiplexer trait + epoll backend
//! - `waker` - eventfd used to unblock a polling loop
//! - `registry` - one-loop-per-thread enforcement
//! - `loop_thread` / `pool` - owned loop threads, round-robin pool

pub mod channel;
pub mod event_loop;
pub mod loop_thread;
pub mod poller;
pub mod pool;
pub mod registry;
pub mod waker;

// Re-exports for convenience
pub use channel::Channel;
pub use event_loop::{EventLoop, Task};
pub use loop_thread::{EventLoopThread, ThreadInitHook};
pub use poller::{Poller, RegState};
pub use pool::EventLoopPool;
pub use waker::Waker;
