//! I/O multiplexer abstraction.
//!
//! One poller per loop, polymorphic over backends with the capability
//! set {poll, register-or-update, remove}. The backend is selected once
//! at loop construction, not at call sites; the shipped backend is
//! level-triggered epoll. An edge-triggered or completion-based backend
//! would be another implementor of the same trait.

use crate::channel::Channel;
use muxr_core::Timestamp;
use std::sync::Arc;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod epoll;
        pub use epoll::EpollPoller;

        /// Construct the default backend for this platform.
        pub fn default_poller() -> Box<dyn Poller> {
            Box::new(EpollPoller::new())
        }
    } else {
        compile_error!("muxr currently ships only the epoll backend (linux)");
    }
}

/// Registration lifecycle of one channel against the multiplexer.
///
/// `Removed` is distinct from `Unregistered` on purpose: a `Removed`
/// channel has been seen before and is still in the fd table, so a
/// reuse transitions back to `Added` rather than through first-time
/// registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegState {
    /// Never registered, or fully forgotten after `remove_channel`.
    Unregistered,
    /// Known to the kernel with a live interest set.
    Added,
    /// Known to the fd table but detached from the kernel (interest
    /// went empty).
    Removed,
}

/// Backend contract. All methods run on the owning loop's thread.
pub trait Poller: Send {
    /// Block up to `timeout_ms` for readiness or a wakeup. Channels
    /// with new readiness get their `Ready` bits set and are appended
    /// to `active`. Returns the poll completion time.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp;

    /// Push the channel's current interest set to the kernel,
    /// add/modify/detach according to its registration state.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Forget the channel entirely. Interest must already be empty.
    fn remove_channel(&mut self, channel: &Channel);

    /// Whether the fd table currently knows this channel.
    fn has_channel(&self, channel: &Channel) -> bool;
}
