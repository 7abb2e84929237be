//! Level-triggered epoll backend.
//!
//! The fd -> channel table here is the single source of truth for "is
//! this fd known to the multiplexer". Events carry the fd in their user
//! data; readiness is resolved back to a channel through the table, so
//! a stale kernel event for an fd we no longer know is dropped with a
//! log line instead of touching freed state.

use super::{Poller, RegState};
use crate::channel::Channel;
use muxr_core::error::last_errno;
use muxr_core::{mdebug, merror, mfatal, mtrace, Interest, Ready, Timestamp};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;

const INIT_EVENT_LIST_SIZE: usize = 16;

pub struct EpollPoller {
    epfd: RawFd,
    /// Ready-event buffer; doubles whenever a poll fills it.
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    pub fn new() -> Self {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            mfatal!("epoll_create1 failed: errno {}", last_errno());
        }
        Self {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        }
    }

    fn interest_to_bits(interest: Interest) -> u32 {
        let mut bits = 0u32;
        if interest.contains(Interest::READ) {
            bits |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
        }
        if interest.contains(Interest::WRITE) {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }

    fn bits_to_ready(bits: u32) -> Ready {
        let mut ready = Ready::EMPTY;
        if bits & libc::EPOLLIN as u32 != 0 {
            ready |= Ready::READ;
        }
        if bits & libc::EPOLLPRI as u32 != 0 {
            ready |= Ready::PRI;
        }
        if bits & libc::EPOLLOUT as u32 != 0 {
            ready |= Ready::WRITE;
        }
        if bits & libc::EPOLLHUP as u32 != 0 {
            ready |= Ready::HUP;
        }
        if bits & libc::EPOLLERR as u32 != 0 {
            ready |= Ready::ERROR;
        }
        ready
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let mut ev = libc::epoll_event {
            events: Self::interest_to_bits(channel.interest()),
            u64: channel.fd() as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, channel.fd(), &mut ev) };
        if rc < 0 {
            let errno = last_errno();
            if op == libc::EPOLL_CTL_DEL {
                // The fd may already be invalid on teardown paths.
                merror!(
                    "epoll_ctl DEL fd {} failed: errno {}",
                    channel.fd(),
                    errno
                );
            } else {
                // A failed ADD/MOD would silently drop events.
                mfatal!(
                    "epoll_ctl op {} fd {} failed: errno {}",
                    op,
                    channel.fd(),
                    errno
                );
            }
        }
    }

    fn fill_active(&self, n: usize, active: &mut Vec<Arc<Channel>>) {
        for ev in &self.events[..n] {
            let fd = ev.u64 as RawFd;
            match self.channels.get(&fd) {
                Some(channel) => {
                    channel.set_ready(Self::bits_to_ready(ev.events));
                    active.push(channel.clone());
                }
                None => merror!("epoll reported unknown fd {}", fd),
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let now = Timestamp::now();
        if n > 0 {
            let n = n as usize;
            mtrace!("epoll: {} event(s) ready", n);
            self.fill_active(n, active);
            if n == self.events.len() {
                // Filled the buffer: more may be pending next cycle.
                self.events
                    .resize(self.events.len() * 2, libc::epoll_event { events: 0, u64: 0 });
            }
        } else if n == 0 {
            mtrace!("epoll: poll timed out");
        } else {
            let errno = last_errno();
            if errno != libc::EINTR {
                merror!("epoll_wait failed: errno {}", errno);
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        match channel.state() {
            RegState::Unregistered => {
                self.channels.insert(channel.fd(), channel.clone());
                self.ctl(libc::EPOLL_CTL_ADD, channel);
                channel.set_state(RegState::Added);
            }
            RegState::Removed => {
                // Seen before: still in the table, back into the kernel.
                debug_assert!(self.channels.contains_key(&channel.fd()));
                self.ctl(libc::EPOLL_CTL_ADD, channel);
                channel.set_state(RegState::Added);
            }
            RegState::Added => {
                if channel.interest().is_empty() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_state(RegState::Removed);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        debug_assert!(channel.interest().is_empty());
        self.channels.remove(&channel.fd());
        if channel.state() == RegState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_state(RegState::Unregistered);
        mdebug!("epoll: forgot fd {}", channel.fd());
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        match self.channels.get(&channel.fd()) {
            Some(found) => std::ptr::eq(Arc::as_ptr(found), channel),
            None => false,
        }
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    // The full transition table, driven through a real loop + epoll fd
    // on the current thread.
    #[test]
    fn registration_state_transitions() {
        let lp = EventLoop::new();
        let (r, w) = make_pipe();
        let ch = Channel::new(&lp, r);
        ch.set_read_handler(Box::new(|_| {}));
        ch.set_write_handler(Box::new(|| {}));

        assert_eq!(ch.state(), RegState::Unregistered);
        assert!(!lp.has_channel(&ch));

        ch.enable_reading(); // Unregistered -> Added (ADD)
        assert_eq!(ch.state(), RegState::Added);
        assert!(lp.has_channel(&ch));

        ch.enable_writing(); // Added, non-empty -> Added (MOD)
        assert_eq!(ch.state(), RegState::Added);
        assert!(ch.is_reading() && ch.is_writing());

        ch.disable_all(); // Added, empty -> Removed (DEL)
        assert_eq!(ch.state(), RegState::Removed);
        assert!(lp.has_channel(&ch), "Removed stays in the fd table");

        ch.enable_reading(); // Removed -> Added, not Unregistered first
        assert_eq!(ch.state(), RegState::Added);

        ch.disable_all();
        ch.remove(); // Removed -> Unregistered, out of the table
        assert_eq!(ch.state(), RegState::Unregistered);
        assert!(!lp.has_channel(&ch));

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn readiness_maps_to_ready_bits() {
        let bits = (libc::EPOLLIN | libc::EPOLLHUP) as u32;
        let ready = EpollPoller::bits_to_ready(bits);
        assert!(ready.is_readable());
        assert!(ready.contains(Ready::HUP));
        assert!(!ready.contains(Ready::WRITE));

        let bits = EpollPoller::interest_to_bits(Interest::READ | Interest::WRITE);
        assert_ne!(bits & libc::EPOLLIN as u32, 0);
        assert_ne!(bits & libc::EPOLLPRI as u32, 0);
        assert_ne!(bits & libc::EPOLLOUT as u32, 0);
        assert_eq!(EpollPoller::interest_to_bits(Interest::NONE), 0);
    }
}
