//! Eventfd-based loop waker.
//!
//! A loop blocked in `poll` is unblocked by writing to this eventfd;
//! its read side is registered on the loop like any other channel.
//! Eventfd counter semantics coalesce: any number of `wake()` calls
//! before the loop drains collapse into a single readiness event.

use muxr_core::error::{last_errno, MuxError, Result};
use muxr_core::{mdebug, merror};
use std::os::unix::io::RawFd;

pub struct Waker {
    fd: RawFd,
}

impl Waker {
    /// Create an owned nonblocking, close-on-exec eventfd.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(MuxError::WakerCreate(last_errno()));
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Unblock the owning loop's poll. Safe from any thread.
    pub fn wake(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let errno = last_errno();
            // EAGAIN: counter at max, a wakeup is already pending.
            if errno != libc::EAGAIN {
                merror!("waker: write to eventfd {} failed: errno {}", self.fd, errno);
            }
        }
    }

    /// Consume pending wakeups. Called from the loop's read handler.
    pub fn drain(&self) {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd,
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let errno = last_errno();
            if errno != libc::EAGAIN {
                merror!("waker: drain of eventfd {} failed: errno {}", self.fd, errno);
            }
        } else {
            mdebug!("waker: drained {} wakeup(s)", count);
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}
