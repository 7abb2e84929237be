//! muxr error types.
//!
//! Most OS-level failures in the reactor are either fatal (handled by
//! `mfatal!`) or logged and absorbed, so these variants cover the few
//! places where an error is worth returning to the caller: socket setup,
//! accept-time failures, and wake-descriptor plumbing. Variants carry the
//! raw `errno`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxError {
    /// epoll instance creation failed.
    PollerCreate(i32),
    /// eventfd creation failed.
    WakerCreate(i32),
    /// Socket creation / option / bind / listen failure.
    Socket(i32),
    /// accept4 failed (recoverable; listener stays alive).
    Accept(i32),
    /// Generic OS error with errno.
    Os(i32),
}

impl MuxError {
    /// The raw errno carried by this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::PollerCreate(e)
            | Self::WakerCreate(e)
            | Self::Socket(e)
            | Self::Accept(e)
            | Self::Os(e) => *e,
        }
    }
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PollerCreate(e) => write!(f, "poller creation: errno {}", e),
            Self::WakerCreate(e) => write!(f, "wake eventfd creation: errno {}", e),
            Self::Socket(e) => write!(f, "socket operation: errno {}", e),
            Self::Accept(e) => write!(f, "accept: errno {}", e),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for MuxError {}

pub type Result<T> = std::result::Result<T, MuxError>;

/// Read the calling thread's errno.
#[inline]
pub fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
