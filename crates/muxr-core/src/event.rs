//! Backend-agnostic event bitmasks.
//!
//! `Interest` is what a registration asks the multiplexer to watch;
//! `Ready` is what a poll cycle reports back. Backends translate these
//! to and from their native bits (e.g. `EPOLLIN`/`EPOLLOUT`), so nothing
//! above the poller layer sees OS flags.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Interest set for one registration: read, write, both, or none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(1);
    pub const WRITE: Interest = Interest(2);

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(&self, other: Interest) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: Interest) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Interest) {
        self.0 &= !other.0;
    }
}

impl BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Interest::READ), self.contains(Interest::WRITE)) {
            (true, true) => write!(f, "read|write"),
            (true, false) => write!(f, "read"),
            (false, true) => write!(f, "write"),
            (false, false) => write!(f, "none"),
        }
    }
}

/// Readiness reported by one poll cycle for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READ: Ready = Ready(1);
    pub const PRI: Ready = Ready(2);
    pub const WRITE: Ready = Ready(4);
    pub const HUP: Ready = Ready(8);
    pub const ERROR: Ready = Ready(16);

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(&self, other: Ready) -> bool {
        self.0 & other.0 != 0
    }

    /// Readable for dispatch purposes: data, priority data, or peer hangup
    /// that still carries bytes.
    #[inline]
    pub const fn is_readable(&self) -> bool {
        self.contains(Ready::READ) || self.contains(Ready::PRI)
    }
}

impl BitOr for Ready {
    type Output = Ready;
    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter<'_>, s: &str| -> fmt::Result {
            if !first {
                write!(f, "|")?;
            }
            first = false;
            write!(f, "{}", s)
        };
        if self.contains(Ready::READ) {
            put(f, "read")?;
        }
        if self.contains(Ready::PRI) {
            put(f, "pri")?;
        }
        if self.contains(Ready::WRITE) {
            put(f, "write")?;
        }
        if self.contains(Ready::HUP) {
            put(f, "hup")?;
        }
        if self.contains(Ready::ERROR) {
            put(f, "error")?;
        }
        if first {
            write!(f, "empty")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_bit_ops() {
        let mut i = Interest::NONE;
        assert!(i.is_empty());
        i.insert(Interest::READ);
        assert!(i.contains(Interest::READ));
        assert!(!i.contains(Interest::WRITE));
        i |= Interest::WRITE;
        assert!(i.contains(Interest::READ | Interest::WRITE));
        i.remove(Interest::READ);
        assert!(!i.contains(Interest::READ));
        assert!(i.contains(Interest::WRITE));
        assert_eq!(i.to_string(), "write");
    }

    #[test]
    fn ready_dispatch_bits() {
        let r = Ready::READ | Ready::HUP;
        assert!(r.is_readable());
        assert!(r.contains(Ready::HUP));
        assert!(!r.contains(Ready::WRITE));
        assert!(Ready::PRI.is_readable());
        assert!(!Ready::WRITE.is_readable());
        assert_eq!(Ready::EMPTY.to_string(), "empty");
        assert_eq!(r.to_string(), "read|hup");
    }
}
