//! Growable I/O byte buffer.
//!
//! Layout is three regions over one contiguous allocation:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0           read_index         write_index          capacity
//! ```
//!
//! The first `CHEAP_PREPEND` bytes are reserved so a length or type
//! prefix can be stamped in front of queued data without a copy.
//! Invariant after every operation:
//! `0 <= read_index <= write_index <= capacity`.
//!
//! `read_from_fd` is the intake path for socket readiness: one `readv`
//! into the writable tail plus a 64 KiB stack region, so a single call
//! can absorb far more than the buffer's current capacity and growth
//! happens at most once per call, in one follow-up copy.

use crate::error::last_errno;
use std::os::unix::io::RawFd;

/// Reserved prepend space at the front of the buffer.
pub const CHEAP_PREPEND: usize = 8;
/// Initial capacity of the readable+writable area.
pub const INITIAL_SIZE: usize = 1024;

const EXTRABUF_SIZE: usize = 65536;

pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Self {
        Self {
            data: vec![0; CHEAP_PREPEND + initial],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_index
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The readable region, without consuming it.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_index..self.write_index]
    }

    /// Consume `n` readable bytes. Consuming past the end clamps to a
    /// full reset.
    pub fn retrieve(&mut self, n: usize) {
        if n < self.readable_bytes() {
            self.read_index += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Reset both cursors to the prepend reserve.
    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Consume and return `n` bytes (clamped to what is readable).
    pub fn retrieve_as_vec(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.readable_bytes());
        let out = self.peek()[..n].to_vec();
        self.retrieve(n);
        out
    }

    /// Consume and return the whole readable region.
    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let n = self.readable_bytes();
        self.retrieve_as_vec(n)
    }

    /// Consume the whole readable region as a (lossy) UTF-8 string.
    pub fn retrieve_all_as_string(&mut self) -> String {
        String::from_utf8_lossy(&self.retrieve_all_as_vec()).into_owned()
    }

    /// Copy `data` behind the readable region, growing or compacting as
    /// needed, and advance the write cursor.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.write_index..self.write_index + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Stamp `data` directly in front of the readable region. Callers
    /// must stay within `prependable_bytes()`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.read_index -= data.len();
        self.data[self.read_index..self.read_index + data.len()].copy_from_slice(data);
    }

    /// Make sure at least `len` bytes are writable.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.data.resize(self.write_index + len, 0);
        } else {
            // Slide the readable region down to the reserve, recovering
            // space already consumed at the front without reallocating.
            let readable = self.readable_bytes();
            self.data
                .copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = CHEAP_PREPEND + readable;
        }
    }

    /// Scatter-read from `fd` into the writable tail plus a 64 KiB stack
    /// region in a single `readv`. Overflow beyond the writable tail is
    /// appended (growing the buffer) in one copy.
    ///
    /// Returns `Ok(0)` on EOF and `Err(errno)` on failure; would-block
    /// surfaces as `Err(EAGAIN)` and is the caller's "no progress" case.
    pub fn read_from_fd(&mut self, fd: RawFd) -> Result<usize, i32> {
        let mut extrabuf = [0u8; EXTRABUF_SIZE];
        let writable = self.writable_bytes();
        let mut vec = [
            libc::iovec {
                iov_base: self.data[self.write_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                iov_len: EXTRABUF_SIZE,
            },
        ];
        // When the tail already exceeds the stack region, one iovec is
        // enough; a single call never reads more than writable + 64 KiB.
        let iovcnt = if writable < EXTRABUF_SIZE { 2 } else { 1 };
        let n = unsafe { libc::readv(fd, vec.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(last_errno());
        }
        let n = n as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.data.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }

    /// Write the full readable region to `fd` in one call. Returns the
    /// (possibly partial) count written; the caller retrieves only what
    /// was actually written.
    pub fn write_to_fd(&mut self, fd: RawFd) -> Result<usize, i32> {
        let readable = self.readable_bytes();
        let n = unsafe {
            libc::write(
                fd,
                self.data[self.read_index..].as_ptr() as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(last_errno());
        }
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_invariant(buf: &Buffer) {
        assert!(buf.read_index <= buf.write_index);
        assert!(buf.write_index <= buf.capacity());
    }

    #[test]
    fn fresh_buffer_layout() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn append_retrieve_accounting() {
        // readable + retrieved == appended, invariant holds throughout.
        let mut buf = Buffer::new();
        let mut appended = 0usize;
        let mut retrieved = 0usize;
        let ops: &[(usize, usize)] = &[
            (100, 0),
            (0, 30),
            (500, 500),
            (1500, 0),
            (0, 700),
            (64, 5000), // over-retrieve clamps
        ];
        for &(a, r) in ops {
            if a > 0 {
                buf.append(&vec![b'x'; a]);
                appended += a;
            }
            if r > 0 {
                let before = buf.readable_bytes();
                buf.retrieve(r);
                retrieved += r.min(before);
            }
            check_invariant(&buf);
            assert_eq!(buf.readable_bytes() + retrieved, appended);
        }
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn round_trips_across_growth_boundary() {
        for n in [0usize, 1, INITIAL_SIZE - 1, INITIAL_SIZE, INITIAL_SIZE + 1, 10 * INITIAL_SIZE]
        {
            let mut buf = Buffer::new();
            let payload: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
            buf.append(&payload);
            assert_eq!(buf.readable_bytes(), n);
            check_invariant(&buf);
            assert_eq!(buf.retrieve_as_vec(n), payload);
            assert_eq!(buf.readable_bytes(), 0);
        }
    }

    #[test]
    fn compaction_recovers_space_without_realloc() {
        let mut buf = Buffer::new();
        buf.append(&[b'a'; 800]);
        buf.retrieve(700);
        let cap = buf.capacity();
        // 100 readable left; 900 needed fits after sliding them down.
        buf.append(&[b'b'; 900]);
        assert_eq!(buf.capacity(), cap);
        assert_eq!(buf.readable_bytes(), 1000);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        let tail = buf.retrieve_all_as_vec();
        assert_eq!(&tail[..100], &[b'a'; 100]);
        assert_eq!(&tail[100..], &[b'b'; 900]);
    }

    #[test]
    fn prepend_uses_reserve() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        let len = (buf.readable_bytes() as u32).to_be_bytes();
        buf.prepend(&len);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        assert_eq!(&buf.retrieve_as_vec(4), &len);
        assert_eq!(buf.retrieve_all_as_string(), "payload");
    }

    #[test]
    fn retrieve_all_as_string_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello, muxr");
        assert_eq!(buf.retrieve_all_as_string(), "hello, muxr");
        assert_eq!(buf.readable_bytes(), 0);
    }

    fn make_pipe(nonblocking: bool) -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let flags = if nonblocking { libc::O_NONBLOCK } else { 0 };
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), flags | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn read_from_fd_absorbs_more_than_capacity() {
        let (r, w) = make_pipe(false);
        let payload: Vec<u8> = (0..5000).map(|i| (i % 256) as u8).collect();
        let n = unsafe {
            libc::write(w, payload.as_ptr() as *const libc::c_void, payload.len())
        };
        assert_eq!(n, 5000);

        let mut buf = Buffer::new();
        // Single readv pulls 5000 bytes into a 1024-byte writable tail.
        assert_eq!(buf.read_from_fd(r), Ok(5000));
        assert_eq!(buf.readable_bytes(), 5000);
        check_invariant(&buf);
        assert_eq!(buf.retrieve_all_as_vec(), payload);

        unsafe {
            libc::close(w);
        }
        assert_eq!(buf.read_from_fd(r), Ok(0)); // EOF
        unsafe {
            libc::close(r);
        }
    }

    #[test]
    fn read_from_fd_would_block() {
        let (r, w) = make_pipe(true);
        let mut buf = Buffer::new();
        assert_eq!(buf.read_from_fd(r), Err(libc::EAGAIN));
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn write_to_fd_partial_then_retrieve() {
        let (r, w) = make_pipe(false);
        let mut buf = Buffer::new();
        buf.append(b"0123456789");
        let n = buf.write_to_fd(w).unwrap();
        assert_eq!(n, 10);
        buf.retrieve(n);
        assert_eq!(buf.readable_bytes(), 0);

        let mut out = [0u8; 16];
        let got = unsafe { libc::read(r, out.as_mut_ptr() as *mut libc::c_void, 16) };
        assert_eq!(got, 10);
        assert_eq!(&out[..10], b"0123456789");
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
