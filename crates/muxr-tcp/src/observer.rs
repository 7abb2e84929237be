//! Application-facing connection callbacks as a capability trait.
//!
//! Every method has a no-op default, so an application implements only
//! what it cares about and nothing in the hot path null-checks
//! optional function fields. One observer instance is shared by all
//! connections of a server; methods run on the loop thread the
//! connection is pinned to.

use crate::connection::TcpConnectionRef;
use muxr_core::{Buffer, Timestamp};

pub trait ConnectionObserver: Send + Sync {
    /// Connection state changed: fires once when the connection is
    /// established and once when it is closed. Check
    /// `conn.is_connected()` to tell which.
    fn on_connection(&self, _conn: &TcpConnectionRef) {}

    /// Bytes arrived. `buf` is the connection's input buffer; consume
    /// what you can and leave the rest for the next readiness event.
    fn on_message(&self, _conn: &TcpConnectionRef, _buf: &mut Buffer, _ts: Timestamp) {}

    /// The output buffer fully drained to the socket.
    fn on_write_complete(&self, _conn: &TcpConnectionRef) {}

    /// Buffered output crossed the high-water mark from below.
    /// `buffered` is the queued byte count at the crossing.
    fn on_high_water_mark(&self, _conn: &TcpConnectionRef, _buffered: usize) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}
