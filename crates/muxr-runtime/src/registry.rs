//! Per-thread loop ownership registry.
//!
//! One OS thread may own at most one `EventLoop`; that is a hard
//! invariant, checked here at construction time. Each loop gets a
//! process-unique id, and a thread-local slot records which loop (if
//! any) the current thread owns. Teardown is explicit: the loop
//! releases its claim when destroyed, so a thread can host another
//! loop afterwards (tests rely on this).

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Loop id owned by this thread; 0 = none.
    static OWNED_LOOP: Cell<u64> = const { Cell::new(0) };
}

/// Allocate a process-unique loop id (never 0).
pub fn allocate_id() -> u64 {
    NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed)
}

/// Claim the current thread for loop `id`. Returns `false` if the
/// thread already owns a loop.
pub fn claim(id: u64) -> bool {
    OWNED_LOOP.with(|slot| {
        if slot.get() != 0 {
            false
        } else {
            slot.set(id);
            true
        }
    })
}

/// Loop id owned by the current thread, or 0.
pub fn current() -> u64 {
    OWNED_LOOP.with(|slot| slot.get())
}

/// Release the claim for loop `id`. No-op on a thread that does not
/// own it (a loop dropped from a foreign thread after its owner
/// exited).
pub fn release(id: u64) {
    OWNED_LOOP.with(|slot| {
        if slot.get() == id {
            slot.set(0);
        }
    });
}
