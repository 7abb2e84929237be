//! # muxr-core
//!
//! Leaf types for the muxr reactor runtime. This crate has no reactor
//! state of its own; it holds the pieces everything above depends on:
//!
//! - `buffer` - growable I/O byte buffer with read/write accounting
//! - `event` - backend-agnostic `Interest` / `Ready` bitmasks
//! - `timestamp` - microsecond wall-clock stamp for poll cycles
//! - `error` - error enum + `Result` alias
//! - `mlog` - leveled stderr log macros (`mtrace!`..`mfatal!`)

pub mod buffer;
pub mod error;
pub mod event;
pub mod mlog;
pub mod timestamp;

// Re-exports for convenience
pub use buffer::Buffer;
pub use error::{last_errno, MuxError, Result};
pub use event::{Interest, Ready};
pub use timestamp::Timestamp;
