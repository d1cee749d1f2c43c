//! echoplex: a line-oriented TCP echo server served under selectable I/O
//! notification strategies.
//!
//! The protocol is raw byte echo of whatever one read call returns, up to
//! the frame capacity. A frame whose first three bytes are `bye` closes the
//! connection after its echo is flushed; the server itself stops when the
//! last connection finishes.
//!
//! Backends:
//! - blocking per-connection service
//! - level-triggered readiness multiplexing (`poll(2)`)
//! - edge-triggered readiness multiplexing (mio: epoll/kqueue)
//! - completion-based asynchronous I/O (io_uring)

pub mod config;
pub mod protocol;
pub mod runtime;
