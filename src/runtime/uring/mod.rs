//! io_uring completion backend (Linux only).

mod event_loop;

pub use event_loop::serve;
