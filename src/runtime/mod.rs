//! Echo engine backends.
//!
//! Four I/O notification strategies drive the same connection state
//! machine:
//! - `blocking`: one blocking service thread per connection
//! - `poll`: level-triggered readiness via `poll(2)` (Unix)
//! - `epoll`: edge-triggered readiness via mio (epoll on Linux, kqueue on
//!   macOS)
//! - `uring`: completion-based via io_uring (Linux)
//!
//! Shared abstractions:
//! - `Connection` / `ConnectionRegistry`: state machine and live-connection
//!   tracking, including the "last connection closed" stop condition
//! - `BufferPool`: one fixed-size frame buffer per live connection
//! - `TokenAllocator`: completion correlation for the proactor

mod buffer;
pub mod connection;
pub mod token;

pub mod blocking;

#[cfg(unix)]
pub mod poll;

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub mod epoll;

#[cfg(target_os = "linux")]
pub mod uring;

pub use buffer::BufferPool;

use crate::config::{Backend, Config};
use std::io;
use std::net::SocketAddr;

/// Engine parameters shared by every backend.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Registry capacity; connections beyond it are rejected and closed.
    pub max_connections: usize,
    /// Frame buffer capacity; reads are truncated to this per read call.
    pub frame_size: usize,
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_connections: config.max_connections,
            frame_size: config.frame_size,
        }
    }
}

/// Bind the listener and run the configured backend until the last
/// connection closes.
pub fn run(config: Config) -> io::Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let listener = create_listener(addr)?;
    let opts = EngineOptions::from(&config);

    match config.backend {
        Backend::Blocking => blocking::serve(listener, opts),
        #[cfg(unix)]
        Backend::Poll => poll::serve(listener, opts),
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        Backend::Epoll => epoll::serve(listener, opts),
        #[cfg(target_os = "linux")]
        Backend::Uring => uring::serve(listener, opts),
        #[allow(unreachable_patterns)]
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("backend {other:?} is not supported on this platform"),
        )),
    }
}

/// Create a TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    Ok(socket.into())
}
