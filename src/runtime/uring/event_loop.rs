//! io_uring event loop.
//!
//! Completion-based model: reads and writes are issued up front and their
//! results arrive later on the completion queue, consumed by a single
//! worker thread. Each in-flight operation owns one token and one frame
//! buffer; a connection never has more than one operation outstanding, so
//! its state machine is only ever driven from one completion at a time.
//!
//! Shutdown is a typed sentinel: when the last connection closes, the
//! worker posts a no-op operation tagged `OpKind::Shutdown` and exits when
//! that completion is dequeued. No reserved key values.

use crate::runtime::connection::{Connection, ConnectionRegistry, FlushOutcome};
use crate::runtime::token::{OpKind, TokenAllocator};
use crate::runtime::{BufferPool, EngineOptions};
use io_uring::{opcode, types, IoUring};
use std::io;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::thread;
use tracing::{debug, info, warn};

/// Bounds on the submission/completion queue depth. The kernel requires a
/// power-of-two entry count and rejects rings deeper than 32768.
const MIN_RING_ENTRIES: u32 = 256;
const MAX_RING_ENTRIES: u32 = 32768;

/// Queue depth for a given connection limit: one operation per connection
/// plus the armed accept and the shutdown sentinel.
fn ring_entries(max_connections: usize) -> u32 {
    let needed = max_connections.saturating_add(2).next_power_of_two();
    (needed as u64).clamp(u64::from(MIN_RING_ENTRIES), u64::from(MAX_RING_ENTRIES)) as u32
}

struct UringConn {
    fd: RawFd,
    echo: Connection,
    /// Frame buffer owned by this connection; referenced by at most one
    /// in-flight operation at a time.
    buf_idx: usize,
}

/// Serve echo clients until the last connection closes.
///
/// The ring lives on a dedicated worker thread that blocks on the
/// completion queue; issuing an operation never blocks.
pub fn serve(listener: TcpListener, opts: EngineOptions) -> io::Result<()> {
    // io_uring waits internally; the socket itself stays blocking.
    listener.set_nonblocking(false)?;

    let handle = thread::Builder::new()
        .name("proactor-worker".to_string())
        .spawn(move || worker_loop(listener, opts))?;

    handle
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "proactor worker panicked"))?
}

fn worker_loop(listener: TcpListener, opts: EngineOptions) -> io::Result<()> {
    let entries = ring_entries(opts.max_connections);
    let mut ring: IoUring = IoUring::new(entries)?;
    let listener_fd = listener.as_raw_fd();

    let mut buffers = BufferPool::new(opts.max_connections, opts.frame_size);
    let mut connections: ConnectionRegistry<UringConn> =
        ConnectionRegistry::new(opts.max_connections);
    // One op per connection plus the armed accept and the shutdown sentinel.
    let mut tokens = TokenAllocator::new(opts.max_connections + 2);

    submit_accept(&mut ring, &mut tokens, listener_fd)?;

    info!(
        max_connections = opts.max_connections,
        frame_size = opts.frame_size,
        ring_entries = entries,
        "Proactor worker started"
    );

    let mut running = true;
    while running {
        ring.submit_and_wait(1)?;

        loop {
            let cqe = match ring.completion().next() {
                Some(cqe) => cqe,
                None => break,
            };

            let token = cqe.user_data();
            let result = cqe.result();

            // Ownership of the operation context returns here; the token is
            // freed on every path and reallocated only when the connection
            // issues its next operation.
            let op = match tokens.free(token) {
                Some(op) => op,
                None => {
                    warn!("Unknown token in completion: {}", token);
                    continue;
                }
            };

            match op {
                OpKind::Accept => handle_accept(
                    result,
                    &mut ring,
                    &mut tokens,
                    &mut connections,
                    &mut buffers,
                    listener_fd,
                )?,
                OpKind::Read { conn_id } => handle_read(
                    result,
                    conn_id,
                    &mut ring,
                    &mut tokens,
                    &mut connections,
                    &mut buffers,
                )?,
                OpKind::Write { conn_id } => handle_write(
                    result,
                    conn_id,
                    &mut ring,
                    &mut tokens,
                    &mut connections,
                    &mut buffers,
                )?,
                OpKind::Shutdown => {
                    debug!("Shutdown completion consumed");
                    running = false;
                    break;
                }
            }
        }
    }

    info!("Last connection closed, proactor done");
    Ok(())
}

fn handle_accept(
    result: i32,
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    connections: &mut ConnectionRegistry<UringConn>,
    buffers: &mut BufferPool,
    listener_fd: RawFd,
) -> io::Result<()> {
    // Always re-arm accept.
    submit_accept(ring, tokens, listener_fd)?;

    if result < 0 {
        let err = io::Error::from_raw_os_error(-result);
        warn!("Accept failed: {}", err);
        return Ok(());
    }

    let client_fd = result;

    let buf_idx = match buffers.alloc() {
        Some(idx) => idx,
        None => {
            warn!(fd = client_fd, "Buffer pool exhausted, rejecting connection");
            unsafe { libc::close(client_fd) };
            return Ok(());
        }
    };

    let inserted = connections.insert(UringConn {
        fd: client_fd,
        echo: Connection::new(),
        buf_idx,
    });
    let conn_id = match inserted {
        Some(id) => id,
        None => {
            warn!(fd = client_fd, "Connection limit reached, rejecting");
            buffers.free(buf_idx);
            unsafe { libc::close(client_fd) };
            return Ok(());
        }
    };

    debug!(conn_id, fd = client_fd, "Accepted connection");

    submit_read(ring, tokens, connections, buffers, conn_id)
}

fn handle_read(
    result: i32,
    conn_id: usize,
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    connections: &mut ConnectionRegistry<UringConn>,
    buffers: &mut BufferPool,
) -> io::Result<()> {
    if result <= 0 {
        if result < 0 {
            let err = io::Error::from_raw_os_error(-result);
            debug!(conn_id, "Read error: {}", err);
        } else {
            debug!(conn_id, "Connection closed by peer");
        }
        if close_connection(connections, buffers, conn_id) {
            post_shutdown(ring, tokens)?;
        }
        return Ok(());
    }

    let n = result as usize;
    let conn = match connections.get_mut(conn_id) {
        Some(c) => c,
        None => return Ok(()),
    };

    let frame = &buffers.get(conn.buf_idx)[..n];
    conn.echo.begin_echo(frame);

    // Reuse the same buffer for the echo: the read context becomes the
    // write context.
    submit_write(ring, tokens, connections, buffers, conn_id)
}

fn handle_write(
    result: i32,
    conn_id: usize,
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    connections: &mut ConnectionRegistry<UringConn>,
    buffers: &mut BufferPool,
) -> io::Result<()> {
    if result <= 0 {
        if result < 0 {
            let err = io::Error::from_raw_os_error(-result);
            debug!(conn_id, "Write error: {}", err);
        }
        if close_connection(connections, buffers, conn_id) {
            post_shutdown(ring, tokens)?;
        }
        return Ok(());
    }

    let n = result as usize;
    let outcome = match connections.get_mut(conn_id) {
        Some(c) => c.echo.advance_echo(n),
        None => return Ok(()),
    };

    match outcome {
        FlushOutcome::Pending => submit_write(ring, tokens, connections, buffers, conn_id),
        FlushOutcome::ReadNext => submit_read(ring, tokens, connections, buffers, conn_id),
        FlushOutcome::Terminate => {
            debug!(conn_id, "Terminator flushed, closing");
            if close_connection(connections, buffers, conn_id) {
                post_shutdown(ring, tokens)?;
            }
            Ok(())
        }
    }
}

fn submit_accept(
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    listener_fd: RawFd,
) -> io::Result<()> {
    let token = tokens.alloc(OpKind::Accept);

    let accept = opcode::Accept::new(
        types::Fd(listener_fd),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
    )
    .build()
    .user_data(token);

    unsafe {
        ring.submission().push(&accept).map_err(|_| {
            tokens.free(token);
            io::Error::new(io::ErrorKind::Other, "submission queue full")
        })?;
    }

    Ok(())
}

fn submit_read(
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    connections: &ConnectionRegistry<UringConn>,
    buffers: &mut BufferPool,
    conn_id: usize,
) -> io::Result<()> {
    let conn = connections
        .get(conn_id)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

    let fd = conn.fd;
    let len = buffers.buffer_size() as u32;
    let buf_ptr = buffers.get_ptr(conn.buf_idx);

    let token = tokens.alloc(OpKind::Read { conn_id });

    let recv = opcode::Recv::new(types::Fd(fd), buf_ptr, len)
        .build()
        .user_data(token);

    unsafe {
        ring.submission().push(&recv).map_err(|_| {
            tokens.free(token);
            io::Error::new(io::ErrorKind::Other, "submission queue full")
        })?;
    }

    Ok(())
}

fn submit_write(
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    connections: &ConnectionRegistry<UringConn>,
    buffers: &mut BufferPool,
    conn_id: usize,
) -> io::Result<()> {
    let conn = connections
        .get(conn_id)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

    let (written, len) = conn
        .echo
        .pending_echo()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not in echoing state"))?;

    let fd = conn.fd;
    let buf_ptr = buffers.get_ptr(conn.buf_idx);

    let token = tokens.alloc(OpKind::Write { conn_id });

    let write = opcode::Write::new(
        types::Fd(fd),
        unsafe { buf_ptr.add(written) },
        (len - written) as u32,
    )
    .build()
    .user_data(token);

    unsafe {
        ring.submission().push(&write).map_err(|_| {
            tokens.free(token);
            io::Error::new(io::ErrorKind::Other, "submission queue full")
        })?;
    }

    Ok(())
}

/// Remove a connection and release its resources.
///
/// Returns true when this close drained the registry, i.e. the caller must
/// post the shutdown sentinel.
fn close_connection(
    connections: &mut ConnectionRegistry<UringConn>,
    buffers: &mut BufferPool,
    conn_id: usize,
) -> bool {
    if let Some(conn) = connections.remove(conn_id) {
        buffers.free(conn.buf_idx);
        unsafe { libc::close(conn.fd) };
        debug!(conn_id, "Connection closed");
        connections.drained()
    } else {
        false
    }
}

fn post_shutdown(ring: &mut IoUring, tokens: &mut TokenAllocator) -> io::Result<()> {
    let token = tokens.alloc(OpKind::Shutdown);

    let nop = opcode::Nop::new().build().user_data(token);

    unsafe {
        ring.submission().push(&nop).map_err(|_| {
            tokens.free(token);
            io::Error::new(io::ErrorKind::Other, "submission queue full")
        })?;
    }

    Ok(())
}
