//! Level-triggered readiness backend built on `poll(2)`.
//!
//! Single-threaded: every iteration rebuilds the descriptor set from the
//! registry and blocks in `poll` until something is ready. Level triggering
//! makes one read or write per ready descriptor per iteration sufficient;
//! readiness is simply reasserted on the next iteration if data remains.
//!
//! Interest follows the state machine: a connection waits for `POLLIN`
//! while `AwaitingRead` and for `POLLOUT` while an echo is partially
//! flushed.

use crate::runtime::connection::{Connection, ConnectionRegistry, FlushOutcome};
use crate::runtime::{BufferPool, EngineOptions};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use tracing::{debug, error, info, warn};

struct PollConn {
    stream: TcpStream,
    echo: Connection,
    buf_idx: usize,
}

/// Serve echo clients until the last connection closes.
pub fn serve(listener: TcpListener, opts: EngineOptions) -> io::Result<()> {
    listener.set_nonblocking(true)?;

    let mut buffers = BufferPool::new(opts.max_connections, opts.frame_size);
    let mut connections: ConnectionRegistry<PollConn> =
        ConnectionRegistry::new(opts.max_connections);

    info!(
        max_connections = opts.max_connections,
        frame_size = opts.frame_size,
        "Level-triggered poll backend started"
    );

    // Parallel to `pollfds[1..]`: the registry id behind each entry.
    let mut ids: Vec<usize> = Vec::with_capacity(opts.max_connections);
    let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(opts.max_connections + 1);

    loop {
        pollfds.clear();
        ids.clear();

        pollfds.push(libc::pollfd {
            fd: listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });

        for (id, conn) in connections.iter() {
            let events = if conn.echo.pending_echo().is_some() {
                libc::POLLOUT
            } else {
                libc::POLLIN
            };
            pollfds.push(libc::pollfd {
                fd: conn.stream.as_raw_fd(),
                events,
                revents: 0,
            });
            ids.push(id);
        }

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        if pollfds[0].revents != 0 {
            accept_one(&listener, &mut connections, &mut buffers)?;
        }

        for (slot, &conn_id) in ids.iter().enumerate() {
            if pollfds[slot + 1].revents == 0 {
                continue;
            }
            if let Err(e) = service_connection(conn_id, &mut connections, &mut buffers) {
                debug!(conn_id, error = %e, "Connection error");
                close_connection(&mut connections, &mut buffers, conn_id);
            }
            if connections.drained() {
                info!("Last connection closed, poll backend done");
                return Ok(());
            }
        }
    }
}

fn accept_one(
    listener: &TcpListener,
    connections: &mut ConnectionRegistry<PollConn>,
    buffers: &mut BufferPool,
) -> io::Result<()> {
    let (stream, peer_addr) = match listener.accept() {
        Ok(pair) => pair,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
        Err(e) => {
            // ECONNABORTED and kin: the handshake failed, not the engine.
            error!("Accept error: {}", e);
            return Ok(());
        }
    };

    if let Err(e) = stream.set_nonblocking(true) {
        warn!(peer = %peer_addr, error = %e, "Rejecting connection");
        return Ok(());
    }

    let buf_idx = match buffers.alloc() {
        Some(idx) => idx,
        None => {
            warn!(peer = %peer_addr, "Buffer pool exhausted, rejecting connection");
            return Ok(());
        }
    };

    let inserted = connections.insert(PollConn {
        stream,
        echo: Connection::new(),
        buf_idx,
    });
    match inserted {
        Some(conn_id) => debug!(conn_id, peer = %peer_addr, "Accepted connection"),
        None => {
            // Rejected entry is dropped by the registry, closing the stream.
            warn!(peer = %peer_addr, "Connection limit reached, rejecting");
            buffers.free(buf_idx);
        }
    }

    Ok(())
}

/// One read or one write on a ready connection, per its current state.
fn service_connection(
    conn_id: usize,
    connections: &mut ConnectionRegistry<PollConn>,
    buffers: &mut BufferPool,
) -> io::Result<()> {
    let conn = match connections.get_mut(conn_id) {
        Some(c) => c,
        None => return Ok(()),
    };

    if conn.echo.pending_echo().is_none() {
        // AwaitingRead: pull the next frame.
        let buf = buffers.get_mut(conn.buf_idx);
        let n = match conn.stream.read(buf) {
            Ok(0) => {
                // Orderly disconnect, not a fault.
                debug!(conn_id, "Connection closed by peer");
                close_connection(connections, buffers, conn_id);
                return Ok(());
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        };
        conn.echo.begin_echo(&buffers.get(conn.buf_idx)[..n]);
    }

    // Echoing (possibly entered just above): attempt one write of the
    // remainder. On would-block the connection polls POLLOUT next round.
    flush_once(conn_id, connections, buffers)
}

fn flush_once(
    conn_id: usize,
    connections: &mut ConnectionRegistry<PollConn>,
    buffers: &mut BufferPool,
) -> io::Result<()> {
    let conn = match connections.get_mut(conn_id) {
        Some(c) => c,
        None => return Ok(()),
    };

    let (written, len) = match conn.echo.pending_echo() {
        Some(range) => range,
        None => return Ok(()),
    };

    let buf = buffers.get(conn.buf_idx);
    let n = match conn.stream.write(&buf[written..len]) {
        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
        Ok(n) => n,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
        Err(e) => return Err(e),
    };

    match conn.echo.advance_echo(n) {
        FlushOutcome::Pending => Ok(()),
        FlushOutcome::ReadNext => Ok(()),
        FlushOutcome::Terminate => {
            debug!(conn_id, "Terminator flushed, closing");
            close_connection(connections, buffers, conn_id);
            Ok(())
        }
    }
}

fn close_connection(
    connections: &mut ConnectionRegistry<PollConn>,
    buffers: &mut BufferPool,
    conn_id: usize,
) {
    if let Some(conn) = connections.remove(conn_id) {
        buffers.free(conn.buf_idx);
        drop(conn.stream);
        debug!(conn_id, "Connection closed");
    }
}
