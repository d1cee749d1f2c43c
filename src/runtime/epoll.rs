//! Edge-triggered readiness backend built on mio.
//!
//! Uses epoll on Linux, kqueue on macOS. Readiness fires only on the
//! transition to readable/writable, so every event must be drained to
//! exhaustion: the accept queue is drained until would-block, and each
//! readable connection is read repeatedly until would-block. A serviced
//! read that stops early would strand bytes and stall the connection
//! forever.
//!
//! While an echo is partially flushed the connection's interest switches to
//! WRITABLE; once the flush completes, interest returns to READABLE and any
//! data that arrived in the meantime is drained immediately rather than
//! waiting for an edge that may never fire.

use crate::runtime::connection::{Connection, ConnectionRegistry, FlushOutcome};
use crate::runtime::{BufferPool, EngineOptions};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

struct EdgeConn {
    stream: TcpStream,
    echo: Connection,
    buf_idx: usize,
}

/// Result of a write drain on one connection.
enum WriteStatus {
    /// Echo fully flushed; the connection is back in `AwaitingRead`.
    Flushed,
    /// Socket buffer full; WRITABLE interest registered.
    Blocked,
    /// Connection reached its terminal state and was removed.
    Closed,
}

/// Serve echo clients until the last connection closes.
pub fn serve(listener: std::net::TcpListener, opts: EngineOptions) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    let mut listener = TcpListener::from_std(listener);

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(128);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut buffers = BufferPool::new(opts.max_connections, opts.frame_size);
    let mut connections: ConnectionRegistry<EdgeConn> =
        ConnectionRegistry::new(opts.max_connections);

    info!(
        max_connections = opts.max_connections,
        frame_size = opts.frame_size,
        "Edge-triggered mio backend started"
    );

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(&listener, &mut poll, &mut connections, &mut buffers)?;
                }
                Token(conn_id) => {
                    if let Err(e) = handle_connection_event(
                        conn_id,
                        event,
                        &mut poll,
                        &mut connections,
                        &mut buffers,
                    ) {
                        debug!(conn_id, error = %e, "Connection error");
                        close_connection(&mut poll, &mut connections, &mut buffers, conn_id);
                    }
                }
            }

            if connections.drained() {
                info!("Last connection closed, mio backend done");
                return Ok(());
            }
        }
    }
}

/// Drain the accept queue: a single edge may stand for several pending
/// connections.
fn accept_connections(
    listener: &TcpListener,
    poll: &mut Poll,
    connections: &mut ConnectionRegistry<EdgeConn>,
    buffers: &mut BufferPool,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let buf_idx = match buffers.alloc() {
                    Some(idx) => idx,
                    None => {
                        warn!(peer = %peer_addr, "Buffer pool exhausted, rejecting connection");
                        continue;
                    }
                };

                let inserted = connections.insert(EdgeConn {
                    stream,
                    echo: Connection::new(),
                    buf_idx,
                });
                match inserted {
                    Some(conn_id) => {
                        // Re-borrow after insert to register the stream.
                        let conn = connections.get_mut(conn_id).unwrap();
                        poll.registry().register(
                            &mut conn.stream,
                            Token(conn_id),
                            Interest::READABLE,
                        )?;
                        debug!(conn_id, peer = %peer_addr, "Accepted connection");
                    }
                    None => {
                        warn!(peer = %peer_addr, "Connection limit reached, rejecting");
                        buffers.free(buf_idx);
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Accept error: {}", e);
                break;
            }
        }
    }
    Ok(())
}

fn handle_connection_event(
    conn_id: usize,
    event: &mio::event::Event,
    poll: &mut Poll,
    connections: &mut ConnectionRegistry<EdgeConn>,
    buffers: &mut BufferPool,
) -> io::Result<()> {
    if !connections.contains(conn_id) {
        return Ok(());
    }

    if event.is_writable() {
        handle_writable(conn_id, poll, connections, buffers)?;
    }

    // The flush may have closed the connection.
    if !connections.contains(conn_id) {
        return Ok(());
    }

    if event.is_readable() {
        drain_read(conn_id, poll, connections, buffers)?;
    }

    Ok(())
}

fn handle_writable(
    conn_id: usize,
    poll: &mut Poll,
    connections: &mut ConnectionRegistry<EdgeConn>,
    buffers: &mut BufferPool,
) -> io::Result<()> {
    match drain_write(conn_id, poll, connections, buffers)? {
        WriteStatus::Flushed => {
            if let Some(conn) = connections.get_mut(conn_id) {
                poll.registry()
                    .reregister(&mut conn.stream, Token(conn_id), Interest::READABLE)?;
            }
            // Data may have arrived while interest was WRITABLE; drain it
            // now instead of relying on a fresh edge.
            drain_read(conn_id, poll, connections, buffers)
        }
        WriteStatus::Blocked | WriteStatus::Closed => Ok(()),
    }
}

/// Read frames until would-block, echoing each one as it arrives.
fn drain_read(
    conn_id: usize,
    poll: &mut Poll,
    connections: &mut ConnectionRegistry<EdgeConn>,
    buffers: &mut BufferPool,
) -> io::Result<()> {
    loop {
        let n = {
            let conn = match connections.get_mut(conn_id) {
                Some(c) => c,
                None => return Ok(()),
            };
            if conn.echo.pending_echo().is_some() {
                // An echo is still in flight; reads resume after the flush.
                return Ok(());
            }
            let buf = buffers.get_mut(conn.buf_idx);
            match conn.stream.read(buf) {
                Ok(0) => {
                    // Orderly disconnect, not a fault.
                    debug!(conn_id, "Connection closed by peer");
                    close_connection(poll, connections, buffers, conn_id);
                    return Ok(());
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        {
            let conn = connections.get_mut(conn_id).unwrap();
            let frame = &buffers.get(conn.buf_idx)[..n];
            conn.echo.begin_echo(frame);
        }

        match drain_write(conn_id, poll, connections, buffers)? {
            WriteStatus::Flushed => continue,
            WriteStatus::Blocked | WriteStatus::Closed => return Ok(()),
        }
    }
}

/// Write the pending frame until flushed or would-block.
fn drain_write(
    conn_id: usize,
    poll: &mut Poll,
    connections: &mut ConnectionRegistry<EdgeConn>,
    buffers: &mut BufferPool,
) -> io::Result<WriteStatus> {
    loop {
        let outcome = {
            let conn = match connections.get_mut(conn_id) {
                Some(c) => c,
                None => return Ok(WriteStatus::Closed),
            };
            let (written, len) = match conn.echo.pending_echo() {
                Some(range) => range,
                None => return Ok(WriteStatus::Flushed),
            };
            let buf = buffers.get(conn.buf_idx);
            let n = match conn.stream.write(&buf[written..len]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    poll.registry().reregister(
                        &mut conn.stream,
                        Token(conn_id),
                        Interest::WRITABLE,
                    )?;
                    return Ok(WriteStatus::Blocked);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            conn.echo.advance_echo(n)
        };

        match outcome {
            FlushOutcome::Pending => continue,
            FlushOutcome::ReadNext => return Ok(WriteStatus::Flushed),
            FlushOutcome::Terminate => {
                debug!(conn_id, "Terminator flushed, closing");
                close_connection(poll, connections, buffers, conn_id);
                return Ok(WriteStatus::Closed);
            }
        }
    }
}

fn close_connection(
    poll: &mut Poll,
    connections: &mut ConnectionRegistry<EdgeConn>,
    buffers: &mut BufferPool,
    conn_id: usize,
) {
    if let Some(mut conn) = connections.remove(conn_id) {
        let _ = poll.registry().deregister(&mut conn.stream);
        buffers.free(conn.buf_idx);
        debug!(conn_id, "Connection closed");
    }
}
