//! Blocking per-connection backend.
//!
//! One service thread per client performing blocking reads and full writes;
//! the simplest of the notification strategies. The accept loop itself uses
//! a non-blocking listener with a short probe interval so it can observe
//! the stop condition: at least one client served and none remaining.

use crate::runtime::EngineOptions;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Interval between accept probes while waiting for work or drain.
const ACCEPT_PROBE: Duration = Duration::from_millis(10);

/// Serve echo clients until the last connection closes.
pub fn serve(listener: TcpListener, opts: EngineOptions) -> io::Result<()> {
    listener.set_nonblocking(true)?;

    let active = Arc::new(AtomicUsize::new(0));
    let mut accepted: u64 = 0;
    let mut handles = Vec::new();

    info!(
        max_connections = opts.max_connections,
        frame_size = opts.frame_size,
        "Blocking backend started"
    );

    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if active.load(Ordering::SeqCst) >= opts.max_connections {
                    warn!(peer = %peer_addr, "Connection limit reached, rejecting");
                    drop(stream);
                    continue;
                }

                // Per-connection I/O is fully blocking.
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(peer = %peer_addr, error = %e, "Rejecting connection");
                    continue;
                }

                accepted += 1;
                active.fetch_add(1, Ordering::SeqCst);
                debug!(peer = %peer_addr, "Accepted connection");

                let worker_active = Arc::clone(&active);
                let frame_size = opts.frame_size;
                let spawned = thread::Builder::new()
                    .name(format!("echo-client-{accepted}"))
                    .spawn(move || {
                        serve_client(stream, frame_size);
                        worker_active.fetch_sub(1, Ordering::SeqCst);
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        // The unspawned closure is dropped, closing the stream.
                        warn!(peer = %peer_addr, error = %e, "Failed to spawn service thread");
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if accepted > 0 && active.load(Ordering::SeqCst) == 0 {
                    break;
                }
                // Reap service threads that have already finished.
                handles.retain(|h| !h.is_finished());
                thread::sleep(ACCEPT_PROBE);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // ECONNABORTED and kin: the handshake failed, not the engine.
                error!("Accept error: {}", e);
                if accepted > 0 && active.load(Ordering::SeqCst) == 0 {
                    break;
                }
                thread::sleep(ACCEPT_PROBE);
            }
        }
    }

    for handle in handles {
        let _ = handle.join();
    }

    info!("Last connection closed, blocking backend done");
    Ok(())
}

/// Echo frames back until the client disconnects or sends the terminator.
fn serve_client(mut stream: TcpStream, frame_size: usize) {
    let mut buf = vec![0u8; frame_size];

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                debug!("Client disconnected");
                break;
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Read error");
                break;
            }
        };

        if let Err(e) = stream.write_all(&buf[..n]) {
            debug!(error = %e, "Write error");
            break;
        }

        if crate::protocol::is_terminator(&buf[..n]) {
            debug!("Terminator received, closing");
            break;
        }
    }
}
