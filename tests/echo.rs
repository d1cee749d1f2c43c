//! End-to-end tests.
//!
//! Each test binds an ephemeral port, runs one backend on a spawned thread,
//! and drives real TCP clients against it. Joining the server thread proves
//! the engine stopped exactly when the last connection closed.

use echoplex::runtime::EngineOptions;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

type Serve = fn(TcpListener, EngineOptions) -> io::Result<()>;

fn opts() -> EngineOptions {
    EngineOptions {
        max_connections: 16,
        frame_size: 256,
    }
}

fn spawn_server(serve: Serve, opts: EngineOptions) -> (SocketAddr, JoinHandle<io::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || serve(listener, opts));
    (addr, handle)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
    stream
}

/// Send a message and assert the echo matches byte for byte.
fn send_echo(stream: &mut TcpStream, msg: &[u8]) {
    stream.write_all(msg).unwrap();
    let mut echoed = vec![0u8; msg.len()];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, msg);
}

/// Assert the server closed the connection (clean EOF or reset).
fn expect_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected close, read {n} bytes"),
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
        Err(e) => panic!("expected close, got error: {e}"),
    }
}

/// Scenario A + B: echoes stay in order, the connection survives ordinary
/// messages, and `bye` closes it after its echo is flushed.
fn run_single_client(serve: Serve) {
    let (addr, handle) = spawn_server(serve, opts());

    let mut client = connect(addr);
    send_echo(&mut client, b"hello\n");
    send_echo(&mut client, b"ping\n");
    send_echo(&mut client, b"bye\n");
    expect_closed(&mut client);

    handle.join().unwrap().unwrap();
}

/// Termination is a prefix match: "byebye" also closes.
fn run_prefix_terminator(serve: Serve) {
    let (addr, handle) = spawn_server(serve, opts());

    let mut client = connect(addr);
    send_echo(&mut client, b"byebye\n");
    expect_closed(&mut client);

    handle.join().unwrap().unwrap();
}

/// Scenario C: the engine stops only after the last of two clients closes.
fn run_two_clients(serve: Serve) {
    let (addr, handle) = spawn_server(serve, opts());

    let mut first = connect(addr);
    send_echo(&mut first, b"ping\n");
    let mut second = connect(addr);
    send_echo(&mut second, b"ping\n");

    // First client leaves; the engine must keep running for the second.
    send_echo(&mut first, b"bye\n");
    expect_closed(&mut first);

    send_echo(&mut second, b"ping\n");
    send_echo(&mut second, b"bye\n");
    expect_closed(&mut second);

    handle.join().unwrap().unwrap();
}

/// Drain completeness: frames queued back to back are all echoed, even when
/// they arrive before the server wakes (one edge, several deliveries).
fn run_pipelined_frames(serve: Serve) {
    let (addr, handle) = spawn_server(serve, opts());

    let mut client = connect(addr);
    client.write_all(b"first\n").unwrap();
    client.write_all(b"second\n").unwrap();

    let mut echoed = vec![0u8; b"first\nsecond\n".len()];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, b"first\nsecond\n");

    send_echo(&mut client, b"bye\n");
    expect_closed(&mut client);

    handle.join().unwrap().unwrap();
}

/// Scenario D: a delivery larger than the frame capacity is echoed in
/// capacity-sized frames, never reassembled, and no byte is lost.
fn run_oversized_delivery(serve: Serve) {
    let (addr, handle) = spawn_server(serve, opts());

    let payload: Vec<u8> = (0..300u32).map(|i| (i % 200) as u8 + 1).collect();

    let mut client = connect(addr);
    client.write_all(&payload).unwrap();

    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, payload);

    send_echo(&mut client, b"bye\n");
    expect_closed(&mut client);

    handle.join().unwrap().unwrap();
}

/// A client that vanishes without `bye` is an orderly disconnect: the
/// engine releases the connection and still stops on drain.
fn run_client_disconnect(serve: Serve) {
    let (addr, handle) = spawn_server(serve, opts());

    let mut client = connect(addr);
    send_echo(&mut client, b"ping\n");
    drop(client);

    handle.join().unwrap().unwrap();
}

/// A listener that starts failing mid-session must not tear down live
/// connections: the engine keeps serving them and stops on drain.
#[cfg(unix)]
fn run_accept_failure(serve: Serve) {
    use std::os::unix::io::AsRawFd;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let listener_fd = listener.as_raw_fd();
    let handle = thread::spawn(move || serve(listener, opts()));

    let mut client = connect(addr);
    send_echo(&mut client, b"ping\n");

    // Replace the listener descriptor with a non-socket so every further
    // accept fails hard (ENOTSOCK).
    let devnull = unsafe { libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDONLY) };
    assert!(devnull >= 0);
    assert_eq!(unsafe { libc::dup2(devnull, listener_fd) }, listener_fd);
    unsafe { libc::close(devnull) };

    send_echo(&mut client, b"ping\n");
    send_echo(&mut client, b"bye\n");
    expect_closed(&mut client);

    handle.join().unwrap().unwrap();
}

/// With a single connection slot, a second client is rejected and closed
/// while the first is unaffected.
fn run_capacity_reject(serve: Serve) {
    let single = EngineOptions {
        max_connections: 1,
        frame_size: 256,
    };
    let (addr, handle) = spawn_server(serve, single);

    let mut first = connect(addr);
    send_echo(&mut first, b"ping\n");

    let mut second = connect(addr);
    expect_closed(&mut second);

    send_echo(&mut first, b"ping\n");
    send_echo(&mut first, b"bye\n");
    expect_closed(&mut first);

    handle.join().unwrap().unwrap();
}

mod blocking_backend {
    use super::*;
    use echoplex::runtime::blocking::serve;

    #[test]
    fn echo_roundtrip() {
        run_single_client(serve);
    }

    #[test]
    fn prefix_terminator() {
        run_prefix_terminator(serve);
    }

    #[test]
    fn stops_after_last_client() {
        run_two_clients(serve);
    }

    #[test]
    fn oversized_delivery() {
        run_oversized_delivery(serve);
    }

    #[test]
    fn rejects_when_full() {
        run_capacity_reject(serve);
    }

    #[test]
    fn disconnect_without_bye() {
        run_client_disconnect(serve);
    }

    #[cfg(unix)]
    #[test]
    fn survives_accept_failure() {
        run_accept_failure(serve);
    }

    /// Many short-lived clients while one stays connected; finished
    /// service threads are reaped along the way and the engine still
    /// stops on the final drain.
    #[test]
    fn sequential_clients() {
        let (addr, handle) = spawn_server(serve, opts());

        let mut anchor = connect(addr);
        send_echo(&mut anchor, b"ping\n");

        for _ in 0..8 {
            let mut client = connect(addr);
            send_echo(&mut client, b"bye\n");
            expect_closed(&mut client);
        }

        send_echo(&mut anchor, b"bye\n");
        expect_closed(&mut anchor);

        handle.join().unwrap().unwrap();
    }
}

#[cfg(unix)]
mod poll_backend {
    use super::*;
    use echoplex::runtime::poll::serve;

    #[test]
    fn echo_roundtrip() {
        run_single_client(serve);
    }

    #[test]
    fn prefix_terminator() {
        run_prefix_terminator(serve);
    }

    #[test]
    fn stops_after_last_client() {
        run_two_clients(serve);
    }

    #[test]
    fn pipelined_frames() {
        run_pipelined_frames(serve);
    }

    #[test]
    fn oversized_delivery() {
        run_oversized_delivery(serve);
    }

    #[test]
    fn rejects_when_full() {
        run_capacity_reject(serve);
    }

    #[test]
    fn disconnect_without_bye() {
        run_client_disconnect(serve);
    }

    #[test]
    fn survives_accept_failure() {
        run_accept_failure(serve);
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod epoll_backend {
    use super::*;
    use echoplex::runtime::epoll::serve;

    #[test]
    fn echo_roundtrip() {
        run_single_client(serve);
    }

    #[test]
    fn prefix_terminator() {
        run_prefix_terminator(serve);
    }

    #[test]
    fn stops_after_last_client() {
        run_two_clients(serve);
    }

    #[test]
    fn pipelined_frames() {
        run_pipelined_frames(serve);
    }

    #[test]
    fn oversized_delivery() {
        run_oversized_delivery(serve);
    }

    #[test]
    fn rejects_when_full() {
        run_capacity_reject(serve);
    }

    #[test]
    fn disconnect_without_bye() {
        run_client_disconnect(serve);
    }
}

#[cfg(target_os = "linux")]
mod uring_backend {
    use super::*;
    use echoplex::runtime::uring::serve;

    /// io_uring may be unavailable (old kernel, seccomp); skip if so.
    fn uring_available() -> bool {
        io_uring::IoUring::new(8).is_ok()
    }

    #[test]
    fn echo_roundtrip() {
        if !uring_available() {
            eprintln!("skipping: io_uring unavailable");
            return;
        }
        run_single_client(serve);
    }

    #[test]
    fn prefix_terminator() {
        if !uring_available() {
            eprintln!("skipping: io_uring unavailable");
            return;
        }
        run_prefix_terminator(serve);
    }

    #[test]
    fn stops_after_last_client() {
        if !uring_available() {
            eprintln!("skipping: io_uring unavailable");
            return;
        }
        run_two_clients(serve);
    }

    #[test]
    fn pipelined_frames() {
        if !uring_available() {
            eprintln!("skipping: io_uring unavailable");
            return;
        }
        run_pipelined_frames(serve);
    }

    #[test]
    fn oversized_delivery() {
        if !uring_available() {
            eprintln!("skipping: io_uring unavailable");
            return;
        }
        run_oversized_delivery(serve);
    }

    #[test]
    fn rejects_when_full() {
        if !uring_available() {
            eprintln!("skipping: io_uring unavailable");
            return;
        }
        run_capacity_reject(serve);
    }

    #[test]
    fn disconnect_without_bye() {
        if !uring_available() {
            eprintln!("skipping: io_uring unavailable");
            return;
        }
        run_client_disconnect(serve);
    }
}
