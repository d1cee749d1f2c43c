//! Connection state machine and registry.
//!
//! The echo state machine is shared by every backend: blocking, readiness
//! (level- and edge-triggered), and completion. A backend borrows a
//! connection for one transition at a time and never holds a reference
//! across a suspension point.

use crate::protocol;
use slab::Slab;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the next frame from the client.
    AwaitingRead,
    /// Flushing an echo reply, possibly across several partial writes.
    Echoing {
        /// Bytes of the frame already written back.
        written: usize,
        /// Total bytes in the frame.
        len: usize,
    },
    /// Echo of a terminating frame flushed; transport teardown in progress.
    Closing,
    /// Terminal state; resources released.
    Closed,
}

/// Outcome of advancing a partially flushed echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Bytes remain in the outbound frame; stay in `Echoing`.
    Pending,
    /// Frame fully flushed; issue the next read.
    ReadNext,
    /// Frame fully flushed and the terminator was seen; close the transport.
    Terminate,
}

/// Per-client echo state machine.
///
/// Would-block conditions never reach this type: they mean "no transition
/// now" and are absorbed by the backend's event loop.
#[derive(Debug)]
pub struct Connection {
    state: ConnState,
    terminate_after_flush: bool,
}

impl Connection {
    /// Create a connection in the initial reading state.
    pub fn new() -> Self {
        Self {
            state: ConnState::AwaitingRead,
            terminate_after_flush: false,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// A frame of `frame.len()` bytes arrived: transition to `Echoing`.
    ///
    /// Sets `terminate_after_flush` if the frame starts with the
    /// termination keyword.
    pub fn begin_echo(&mut self, frame: &[u8]) {
        debug_assert!(matches!(self.state, ConnState::AwaitingRead));
        self.terminate_after_flush = protocol::is_terminator(frame);
        self.state = ConnState::Echoing {
            written: 0,
            len: frame.len(),
        };
    }

    /// Record that `n` more bytes of the current frame were written.
    pub fn advance_echo(&mut self, n: usize) -> FlushOutcome {
        let (written, len) = match self.state {
            ConnState::Echoing { written, len } => (written + n, len),
            _ => return FlushOutcome::Pending,
        };

        if written < len {
            self.state = ConnState::Echoing { written, len };
            return FlushOutcome::Pending;
        }

        if self.terminate_after_flush {
            self.state = ConnState::Closing;
            FlushOutcome::Terminate
        } else {
            self.state = ConnState::AwaitingRead;
            self.terminate_after_flush = false;
            FlushOutcome::ReadNext
        }
    }

    /// Unsent byte range of the current frame, if an echo is in flight.
    pub fn pending_echo(&self) -> Option<(usize, usize)> {
        match self.state {
            ConnState::Echoing { written, len } => Some((written, len)),
            _ => None,
        }
    }

    /// Orderly disconnect or transport fault: go straight to `Closed`.
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of live connections with a fixed capacity.
///
/// Slab-backed: O(1) insert, lookup, and remove, with ids reused only after
/// full teardown. The active count is the slab length, so the
/// `active_count == |connections|` invariant holds by construction.
///
/// Generic over the backend's per-connection entry type so each backend can
/// attach its own transport handle and buffer bookkeeping.
pub struct ConnectionRegistry<C> {
    connections: Slab<C>,
    max_connections: usize,
    /// Total connections ever accepted; the engine stops only after this
    /// has become nonzero and the registry is empty again.
    accepted: u64,
}

impl<C> ConnectionRegistry<C> {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
            accepted: 0,
        }
    }

    /// Insert a new connection, returning its id.
    ///
    /// Returns `None` when the registry is at capacity; the caller must
    /// close the rejected endpoint.
    pub fn insert(&mut self, conn: C) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        self.accepted += 1;
        Some(self.connections.insert(conn))
    }

    pub fn get(&self, id: usize) -> Option<&C> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut C> {
        self.connections.get_mut(id)
    }

    /// Remove a connection on terminal close.
    pub fn remove(&mut self, id: usize) -> Option<C> {
        if self.connections.contains(id) {
            Some(self.connections.remove(id))
        } else {
            None
        }
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// True exactly when the last connection has closed: at least one was
    /// accepted and none remain. This is the engine's stop condition.
    pub fn drained(&self) -> bool {
        self.accepted > 0 && self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &C)> {
        self.connections.iter()
    }
}
