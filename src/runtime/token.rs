//! Operation token tracking for completion correlation.
//!
//! Each submitted operation gets a unique token (the `user_data` value)
//! identifying the operation kind and owning connection when its completion
//! arrives. A token lives exactly as long as one in-flight operation: it is
//! allocated at submission and freed when the completion is consumed.
//!
//! Shutdown is a first-class operation kind rather than a reserved magic
//! key, so a sentinel completion can never be confused with connection I/O.

use slab::Slab;

/// Kind of in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Accept on the listener socket.
    Accept,
    /// Read of the next frame on a connection.
    Read { conn_id: usize },
    /// Write of (part of) an echo frame on a connection.
    Write { conn_id: usize },
    /// Sentinel posted when the last connection closes; consumed exactly
    /// once by the worker to exit its loop.
    Shutdown,
}

/// Allocator for operation tokens with O(1) lookup.
pub struct TokenAllocator {
    ops: Slab<OpKind>,
}

impl TokenAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    /// Allocate a token for an operation about to be submitted.
    pub fn alloc(&mut self, op: OpKind) -> u64 {
        self.ops.insert(op) as u64
    }

    /// Free a token on completion delivery.
    ///
    /// Returns the operation kind that was associated with the token, or
    /// `None` if the token is unknown or already freed.
    pub fn free(&mut self, token: u64) -> Option<OpKind> {
        let idx = token as usize;
        if self.ops.contains(idx) {
            Some(self.ops.remove(idx))
        } else {
            None
        }
    }

    /// Number of operations currently in flight.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_lifecycle() {
        let mut tokens = TokenAllocator::new(8);

        let t1 = tokens.alloc(OpKind::Accept);
        let t2 = tokens.alloc(OpKind::Read { conn_id: 3 });
        assert_eq!(tokens.len(), 2);

        assert_eq!(tokens.free(t2), Some(OpKind::Read { conn_id: 3 }));
        // Double free is rejected.
        assert_eq!(tokens.free(t2), None);

        // Freed slots are reused.
        let t3 = tokens.alloc(OpKind::Write { conn_id: 3 });
        assert_eq!(t3, t2);

        assert_eq!(tokens.free(t1), Some(OpKind::Accept));
        assert_eq!(tokens.free(t3), Some(OpKind::Write { conn_id: 3 }));
        assert!(tokens.is_empty());
    }

    #[test]
    fn test_shutdown_is_distinct() {
        let mut tokens = TokenAllocator::new(8);
        let t = tokens.alloc(OpKind::Shutdown);
        assert_eq!(tokens.free(t), Some(OpKind::Shutdown));
    }
}
