//! Echo protocol semantics.
//!
//! The wire format is deliberately framing-free: whatever one read call
//! returns (up to the frame capacity) is echoed back verbatim. The only
//! application-level rule is the termination keyword.

/// Default capacity of a single echo frame, in bytes.
///
/// Reads are truncated to this size per read call; larger client sends are
/// echoed across multiple frames, never reassembled.
pub const DEFAULT_FRAME_SIZE: usize = 256;

/// Termination keyword.
const TERMINATOR: &[u8] = b"bye";

/// Check whether a received frame requests connection termination.
///
/// The first three bytes are compared against `bye`. This is a prefix match:
/// a frame beginning `byebye` also terminates. Prefix semantics are
/// intentional and covered by tests.
pub fn is_terminator(frame: &[u8]) -> bool {
    frame.len() >= TERMINATOR.len() && &frame[..TERMINATOR.len()] == TERMINATOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminator_detection() {
        assert!(is_terminator(b"bye\n"));
        assert!(is_terminator(b"bye"));
        assert!(!is_terminator(b"hello\n"));
        assert!(!is_terminator(b"ping\n"));
    }

    #[test]
    fn test_terminator_prefix_match() {
        // Prefix match is intentional: anything starting with "bye" closes.
        assert!(is_terminator(b"byebye\n"));
        assert!(is_terminator(b"byeXYZ"));
    }

    #[test]
    fn test_terminator_short_frames() {
        assert!(!is_terminator(b""));
        assert!(!is_terminator(b"b"));
        assert!(!is_terminator(b"by"));
        assert!(!is_terminator(b"BYE\n")); // case-sensitive
    }
}
