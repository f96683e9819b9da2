//! Accumulation buffer for the incremental frame parser.

use crate::constants::MAX_BUFFER_SIZE;
use crate::error::{Error, Result};

/// Byte buffer with a read cursor.
///
/// Incoming socket reads are appended at the tail; the frame parser consumes
/// from the head via [`take_until`](Self::take_until) and
/// [`take_bytes`](Self::take_bytes). Consumed bytes are reclaimed lazily.
pub(crate) struct FrameBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            pos: 0,
        }
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Unconsumed byte count.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Guard against a peer (or a desynced stream) growing the buffer
    /// without ever producing a complete frame.
    pub fn check_size_limit(&self) -> Result<()> {
        if self.remaining() > MAX_BUFFER_SIZE {
            return Err(Error::framing(format!(
                "parse buffer exceeded {} bytes without a complete frame",
                MAX_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// Take all bytes up to `pattern`, consuming the pattern too.
    /// Returns `None` if the pattern has not arrived yet.
    pub fn take_until(&mut self, pattern: &[u8]) -> Option<Vec<u8>> {
        let haystack = &self.data[self.pos..];
        let at = haystack
            .windows(pattern.len())
            .position(|window| window == pattern)?;
        let taken = haystack[..at].to_vec();
        self.pos += at + pattern.len();
        self.compact();
        Some(taken)
    }

    /// Take exactly `n` bytes, or `None` if fewer have arrived.
    pub fn take_bytes(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.remaining() < n {
            return None;
        }
        let taken = self.data[self.pos..self.pos + n].to_vec();
        self.pos += n;
        self.compact();
        Some(taken)
    }

    /// Reclaim consumed space once the dead prefix dominates the buffer.
    fn compact(&mut self) {
        if self.pos > 4096 && self.pos * 2 > self.data.len() {
            self.data.drain(..self.pos);
            self.pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_until_consumes_pattern() {
        let mut buf = FrameBuffer::new();
        buf.extend_from_slice(b"Header: value\n\nrest");
        let taken = buf.take_until(b"\n\n").unwrap();
        assert_eq!(taken, b"Header: value");
        assert_eq!(buf.remaining(), 4);
        assert_eq!(buf.take_bytes(4).unwrap(), b"rest");
    }

    #[test]
    fn take_until_none_when_pattern_absent() {
        let mut buf = FrameBuffer::new();
        buf.extend_from_slice(b"partial header");
        assert!(buf.take_until(b"\n\n").is_none());
        assert_eq!(buf.remaining(), 14);
    }

    #[test]
    fn take_bytes_waits_for_enough_data() {
        let mut buf = FrameBuffer::new();
        buf.extend_from_slice(b"abc");
        assert!(buf.take_bytes(5).is_none());
        buf.extend_from_slice(b"de");
        assert_eq!(buf.take_bytes(5).unwrap(), b"abcde");
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn size_limit_enforced() {
        let mut buf = FrameBuffer::new();
        buf.extend_from_slice(&vec![b'x'; MAX_BUFFER_SIZE + 1]);
        assert!(buf.check_size_limit().is_err());
    }
}
