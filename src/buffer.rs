//! Receive buffer for the event socket reader

use crate::{
    constants::{BUF_CHUNK, MAX_BUFFER_SIZE},
    error::{EslError, EslResult},
};

/// Growable byte buffer with a read cursor.
///
/// Bytes are appended at the end and consumed from `position`; `compact()`
/// moves the unread tail to the front once consumed data dominates.
#[derive(Debug)]
pub(crate) struct EslBuffer {
    data: Vec<u8>,
    position: usize,
}

impl EslBuffer {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::with_capacity(BUF_CHUNK),
            position: 0,
        }
    }

    /// Number of unread bytes.
    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.position
    }

    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        if self.data.capacity() - self.data.len() < bytes.len() {
            self.data
                .reserve(bytes.len().max(BUF_CHUNK));
        }
        self.data
            .extend_from_slice(bytes);
    }

    pub(crate) fn check_size_limits(&self) -> EslResult<()> {
        if self.len() > MAX_BUFFER_SIZE {
            return Err(EslError::protocol_error(format!(
                "receive buffer holds {} bytes, limit is {}",
                self.len(),
                MAX_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// Consume and return everything before `pattern`, dropping the pattern itself.
    pub(crate) fn extract_until_pattern(&mut self, pattern: &[u8]) -> Option<Vec<u8>> {
        let unread = &self.data[self.position..];
        let found = unread
            .windows(pattern.len())
            .position(|w| w == pattern)?;
        let extracted = unread[..found].to_vec();
        self.position += found + pattern.len();
        Some(extracted)
    }

    /// Consume exactly `count` bytes, or nothing if fewer are buffered.
    pub(crate) fn extract_bytes(&mut self, count: usize) -> Option<Vec<u8>> {
        if self.len() < count {
            return None;
        }
        let start = self.position;
        self.position += count;
        Some(self.data[start..self.position].to_vec())
    }

    pub(crate) fn compact(&mut self) {
        if self.position == 0 {
            return;
        }
        if self.position == self.data.len() {
            self.data
                .clear();
        } else if self.position >= self.data.len() / 2 {
            self.data
                .drain(..self.position);
        } else {
            return;
        }
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_until_pattern_consumes_terminator() {
        let mut buf = EslBuffer::new();
        buf.extend_from_slice(b"Content-Type: command/reply\n\nrest");

        let head = buf
            .extract_until_pattern(b"\n\n")
            .unwrap();
        assert_eq!(head, b"Content-Type: command/reply");
        assert_eq!(buf.len(), 4);
        assert!(buf
            .extract_until_pattern(b"\n\n")
            .is_none());
    }

    #[test]
    fn extract_bytes_waits_for_enough_data() {
        let mut buf = EslBuffer::new();
        buf.extend_from_slice(b"abc");
        assert!(buf
            .extract_bytes(5)
            .is_none());

        buf.extend_from_slice(b"de");
        assert_eq!(buf.extract_bytes(5), Some(b"abcde".to_vec()));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn compact_keeps_unread_tail() {
        let mut buf = EslBuffer::new();
        buf.extend_from_slice(b"xxxxxxxx\n\nyy");
        buf.extract_until_pattern(b"\n\n")
            .unwrap();
        buf.compact();
        assert_eq!(buf.extract_bytes(2), Some(b"yy".to_vec()));
        buf.compact();
        assert_eq!(buf.len(), 0);
    }
}
