//! Bounded scrollback buffer.

use std::collections::VecDeque;

/// Default scrollback capacity in bytes.
pub const DEFAULT_SCROLLBACK_BYTES: usize = 50 * 1024;

/// Recent terminal output kept for replay to reconnecting clients.
///
/// Holds at most `capacity` bytes of UTF-8 text. When full, the oldest
/// bytes are dropped from the front, and the cut is moved forward to the
/// next character boundary so the buffer always decodes cleanly.
#[derive(Debug)]
pub struct Scrollback {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl Scrollback {
    /// Creates an empty buffer holding up to `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(DEFAULT_SCROLLBACK_BYTES)),
            capacity,
        }
    }

    /// Appends text, trimming the oldest output if needed.
    pub fn push(&mut self, text: &str) {
        if text.len() >= self.capacity {
            let mut start = text.len() - self.capacity;
            while !text.is_char_boundary(start) {
                start += 1;
            }
            self.buf.clear();
            self.buf.extend(&text.as_bytes()[start..]);
            return;
        }

        self.buf.extend(text.as_bytes());
        if self.buf.len() > self.capacity {
            let excess = self.buf.len() - self.capacity;
            self.buf.drain(..excess);
            while matches!(self.buf.front(), Some(b) if b & 0b1100_0000 == 0b1000_0000) {
                self.buf.pop_front();
            }
        }
    }

    /// Returns the buffered text.
    pub fn contents(&self) -> String {
        let (front, back) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(self.buf.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }

    /// Number of bytes currently held.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK_BYTES)
    }
}
