//! Decoding PTY bytes into text frames.
//!
//! PTY reads split the byte stream at arbitrary points, including the middle
//! of a multi-byte UTF-8 character. [`OutputDecoder`] holds back an
//! incomplete trailing sequence until the rest of it arrives, so the text
//! sent to clients never contains a replacement character that the shell
//! did not actually produce.

/// Stateful UTF-8 decoder for one PTY stream.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    pending: Vec<u8>,
}

impl OutputDecoder {
    /// Creates a decoder with nothing buffered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a chunk, returning all text that is complete so far.
    ///
    /// Invalid sequences are replaced with U+FFFD. May return an empty
    /// string when the whole chunk is the start of a character.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let split = bytes.len() - incomplete_tail_len(&bytes);
        self.pending = bytes.split_off(split);

        match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }

    /// Flushes whatever is still held back.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }

    /// Number of bytes waiting for the rest of a character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Length of a truncated UTF-8 sequence at the end of `bytes`, or 0.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for i in 1..=len.min(3) {
        let byte = bytes[len - i];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return 0,
        };
        return if needed > i { i } else { 0 };
    }
    0
}
