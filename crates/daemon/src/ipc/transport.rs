//! Newline-delimited JSON over a Unix stream, shared by both ends.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use super::IpcError;

/// Longest line either side will accept, newline included.
const MAX_LINE_BYTES: usize = 1024 * 1024;

pub(crate) struct JsonLines {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line: Vec<u8>,
}

impl JsonLines {
    pub(crate) fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            line: Vec::new(),
        }
    }

    /// Reads the next value. `None` means the peer hung up.
    ///
    /// Never buffers more than [`MAX_LINE_BYTES`]; a longer line fails with
    /// [`IpcError::LineTooLong`] and leaves the stream mid-line.
    pub(crate) async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, IpcError> {
        self.line.clear();
        let read = (&mut self.reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut self.line)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if read > MAX_LINE_BYTES {
            return Err(IpcError::LineTooLong(read));
        }
        Ok(Some(serde_json::from_slice(&self.line)?))
    }

    pub(crate) async fn send<T: Serialize>(&mut self, value: &T) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(value)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
