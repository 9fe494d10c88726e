//! Building blocks of the backpressure writer.
//!
//! A payload handed to [`Sender::write`](crate::Sender::write) is wrapped in
//! a [`PendingBuffer`] and consumed one newline-delimited record at a time.
//! The offset only moves forward, so a writer suspended on a refused write
//! resumes at the exact unsent record.

use crate::error::{SenderError, SenderResult};
use base64::Engine;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// The unsent remainder of a multi-record payload.
#[derive(Debug)]
pub struct PendingBuffer {
    data: Vec<u8>,
    offset: usize,
}

impl PendingBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, offset: 0 }
    }

    /// Take the next record, without its line terminator.
    ///
    /// Bytes after the last newline form the final record. A trailing
    /// newline does not produce an empty record.
    pub fn next_record(&mut self) -> Option<&[u8]> {
        if self.is_empty() {
            return None;
        }

        let start = self.offset;
        let end = self.data[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(self.data.len(), |pos| start + pos);

        self.offset = (end + 1).min(self.data.len());
        Some(&self.data[start..end])
    }

    /// Whether every record has been taken.
    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// Bytes not yet taken.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }
}

/// Text encoding of a string chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChunkEncoding {
    #[default]
    Utf8,
    Hex,
    Base64,
}

impl ChunkEncoding {
    /// Decode a string chunk into raw bytes.
    pub fn decode(self, text: &str) -> SenderResult<Vec<u8>> {
        match self {
            ChunkEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
            ChunkEncoding::Hex => {
                hex::decode(text.trim()).map_err(|e| SenderError::Encoding(e.to_string()))
            }
            ChunkEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(text.trim())
                .map_err(|e| SenderError::Encoding(e.to_string())),
        }
    }
}

impl FromStr for ChunkEncoding {
    type Err = SenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(ChunkEncoding::Utf8),
            "hex" => Ok(ChunkEncoding::Hex),
            "base64" => Ok(ChunkEncoding::Base64),
            other => Err(SenderError::Encoding(format!("Unknown encoding: {}", other))),
        }
    }
}

/// Fill `batch` with whole lines until it holds at least `limit` bytes or
/// the reader is exhausted.
///
/// Returns the number of bytes in the batch; 0 means end of input. Only the
/// last batch of the input may end without a newline.
pub async fn read_line_batch<R>(
    reader: &mut R,
    batch: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    batch.clear();
    while batch.len() < limit {
        if reader.read_until(b'\n', batch).await? == 0 {
            break;
        }
    }
    Ok(batch.len())
}
