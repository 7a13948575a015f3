use flate2::{Decompress, FlushDecompress, Status};

use super::events::WirePayload;
use crate::error::GatewayError;

/// Marker the gateway appends (via Z_SYNC_FLUSH) to the final compressed
/// chunk of every message.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Once this many compressed bytes have passed through the accumulator it
/// is replaced with a fresh allocation instead of cleared, so a burst of
/// large payloads cannot pin memory for the connection's lifetime.
pub const DEFAULT_BUFFER_CEILING: usize = 64 * 1024;

/// Streaming decoder for inbound gateway frames.
///
/// Binary frames are chunks of one zlib stream shared across all messages
/// on the connection, so the inflater must persist between messages; only
/// the compressed accumulator is disposable. A message boundary exists
/// only where the accumulated bytes end with `ZLIB_SUFFIX`.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    inflater: Decompress,
    accumulated: usize,
    ceiling: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_ceiling(DEFAULT_BUFFER_CEILING)
    }

    pub fn with_ceiling(ceiling: usize) -> Self {
        Self {
            buffer: Vec::new(),
            inflater: Decompress::new(true),
            accumulated: 0,
            ceiling,
        }
    }

    /// Feed one binary frame. Returns the decoded payload once the chunk
    /// completes a message, `None` while the message is still partial.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Option<WirePayload>, GatewayError> {
        self.buffer.extend_from_slice(chunk);
        self.accumulated += chunk.len();

        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let decompressed = self.inflate_buffer()?;

        if self.accumulated > self.ceiling {
            self.buffer = Vec::new();
            self.accumulated = 0;
        } else {
            self.buffer.clear();
        }

        let payload = serde_json::from_slice(&decompressed)?;
        Ok(Some(payload))
    }

    /// Decode an uncompressed text frame.
    pub fn decode_text(text: &str) -> Result<WirePayload, GatewayError> {
        Ok(serde_json::from_str(text)?)
    }

    fn inflate_buffer(&mut self) -> Result<Vec<u8>, GatewayError> {
        let mut out = Vec::with_capacity((self.buffer.len() * 4).max(1024));
        let mut consumed = 0usize;

        while consumed < self.buffer.len() {
            let in_before = self.inflater.total_in();
            let status =
                self.inflater
                    .decompress_vec(&self.buffer[consumed..], &mut out, FlushDecompress::Sync)?;
            consumed += (self.inflater.total_in() - in_before) as usize;

            match status {
                Status::StreamEnd => break,
                // Output capacity ran out before the input did.
                Status::Ok | Status::BufError => {
                    if consumed < self.buffer.len() {
                        out.reserve(out.capacity().max(1024));
                    }
                }
            }
        }

        Ok(out)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
