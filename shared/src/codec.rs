//! Text codec for session payloads
//!
//! The link carries no framing: every socket read is handed upward as one
//! message, every write is the UTF-8 encoding of one text.
//! ```text
//! write("Hello there!")  ->  [ 12 bytes of UTF-8 ]
//! read() -> 12 bytes     ->  message "Hello there!"
//! ```
//!
//! The transport may split or coalesce writes, so read boundaries are not
//! message boundaries. The decoder only guarantees that a multibyte
//! character cut in half by a read is completed by the next read instead of
//! being mangled.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Errors that can occur while encoding outbound text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Refusing to write an empty message")]
    Empty,
}

/// Encode text for the wire with an explicit size limit
pub fn encode_with_limit(text: &str, max: usize) -> Result<Bytes, CodecError> {
    if text.is_empty() {
        return Err(CodecError::Empty);
    }
    if text.len() > max {
        return Err(CodecError::MessageTooLarge {
            size: text.len(),
            max,
        });
    }
    Ok(Bytes::copy_from_slice(text.as_bytes()))
}

/// Decoder turning raw read chunks into text messages
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    /// Incomplete UTF-8 sequence left over from the previous read
    pending: BytesMut,
}

impl ChunkDecoder {
    /// Create a new decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one read's worth of bytes.
    ///
    /// Returns `None` when the chunk held nothing but the start of a
    /// character still waiting for its remaining bytes. Invalid sequences are
    /// replaced with U+FFFD.
    pub fn decode(&mut self, chunk: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(chunk);

        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));

                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.advance(valid_up_to + len);
                        }
                        None => {
                            // Truncated sequence at the end, wait for more
                            self.pending.advance(valid_up_to);
                            break;
                        }
                    }
                }
            }
        }

        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Flush whatever is left when the stream ends
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}
