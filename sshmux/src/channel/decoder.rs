//! Incremental UTF-8 decoding of channel output.
//!
//! Reads return arbitrary byte ranges, so a multi-byte character can be
//! split across two reads. The decoder keeps an incomplete trailing
//! sequence until the rest arrives and only replaces bytes that can never
//! become valid.

use bytes::{Buf, BytesMut};

/// Decodes a byte stream into text chunk by chunk.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    /// Bytes of a character whose remaining bytes have not arrived yet.
    pending: BytesMut,
}

impl Utf8Decoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `input` (plus held-back bytes) as is complete.
    ///
    /// Invalid sequences are replaced with U+FFFD.
    pub fn decode(&mut self, input: &[u8]) -> String {
        self.pending.extend_from_slice(input);

        let mut out = String::with_capacity(self.pending.len());
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.advance(valid + invalid);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more
                            self.pending.advance(valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush held-back bytes at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }

    /// Number of bytes waiting for the rest of their character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
