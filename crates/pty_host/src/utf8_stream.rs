use encoding_rs::{Decoder, UTF_8};

/// Decodes terminal output read in arbitrary chunks. A multi-byte sequence
/// split across reads is held back until its remaining bytes arrive; malformed
/// bytes become U+FFFD.
pub struct Utf8Stream {
    decoder: Decoder,
}

impl Default for Utf8Stream {
    fn default() -> Self {
        Self {
            decoder: UTF_8.new_decoder_without_bom_handling(),
        }
    }
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.decode_inner(chunk, false)
    }

    /// Text still held back at end of stream, if any.
    pub fn finish(&mut self) -> Option<String> {
        Some(self.decode_inner(&[], true)).filter(|rest| !rest.is_empty())
    }

    fn decode_inner(&mut self, chunk: &[u8], last: bool) -> String {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(chunk.len())
            .unwrap_or(chunk.len() * 3 + 4);
        let mut text = String::with_capacity(capacity);
        let _ = self.decoder.decode_to_string(chunk, &mut text, last);
        text
    }
}
