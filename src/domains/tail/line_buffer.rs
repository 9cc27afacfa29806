use serde_json::Value;

/// Splits appended bytes into complete lines, holding back an unterminated tail.
#[derive(Debug, Default)]
pub struct LineBuffer {
    remainder: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every newly completed non-blank line, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.remainder.extend_from_slice(bytes);
        let mut lines = Vec::new();
        let mut start = 0;
        for end in memchr::memchr_iter(b'\n', &self.remainder) {
            let mut line = &self.remainder[start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                lines.push(String::from_utf8_lossy(line).into_owned());
            }
            start = end + 1;
        }
        self.remainder.drain(..start);
        lines
    }

    /// Bytes held back because no newline has arrived for them yet.
    pub fn pending_len(&self) -> usize {
        self.remainder.len()
    }

    pub fn clear(&mut self) {
        self.remainder.clear();
    }

    /// Releases the held-back fragment if it is already a whole JSON object or
    /// array, for writers that never terminate their last record.
    pub fn take_complete(&mut self) -> Option<String> {
        if self.remainder.is_empty() {
            return None;
        }
        let value: Value = serde_json::from_slice(&self.remainder).ok()?;
        if !(value.is_object() || value.is_array()) {
            return None;
        }
        let text = String::from_utf8_lossy(&self.remainder).trim().to_string();
        self.remainder.clear();
        Some(text)
    }
}
