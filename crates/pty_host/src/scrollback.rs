pub const DEFAULT_MAX_CHARS: usize = 50_000;
pub const DEFAULT_TRIM_CHARS: usize = 40_000;

/// Bounded terminal history replayed to late subscribers.
///
/// Once the buffer grows past `max_chars` it is cut back to the most recent
/// `trim_chars` characters, so trimming happens in batches instead of on
/// every chunk.
#[derive(Debug, Clone)]
pub struct Scrollback {
    text: String,
    chars: usize,
    max_chars: usize,
    trim_chars: usize,
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHARS, DEFAULT_TRIM_CHARS)
    }
}

impl Scrollback {
    pub fn new(max_chars: usize, trim_chars: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            max_chars,
            trim_chars: trim_chars.min(max_chars),
        }
    }

    pub fn push(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.text.push_str(chunk);
        self.chars += chunk.chars().count();

        if self.chars > self.max_chars {
            let drop_chars = self.chars - self.trim_chars;
            let cut = self
                .text
                .char_indices()
                .nth(drop_chars)
                .map(|(idx, _)| idx)
                .unwrap_or(self.text.len());
            self.text.drain(..cut);
            self.chars = self.trim_chars;
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn char_len(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_everything_under_the_cap() {
        let mut buffer = Scrollback::new(10, 6);
        buffer.push("hello");
        buffer.push("world");
        assert_eq!(buffer.as_str(), "helloworld");
        assert_eq!(buffer.char_len(), 10);
    }

    #[test]
    fn trims_to_most_recent_when_cap_exceeded() {
        let mut buffer = Scrollback::default();
        buffer.push(&"a".repeat(DEFAULT_MAX_CHARS));
        assert_eq!(buffer.char_len(), DEFAULT_MAX_CHARS);

        buffer.push("bc");
        assert_eq!(buffer.char_len(), DEFAULT_TRIM_CHARS);
        assert_eq!(buffer.as_str().len(), DEFAULT_TRIM_CHARS);
        assert!(buffer.as_str().ends_with("abc"));
    }

    #[test]
    fn trimming_respects_multibyte_boundaries() {
        let mut buffer = Scrollback::new(4, 2);
        buffer.push("ééé");
        buffer.push("ü🌟");
        assert_eq!(buffer.as_str(), "ü🌟");
        assert_eq!(buffer.char_len(), 2);
    }
}
