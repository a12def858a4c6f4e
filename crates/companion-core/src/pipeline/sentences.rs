//! Sentence-sized chunks for synthesis.

const TERMINATORS: [char; 4] = ['.', '?', '!', '\n'];

/// Accumulates visible text and releases it once it holds a terminator and is
/// longer than `min_chars`. Short fragments like "Dr." or "Hi!" are held so
/// they are spoken together with what follows.
#[derive(Debug, Clone)]
pub struct SentenceChunker {
    min_chars: usize,
    buffer: String,
}

impl SentenceChunker {
    pub fn new(min_chars: usize) -> Self {
        Self {
            min_chars,
            buffer: String::new(),
        }
    }

    /// Add text; returns a chunk to speak when the buffer is ready.
    pub fn push(&mut self, text: &str) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        self.buffer.push_str(text);
        let trimmed = self.buffer.trim();
        if trimmed.chars().count() > self.min_chars && trimmed.contains(&TERMINATORS[..]) {
            let chunk = trimmed.to_string();
            self.buffer.clear();
            return Some(chunk);
        }
        None
    }

    /// Whatever is left at the end of the stream.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.trim().is_empty()
    }
}
