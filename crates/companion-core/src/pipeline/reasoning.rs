//! Streaming removal of reasoning regions.
//!
//! Markers may be split across tokens, so any tail of the pending text that
//! could still grow into a marker is held back until the next token decides it.

/// Strips `start … end` regions from a token stream.
#[derive(Debug, Clone)]
pub struct ReasoningFilter {
    start: String,
    end: String,
    inside: bool,
    pending: String,
}

impl ReasoningFilter {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            inside: false,
            pending: String::new(),
        }
    }

    /// Feed a token; returns the text that is now known to be user-facing.
    pub fn push(&mut self, token: &str) -> String {
        self.pending.push_str(token);
        let mut visible = String::new();

        loop {
            if self.inside {
                if let Some(idx) = find_marker(&self.pending, &self.end) {
                    self.pending.drain(..idx + self.end.len());
                    self.inside = false;
                    continue;
                }
                // everything but a possible partial end marker is discarded
                let keep = partial_marker_len(&self.pending, &self.end);
                self.pending.drain(..self.pending.len() - keep);
                break;
            }

            if let Some(idx) = find_marker(&self.pending, &self.start) {
                visible.push_str(&self.pending[..idx]);
                self.pending.drain(..idx + self.start.len());
                self.inside = true;
                continue;
            }
            let keep = partial_marker_len(&self.pending, &self.start);
            let release = self.pending.len() - keep;
            visible.push_str(&self.pending[..release]);
            self.pending.drain(..release);
            break;
        }

        visible
    }

    /// End of stream. Held-back text is released unless a region never closed.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        let inside = std::mem::replace(&mut self.inside, false);
        if inside {
            String::new()
        } else {
            rest
        }
    }

    pub fn is_inside(&self) -> bool {
        self.inside
    }
}

/// Strip reasoning regions from a complete text.
pub fn strip_reasoning(text: &str, start: &str, end: &str) -> String {
    let mut filter = ReasoningFilter::new(start, end);
    let mut out = filter.push(text);
    out.push_str(&filter.finish());
    out
}

fn find_marker(haystack: &str, marker: &str) -> Option<usize> {
    if marker.is_empty() {
        return None;
    }
    haystack.find(marker)
}

/// Length of the longest suffix of `text` that is a proper prefix of `marker`.
fn partial_marker_len(text: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&k| {
            let at = text.len() - k;
            text.is_char_boundary(at) && marker.starts_with(&text[at..])
        })
        .unwrap_or(0)
}
