//! Reasoning tag scanner
//!
//! Splits streamed text into a visible part and a reasoning part delimited by
//! an open/close tag pair (`<think>` / `</think>` by default). The scanner is
//! incremental: whether it is inside a reasoning block survives across chunk
//! boundaries, and a delimiter split across two chunks is still recognized
//! because any trailing text that could be the start of a delimiter is held
//! back until the next chunk decides it.
//!
//! ```text
//!   feed("<think>ab")     -> reasoning "ab"
//!   feed("cd</th")        -> reasoning "cd"      (holds "</th")
//!   feed("ink>ef")        -> visible   "ef"
//! ```

/// Text produced by one scanner step
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanOutput {
    /// Text outside reasoning delimiters
    pub visible: String,
    /// Text inside reasoning delimiters
    pub reasoning: String,
}

impl ScanOutput {
    /// Whether the step produced nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.visible.is_empty() && self.reasoning.is_empty()
    }
}

/// Incremental visible/reasoning splitter
#[derive(Clone, Debug)]
pub struct ReasoningScanner {
    open_tag: String,
    close_tag: String,
    inside: bool,
    /// Possible delimiter prefix carried to the next chunk
    pending: String,
}

impl Default for ReasoningScanner {
    fn default() -> Self {
        Self::new("<think>", "</think>")
    }
}

impl ReasoningScanner {
    /// Create a scanner for a delimiter pair
    pub fn new(open_tag: impl Into<String>, close_tag: impl Into<String>) -> Self {
        Self {
            open_tag: open_tag.into(),
            close_tag: close_tag.into(),
            inside: false,
            pending: String::new(),
        }
    }

    /// Whether the scanner is currently inside a reasoning block
    #[must_use]
    pub fn is_inside(&self) -> bool {
        self.inside
    }

    /// Classify the next chunk of text
    pub fn feed(&mut self, chunk: &str) -> ScanOutput {
        let mut output = ScanOutput::default();
        let mut buffer = std::mem::take(&mut self.pending);
        buffer.push_str(chunk);

        let mut rest = buffer.as_str();
        loop {
            let tag = self.active_tag();
            match rest.find(tag) {
                Some(index) => {
                    self.emit(&mut output, &rest[..index]);
                    rest = &rest[index + tag.len()..];
                    self.inside = !self.inside;
                }
                None => {
                    let held = partial_suffix(rest, tag);
                    let split = rest.len() - held;
                    self.emit(&mut output, &rest[..split]);
                    self.pending = rest[split..].to_string();
                    break;
                }
            }
        }

        output
    }

    /// Release any held-back text at the end of the stream
    ///
    /// An unterminated delimiter prefix is ordinary text.
    pub fn flush(&mut self) -> ScanOutput {
        let mut output = ScanOutput::default();
        let pending = std::mem::take(&mut self.pending);
        self.emit(&mut output, &pending);
        output
    }

    fn active_tag(&self) -> &str {
        if self.inside {
            &self.close_tag
        } else {
            &self.open_tag
        }
    }

    fn emit(&self, output: &mut ScanOutput, text: &str) {
        if self.inside {
            output.reasoning.push_str(text);
        } else {
            output.visible.push_str(text);
        }
    }
}

/// Length of the longest proper prefix of `tag` that `text` ends with
fn partial_suffix(text: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&len| {
            let start = text.len() - len;
            text.is_char_boundary(start) && tag.starts_with(&text[start..])
        })
        .unwrap_or(0)
}
