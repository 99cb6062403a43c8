//! Terminal render sink
//!
//! The assembler always hands over the full accumulated text; the terminal
//! can only append, so each message remembers how much of it was printed.

use std::collections::HashMap;
use std::io::Write;

use parking_lot::Mutex;

use relay_core::{MessageId, MessageRole, RenderSink};

/// Streams assembled messages to stdout
#[derive(Default)]
pub struct ConsoleRenderSink {
    /// Bytes already printed per message
    printed: Mutex<HashMap<MessageId, usize>>,
}

impl ConsoleRenderSink {
    pub fn new() -> Self {
        Self::default()
    }
}

fn label(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "you",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    }
}

impl RenderSink for ConsoleRenderSink {
    fn create(&self, id: &MessageId, role: MessageRole, initial_text: &str) {
        self.printed.lock().insert(id.clone(), initial_text.len());

        let mut out = std::io::stdout().lock();
        let _ = write!(out, "\n{}> {initial_text}", label(role));
        let _ = out.flush();
    }

    fn update(&self, id: &MessageId, full_text: &str) {
        let mut printed = self.printed.lock();
        let offset = printed.entry(id.clone()).or_insert(0);

        // Text only grows; anything else is a redraw we can't do here
        let Some(delta) = full_text.get(*offset..) else {
            return;
        };
        *offset = full_text.len();

        let mut out = std::io::stdout().lock();
        let _ = write!(out, "{delta}");
        let _ = out.flush();
    }

    fn rekey(&self, old_id: &MessageId, new_id: &MessageId) {
        let mut printed = self.printed.lock();
        if let Some(offset) = printed.remove(old_id) {
            printed.insert(new_id.clone(), offset);
        }

        let mut out = std::io::stdout().lock();
        let _ = writeln!(out);
        let _ = out.flush();
    }
}
