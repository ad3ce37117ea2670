//! Byte-stream SSE decoder. Splits an upstream body on blank-line
//! boundaries (`\n\n`), buffering any trailing partial message across
//! chunk boundaries since a provider's TCP segmentation never lines up
//! with event boundaries.

use super::SseEvent;

pub struct Decoder {
    buffer: String,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            buffer: String::new(),
        }
    }

    /// Feed a chunk of bytes, returning every complete event found.
    /// Any trailing partial message stays buffered for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(boundary) = self.buffer.find("\n\n") {
            let message: String = self.buffer.drain(..boundary + 2).collect();
            if let Some(event) = parse_message(message.trim_end_matches("\n\n")) {
                events.push(event);
            }
        }
        events
    }

    /// Called once the upstream body ends. A well-formed stream always
    /// ends on a `\n\n` boundary already flushed by `push`; this only
    /// recovers an event if the upstream dropped the trailing blank
    /// line (see DESIGN.md's resolution of the corresponding open
    /// question).
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.buffer.trim().is_empty() {
            return None;
        }
        let message = std::mem::take(&mut self.buffer);
        parse_message(message.trim_end())
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_message(message: &str) -> Option<SseEvent> {
    for line in message.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            let payload = rest.trim_start();
            if payload == "[DONE]" {
                return Some(SseEvent::Done);
            }
            return serde_json::from_str(payload).ok().map(SseEvent::Data);
        }
        if line.starts_with(':') {
            return Some(SseEvent::Ping);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_full_message_in_one_chunk() {
        let mut decoder = Decoder::new();
        let events = decoder.push(b"data: {\"a\":1}\n\n");
        assert_eq!(events, vec![SseEvent::Data(json!({"a": 1}))]);
    }

    #[test]
    fn buffers_partial_message_across_chunks() {
        let mut decoder = Decoder::new();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        let events = decoder.push(b"1}\n\n");
        assert_eq!(events, vec![SseEvent::Data(json!({"a": 1}))]);
    }

    #[test]
    fn recognizes_done_terminator_and_ping() {
        let mut decoder = Decoder::new();
        let events = decoder.push(b": ping\n\ndata: [DONE]\n\n");
        assert_eq!(events, vec![SseEvent::Ping, SseEvent::Done]);
    }

    #[test]
    fn finish_recovers_trailing_event_missing_blank_line() {
        let mut decoder = Decoder::new();
        assert!(decoder.push(b"data: {\"a\":1}").is_empty());
        let recovered = decoder.finish();
        assert_eq!(recovered, Some(SseEvent::Data(json!({"a": 1}))));
    }
}
