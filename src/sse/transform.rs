//! Dialect transform — converts a decoded event from its upstream wire
//! dialect into the canonical `openai-chat` shape the aggregator and
//! egress side both expect.
//!
//! Grounded on the teacher's per-provider `adapters` (`openai.rs`,
//! `anthropic.rs`), which already each know their own provider's
//! response shape; here that knowledge is pulled into one transform
//! matrix keyed by `(from, to)` instead of duplicated per adapter.

use serde_json::{json, Value};

use super::{Dialect, SseEvent};

/// Per-stream transform state. Only `anthropic-v1` needs carried state
/// (the running length of previously-emitted text, since that dialect
/// sends cumulative completions rather than deltas); every other
/// dialect transform is a pure function of the single incoming event.
pub struct Transformer {
    from: Dialect,
    to: Dialect,
    last_position: usize,
}

impl Transformer {
    pub fn new(from: Dialect, to: Dialect) -> Self {
        Transformer {
            from,
            to,
            last_position: 0,
        }
    }

    pub fn transform(&mut self, event: SseEvent) -> SseEvent {
        match (self.from, self.to, &event) {
            (_, _, SseEvent::Done) => SseEvent::Done,
            (_, _, SseEvent::Ping) => SseEvent::Ping,
            (Dialect::OpenAiChat, Dialect::OpenAiChat, SseEvent::Data(_)) => event,
            (Dialect::AnthropicV1, Dialect::OpenAiChat, SseEvent::Data(v)) => {
                self.anthropic_v1_suffix_delta(v)
            }
            (Dialect::AnthropicV2, Dialect::OpenAiChat, SseEvent::Data(v))
            | (Dialect::AnthropicChat, Dialect::OpenAiChat, SseEvent::Data(v)) => {
                verbatim_wrap(v)
            }
            (Dialect::OpenAiText, Dialect::OpenAiChat, SseEvent::Data(v)) => openai_text_to_chat(v),
            (Dialect::GoogleAi, Dialect::OpenAiChat, SseEvent::Data(v))
            | (Dialect::Passthrough, Dialect::OpenAiChat, SseEvent::Data(v)) => google_ai_shim(v),
            (_, _, SseEvent::Data(v)) => SseEvent::Data(v.clone()),
        }
    }

    /// Anthropic's legacy `completion` field is cumulative: every event
    /// repeats everything emitted so far plus the new suffix. Emit only
    /// the new suffix as an OpenAI-style delta, tracked by byte length
    /// since the last event (resets per `Transformer` instance, i.e.
    /// per stream).
    fn anthropic_v1_suffix_delta(&mut self, v: &Value) -> SseEvent {
        let full = v.get("completion").and_then(Value::as_str).unwrap_or("");
        let suffix = if full.len() >= self.last_position {
            &full[self.last_position..]
        } else {
            full
        };
        self.last_position = full.len();
        SseEvent::Data(chat_delta(suffix))
    }
}

fn chat_delta(content: &str) -> Value {
    json!({
        "choices": [{
            "delta": { "content": content },
            "index": 0,
            "finish_reason": Value::Null,
        }]
    })
}

/// Anthropic v2/messages-style streams already send incremental text;
/// just relabel the field into the OpenAI delta shape.
fn verbatim_wrap(v: &Value) -> SseEvent {
    let text = v
        .get("delta")
        .and_then(|d| d.get("text"))
        .and_then(Value::as_str)
        .or_else(|| v.get("completion").and_then(Value::as_str))
        .unwrap_or("");
    SseEvent::Data(chat_delta(text))
}

fn openai_text_to_chat(v: &Value) -> SseEvent {
    let text = v
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
        .unwrap_or("");
    SseEvent::Data(chat_delta(text))
}

fn google_ai_shim(v: &Value) -> SseEvent {
    let text = v
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.get(0))
        .and_then(|p| p.get("text"))
        .and_then(Value::as_str)
        .unwrap_or("");
    SseEvent::Data(chat_delta(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_v1_emits_suffix_only_across_events() {
        let mut t = Transformer::new(Dialect::AnthropicV1, Dialect::OpenAiChat);
        let first = t.transform(SseEvent::Data(json!({"completion": "Hello"})));
        let second = t.transform(SseEvent::Data(json!({"completion": "Hello, world"})));

        assert_eq!(
            first,
            SseEvent::Data(chat_delta("Hello"))
        );
        assert_eq!(
            second,
            SseEvent::Data(chat_delta(", world"))
        );
    }

    #[test]
    fn openai_text_maps_choices_text_into_chat_delta() {
        let mut t = Transformer::new(Dialect::OpenAiText, Dialect::OpenAiChat);
        let out = t.transform(SseEvent::Data(json!({"choices": [{"text": "hi"}]})));
        assert_eq!(out, SseEvent::Data(chat_delta("hi")));
    }

    #[test]
    fn google_ai_extracts_nested_candidate_text() {
        let mut t = Transformer::new(Dialect::GoogleAi, Dialect::OpenAiChat);
        let payload = json!({
            "candidates": [{"content": {"parts": [{"text": "bonjour"}]}}]
        });
        let out = t.transform(SseEvent::Data(payload));
        assert_eq!(out, SseEvent::Data(chat_delta("bonjour")));
    }

    #[test]
    fn done_and_ping_pass_through_regardless_of_dialect() {
        let mut t = Transformer::new(Dialect::AnthropicV1, Dialect::OpenAiChat);
        assert_eq!(t.transform(SseEvent::Done), SseEvent::Done);
        assert_eq!(t.transform(SseEvent::Ping), SseEvent::Ping);
    }
}
