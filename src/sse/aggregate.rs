//! Aggregator — accumulates canonicalized `openai-chat` events for one
//! stream and synthesizes the final non-streaming response once the
//! stream ends, in whatever shape the egress side needs.
//!
//! Grounded on the teacher's `adapters::openai` full-response assembly
//! (it already buffers a streaming call into one `GenerateResponse`
//! when the caller didn't ask for streaming) — generalized here to
//! synthesize in three different egress shapes instead of one.

use serde_json::{json, Value};

use super::SseEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressShape {
    /// OpenAI chat completion: reduce all deltas into one message.
    ChatReduce,
    /// OpenAI legacy text completion: concatenate all delta text.
    TextConcatenate,
    /// Anthropic's legacy `/v1/complete`: verbatim text, but the
    /// synthesized response's `log_id` is overridden rather than
    /// carried from any one chunk (see DESIGN.md).
    AnthropicVerbatim { log_id: String },
}

pub struct Aggregator {
    shape: EgressShape,
    content: String,
    saw_done: bool,
    /// Carried from the last chunk that had one, per §4.4 "carrying
    /// `finish_reason` from the last chunk". Falls back to `"stop"` if
    /// no chunk ever carried one (e.g. a dialect whose transform never
    /// threads a real finish reason through).
    finish_reason: Option<String>,
}

impl Aggregator {
    pub fn new(shape: EgressShape) -> Self {
        Aggregator {
            shape,
            content: String::new(),
            saw_done: false,
            finish_reason: None,
        }
    }

    /// Feed one canonicalized (`openai-chat`) event. Pings are ignored;
    /// `Done` marks the stream complete but yields no content itself.
    pub fn push(&mut self, event: &SseEvent) {
        match event {
            SseEvent::Data(v) => {
                let choice = v.get("choices").and_then(|c| c.get(0));
                if let Some(delta) = choice
                    .and_then(|c| c.get("delta"))
                    .and_then(|d| d.get("content"))
                    .and_then(Value::as_str)
                {
                    self.content.push_str(delta);
                }
                if let Some(reason) = choice.and_then(|c| c.get("finish_reason")).and_then(Value::as_str) {
                    self.finish_reason = Some(reason.to_string());
                }
            }
            SseEvent::Done => self.saw_done = true,
            SseEvent::Ping => {}
        }
    }

    pub fn saw_done(&self) -> bool {
        self.saw_done
    }

    /// Synthesize the final response. Idempotent: calling this more
    /// than once with no intervening `push` returns the same value,
    /// since it only reads accumulated state.
    pub fn finish(&self) -> Value {
        let finish_reason = self.finish_reason.as_deref().unwrap_or("stop");
        match &self.shape {
            EgressShape::ChatReduce => json!({
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": self.content },
                    "finish_reason": finish_reason,
                }]
            }),
            EgressShape::TextConcatenate => json!({
                "choices": [{
                    "index": 0,
                    "text": self.content,
                    "finish_reason": finish_reason,
                }]
            }),
            EgressShape::AnthropicVerbatim { log_id } => json!({
                "completion": self.content,
                "stop_reason": "stop_sequence",
                "log_id": log_id,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::transform::Transformer;
    use crate::sse::Dialect;

    fn chat_event(content: &str) -> SseEvent {
        chat_event_with_reason(content, Value::Null)
    }

    fn chat_event_with_reason(content: &str, finish_reason: Value) -> SseEvent {
        SseEvent::Data(json!({
            "choices": [{"delta": {"content": content}, "index": 0, "finish_reason": finish_reason}]
        }))
    }

    #[test]
    fn chat_reduce_concatenates_all_deltas_in_order() {
        let mut agg = Aggregator::new(EgressShape::ChatReduce);
        agg.push(&chat_event("Hello"));
        agg.push(&chat_event(", "));
        agg.push(&chat_event("world"));
        agg.push(&SseEvent::Done);

        assert!(agg.saw_done());
        let final_response = agg.finish();
        assert_eq!(
            final_response["choices"][0]["message"]["content"],
            json!("Hello, world")
        );
        assert_eq!(final_response["choices"][0]["finish_reason"], json!("stop"));
    }

    #[test]
    fn finish_reason_is_carried_from_the_last_chunk_that_has_one() {
        let mut agg = Aggregator::new(EgressShape::ChatReduce);
        agg.push(&chat_event("Hello"));
        agg.push(&chat_event_with_reason("", json!("length")));
        agg.push(&SseEvent::Done);

        let final_response = agg.finish();
        assert_eq!(final_response["choices"][0]["finish_reason"], json!("length"));
    }

    #[test]
    fn text_concatenate_ignores_pings() {
        let mut agg = Aggregator::new(EgressShape::TextConcatenate);
        agg.push(&SseEvent::Ping);
        agg.push(&chat_event("abc"));
        agg.push(&SseEvent::Ping);
        let out = agg.finish();
        assert_eq!(out["choices"][0]["text"], json!("abc"));
    }

    #[test]
    fn aggregates_after_dialect_transform_round_trip() {
        let mut transformer = Transformer::new(Dialect::AnthropicV1, Dialect::OpenAiChat);
        let mut agg = Aggregator::new(EgressShape::AnthropicVerbatim {
            log_id: "synthesized".to_string(),
        });

        let e1 = transformer.transform(SseEvent::Data(json!({"completion": "Bon"})));
        agg.push(&e1);
        let e2 = transformer.transform(SseEvent::Data(json!({"completion": "Bonjour"})));
        agg.push(&e2);
        agg.push(&SseEvent::Done);

        let out = agg.finish();
        assert_eq!(out["completion"], json!("Bonjour"));
        assert_eq!(out["log_id"], json!("synthesized"));
    }
}
