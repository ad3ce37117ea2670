//! SSE decode / dialect transform / aggregation.
//!
//! Grounded on the teacher's `adapters::openai` streaming response
//! handling (byte-chunk accumulation, `data:` line parsing) and the
//! `eventsource`-style boundary splitting seen in the broader corpus's
//! HTTP dispatch layer — here generalized to the five wire dialects
//! each upstream speaks and a canonical internal representation.

pub mod aggregate;
pub mod decode;
pub mod transform;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The wire dialect of a stream, named for the upstream that produces
/// it. `OpenAiChat` is also the crate's canonical internal dialect —
/// every other dialect gets transformed into it before aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    OpenAiChat,
    OpenAiText,
    AnthropicV1,
    AnthropicV2,
    AnthropicChat,
    GoogleAi,
    Passthrough,
}

/// One decoded SSE message. `Done` represents the literal `[DONE]`
/// terminator frame; `Ping` a keep-alive comment frame with no payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Data(Value),
    Done,
    Ping,
}

impl SseEvent {
    pub fn to_wire(&self) -> String {
        match self {
            SseEvent::Data(v) => format!("data: {}\n\n", v),
            SseEvent::Done => "data: [DONE]\n\n".to_string(),
            SseEvent::Ping => ": ping\n\n".to_string(),
        }
    }
}
