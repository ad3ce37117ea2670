//! Prompt logging sink interface. Fire-and-forget by contract: a slow
//! or failing sink must never hold up a request. Out of scope for this
//! crate's own storage implementation, same as `tokenize` — this is
//! the seam an operator wires a real sink into.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::family::{ModelFamily, Service};

#[derive(Debug, Clone, Serialize)]
pub struct PromptLogEntry {
    pub request_id: Uuid,
    pub user_token: Uuid,
    pub service: Service,
    pub family: ModelFamily,
    pub prompt: String,
    pub response: String,
}

#[async_trait]
pub trait PromptLogSink: Send + Sync {
    async fn log(&self, entry: PromptLogEntry);
}

pub struct NoopPromptLogSink;

#[async_trait]
impl PromptLogSink for NoopPromptLogSink {
    async fn log(&self, _entry: PromptLogEntry) {}
}

/// Spawns the log call on its own task so a slow sink never delays the
/// response path that produced the entry.
pub fn log_fire_and_forget(sink: std::sync::Arc<dyn PromptLogSink>, entry: PromptLogEntry) {
    tokio::spawn(async move {
        sink.log(entry).await;
    });
}
