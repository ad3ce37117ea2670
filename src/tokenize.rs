//! Token counting interface. Out of scope for this crate's own
//! implementation per the distillation (tokenizer tables differ per
//! provider and model, and are maintained elsewhere) — this defines
//! the seam the mutator's quota check and user store call through, and
//! a deterministic stub good enough for tests.

use async_trait::async_trait;

use crate::family::{ModelFamily, Service};

#[async_trait]
pub trait Tokenizer: Send + Sync {
    async fn count(&self, service: Service, family: ModelFamily, text: &str) -> u64;
}

/// Whitespace-split approximation. Never used for billing in a real
/// deployment — swapped out for a proper tokenizer at the integration
/// boundary this trait exists to mark.
pub struct ApproximateTokenizer;

#[async_trait]
impl Tokenizer for ApproximateTokenizer {
    async fn count(&self, _service: Service, _family: ModelFamily, text: &str) -> u64 {
        text.split_whitespace().count() as u64
    }
}
