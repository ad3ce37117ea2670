//! Secret wrapper for upstream API credentials.
//!
//! Grounded on the teacher's `vault` module, which already treats
//! provider credentials as material to scrub from memory on drop. Here
//! there is no at-rest encrypted store (keys arrive via config), so
//! only the in-memory hygiene survives: the zeroize-on-drop wrapper and
//! the stable hash used for logging and deduplication.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::family::Service;

/// An API credential. Never `Debug`/`Display`s its contents; `Drop`
/// zeroizes the backing buffer.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Stable, non-reversible identifier for this credential, safe to
    /// log or use as a map key. Provider-tagged so identical secret
    /// material under two services never collides.
    pub fn stable_hash(&self, service: Service) -> String {
        let mut hasher = Sha256::new();
        hasher.update(service.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(self.0.as_bytes());
        let digest = hasher.finalize();
        format!("{}-{}", service, hex::encode(&digest[..8]))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_is_deterministic_and_provider_tagged() {
        let a = Secret::new("sk-abc123");
        let b = Secret::new("sk-abc123");
        assert_eq!(a.stable_hash(Service::OpenAi), b.stable_hash(Service::OpenAi));
        assert_ne!(
            a.stable_hash(Service::OpenAi),
            a.stable_hash(Service::Anthropic)
        );
    }

    #[test]
    fn debug_never_leaks_secret_material() {
        let s = Secret::new("sk-super-secret");
        let rendered = format!("{:?}", s);
        assert!(!rendered.contains("super-secret"));
    }
}
