//! Key Pool — holds every configured upstream credential and selects
//! the best one for a given shard on every dispatch.
//!
//! Grounded on the teacher's `pool::mod` (`PoolManager` owning a shared
//! store and picking a key per request) and `pool::registry` (per-key
//! metadata struct), restructured around the selection ordering this
//! system actually needs instead of round-robin: keys that are not
//! currently rate-limited sort first, rate-limited keys break ties by
//! earliest `rate_limited_at` (the one closest to recovering goes back
//! into rotation first), and any remaining tie breaks on the oldest
//! `last_used`.

pub mod probe;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::family::{ModelFamily, Service};
use crate::secret::Secret;

/// How long a freshly-selected key is held back from being selected
/// again, regardless of outcome. Smooths bursts across the pool
/// instead of hammering the same credential back-to-back.
pub const KEY_REUSE_DELAY: Duration = Duration::from_millis(500);

/// How long a key stays out of rotation after a 429.
pub const RATE_LIMIT_LOCKOUT: Duration = Duration::from_millis(2000);

/// Provider-specific fields the pool never inspects — only the mutator
/// building the outbound request for that provider reads these.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProviderExt {
    OpenAi { org_id: Option<String> },
    Aws { region: String, access_key_id: String },
    Anthropic,
    Google,
    Mistral,
}

/// A single upstream credential and its live usage state.
pub struct Key {
    pub service: Service,
    pub families: Vec<ModelFamily>,
    pub secret: Secret,
    pub ext: ProviderExt,
    disabled: AtomicBool,
    pub disabled_reason: RwLock<Option<String>>,
    pub is_trial: bool,
    pub prompt_count: AtomicU64,
    pub token_counts: RwLock<HashMap<ModelFamily, u64>>,
    pub last_used: RwLock<Option<SystemTime>>,
    pub last_checked: RwLock<Option<SystemTime>>,
    pub rate_limited_at: RwLock<Option<SystemTime>>,
    pub rate_limited_until: RwLock<Option<SystemTime>>,
}

impl Key {
    pub fn new(service: Service, families: Vec<ModelFamily>, secret: Secret, ext: ProviderExt) -> Self {
        Key {
            service,
            families,
            secret,
            ext,
            disabled: AtomicBool::new(false),
            disabled_reason: RwLock::new(None),
            is_trial: false,
            prompt_count: AtomicU64::new(0),
            token_counts: RwLock::new(HashMap::new()),
            last_used: RwLock::new(None),
            last_checked: RwLock::new(None),
            rate_limited_at: RwLock::new(None),
            rate_limited_until: RwLock::new(None),
        }
    }

    pub fn hash(&self) -> String {
        self.secret.stable_hash(self.service)
    }

    pub fn supports(&self, family: ModelFamily) -> bool {
        self.families.contains(&family)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(AtomicOrdering::Relaxed)
    }

    async fn is_rate_limited(&self, now: SystemTime) -> bool {
        match *self.rate_limited_until.read().await {
            Some(until) => now < until,
            None => false,
        }
    }

    async fn reuse_throttled(&self, now: SystemTime) -> bool {
        match *self.last_used.read().await {
            Some(last) => match now.duration_since(last) {
                Ok(elapsed) => elapsed < KEY_REUSE_DELAY,
                Err(_) => true,
            },
            None => false,
        }
    }
}

/// Snapshot used only for ordering candidates — avoids holding every
/// key's locks at once while sorting.
struct Candidate {
    index: usize,
    rate_limited: bool,
    rate_limited_at: Option<SystemTime>,
    last_used: Option<SystemTime>,
}

/// Holds every configured key and implements the selection algorithm
/// described above. One `Pool` serves the whole process; shards are a
/// filter over it (`service`, `ModelFamily`), not a separate struct.
pub struct Pool {
    keys: Vec<Arc<Key>>,
}

impl Pool {
    pub fn new(keys: Vec<Key>) -> Self {
        Pool {
            keys: keys.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn list(&self) -> &[Arc<Key>] {
        &self.keys
    }

    /// True if any key for this shard has never been health-checked.
    /// Used by the caller to decide whether to kick off a probe before
    /// serving traffic to a brand new shard.
    pub async fn any_unchecked(&self, service: Service, family: ModelFamily) -> bool {
        for key in self.shard_keys(service, family) {
            if key.last_checked.read().await.is_none() {
                return true;
            }
        }
        false
    }

    fn shard_keys(&self, service: Service, family: ModelFamily) -> impl Iterator<Item = &Arc<Key>> {
        self.keys
            .iter()
            .filter(move |k| !k.is_disabled() && k.service == service && k.supports(family))
    }

    /// Select the best available key for `(service, family)`, per the
    /// total ordering: not-rate-limited keys first; among rate-limited
    /// keys, earliest `rate_limited_at` first; ties broken by oldest
    /// `last_used` (keys never used sort before any that have been).
    /// Keys inside their post-selection reuse throttle are skipped
    /// entirely rather than merely deprioritized, so a hot single-key
    /// shard cannot starve the throttle.
    pub async fn get(&self, service: Service, family: ModelFamily) -> Option<Arc<Key>> {
        let now = SystemTime::now();
        let mut candidates = Vec::new();

        for (index, key) in self.keys.iter().enumerate() {
            if key.is_disabled() || key.service != service || !key.supports(family) {
                continue;
            }
            if key.reuse_throttled(now).await {
                continue;
            }
            candidates.push(Candidate {
                index,
                rate_limited: key.is_rate_limited(now).await,
                rate_limited_at: *key.rate_limited_at.read().await,
                last_used: *key.last_used.read().await,
            });
        }

        candidates.sort_by(|a, b| {
            match (a.rate_limited, b.rate_limited) {
                (false, true) => std::cmp::Ordering::Less,
                (true, false) => std::cmp::Ordering::Greater,
                (true, true) => a.rate_limited_at.cmp(&b.rate_limited_at),
                (false, false) => a.last_used.cmp(&b.last_used),
            }
        });

        let chosen = candidates.into_iter().next()?;
        let key = Arc::clone(&self.keys[chosen.index]);
        *key.last_used.write().await = Some(now);
        Some(key)
    }

    pub async fn mark_rate_limited(&self, key: &Key) {
        let now = SystemTime::now();
        *key.rate_limited_at.write().await = Some(now);
        *key.rate_limited_until.write().await = Some(now + RATE_LIMIT_LOCKOUT);
    }

    pub async fn update_checked(&self, key: &Key) {
        *key.last_checked.write().await = Some(SystemTime::now());
    }

    /// `promptCount++`; `tokenCounts[family] += tokens`. Monotonic for
    /// the life of the process (§3, §8 "Key monotonicity").
    pub async fn increment_usage(&self, key: &Key, family: ModelFamily, tokens: u64) {
        key.prompt_count.fetch_add(1, AtomicOrdering::Relaxed);
        *key.token_counts.write().await.entry(family).or_insert(0) += tokens;
    }

    /// Idempotent; never panics. A disabled key simply stays disabled
    /// and this logs nothing the second time.
    pub async fn disable(&self, key: &Key, reason: impl Into<String>) {
        if key.disabled.swap(true, AtomicOrdering::Relaxed) {
            return;
        }
        let reason = reason.into();
        warn!(key_hash = %key.hash(), reason = %reason, "key disabled");
        *key.disabled_reason.write().await = Some(reason);
    }

    pub fn available(&self, service: Service, family: ModelFamily) -> usize {
        self.keys
            .iter()
            .filter(|k| !k.is_disabled() && k.service == service && k.supports(family))
            .count()
    }

    /// `0` if any enabled key for this shard is not currently
    /// rate-limited, or if no enabled keys exist at all — the latter
    /// lets the admission layer surface a clean `NoAvailableKey`
    /// instead of stalling the queue on a lockout that will never
    /// clear. Otherwise the soonest `rateLimitedUntil` across enabled
    /// keys, as a duration from now.
    pub async fn get_lockout_period(&self, service: Service, family: ModelFamily) -> Duration {
        let now = SystemTime::now();
        let mut soonest: Option<SystemTime> = None;
        let mut any_enabled = false;

        for key in self.shard_keys(service, family) {
            any_enabled = true;
            if !key.is_rate_limited(now).await {
                return Duration::ZERO;
            }
            let until = key.rate_limited_until.read().await.unwrap_or(now);
            soonest = Some(match soonest {
                Some(current) => current.min(until),
                None => until,
            });
        }

        if !any_enabled {
            return Duration::ZERO;
        }
        match soonest {
            Some(until) => until.duration_since(now).unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        }
    }

    /// Redacted snapshots for every key — secret elided, suitable for
    /// an admin listing.
    pub async fn list_redacted(&self) -> Vec<KeySnapshot> {
        let mut out = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            out.push(KeySnapshot {
                hash: key.hash(),
                service: key.service,
                families: key.families.clone(),
                is_disabled: key.is_disabled(),
                is_trial: key.is_trial,
                prompt_count: key.prompt_count.load(AtomicOrdering::Relaxed),
                token_counts: key.token_counts.read().await.clone(),
                last_used: *key.last_used.read().await,
            });
        }
        out
    }
}

/// Secret-free view of a `Key`, safe to serialize for an admin listing.
#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    pub hash: String,
    pub service: Service,
    pub families: Vec<ModelFamily>,
    pub is_disabled: bool,
    pub is_trial: bool,
    pub prompt_count: u64,
    pub token_counts: HashMap<ModelFamily, u64>,
    pub last_used: Option<SystemTime>,
}

pub fn unix_time(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(service: Service, family: ModelFamily) -> Key {
        Key::new(service, vec![family], Secret::new("sk-test"), ProviderExt::Anthropic)
    }

    #[tokio::test]
    async fn not_rate_limited_keys_sort_before_rate_limited() {
        let a = key(Service::Anthropic, ModelFamily::Claude);
        let b = key(Service::Anthropic, ModelFamily::Claude);
        let pool = Pool::new(vec![a, b]);

        pool.mark_rate_limited(&pool.list()[0]).await;

        let picked = pool
            .get(Service::Anthropic, ModelFamily::Claude)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&picked, &pool.list()[1]));
    }

    #[tokio::test]
    async fn among_rate_limited_earliest_rate_limited_at_wins() {
        let a = key(Service::Anthropic, ModelFamily::Claude);
        let b = key(Service::Anthropic, ModelFamily::Claude);
        let pool = Pool::new(vec![a, b]);

        pool.mark_rate_limited(&pool.list()[0]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.mark_rate_limited(&pool.list()[1]).await;

        // Force both still "rate limited" by re-extending lockout far out,
        // keeping rate_limited_at ordering intact.
        *pool.list()[0].rate_limited_until.write().await =
            Some(SystemTime::now() + Duration::from_secs(60));
        *pool.list()[1].rate_limited_until.write().await =
            Some(SystemTime::now() + Duration::from_secs(60));

        let picked = pool
            .get(Service::Anthropic, ModelFamily::Claude)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&picked, &pool.list()[0]));
    }

    #[tokio::test]
    async fn reuse_throttle_skips_just_used_key() {
        let a = key(Service::OpenAi, ModelFamily::Turbo);
        let pool = Pool::new(vec![a]);

        let first = pool.get(Service::OpenAi, ModelFamily::Turbo).await;
        assert!(first.is_some());

        let second = pool.get(Service::OpenAi, ModelFamily::Turbo).await;
        assert!(second.is_none(), "single key inside reuse delay must not be reselected");
    }

    #[tokio::test]
    async fn disabled_and_wrong_family_keys_are_never_candidates() {
        let a = key(Service::OpenAi, ModelFamily::Turbo);
        a.disabled.store(true, AtomicOrdering::Relaxed);
        let b = key(Service::OpenAi, ModelFamily::Gpt4);
        let pool = Pool::new(vec![a, b]);

        assert!(pool.get(Service::OpenAi, ModelFamily::Turbo).await.is_none());
        assert!(pool.get(Service::OpenAi, ModelFamily::Gpt4).await.is_some());
    }

    #[tokio::test]
    async fn disable_is_idempotent_and_never_selected_again() {
        let a = key(Service::OpenAi, ModelFamily::Turbo);
        let pool = Pool::new(vec![a]);

        pool.disable(&pool.list()[0], "401 from upstream").await;
        pool.disable(&pool.list()[0], "401 from upstream").await;

        assert!(pool.list()[0].is_disabled());
        assert!(pool.get(Service::OpenAi, ModelFamily::Turbo).await.is_none());
    }

    #[tokio::test]
    async fn lockout_period_is_zero_when_no_enabled_keys_exist() {
        let a = key(Service::OpenAi, ModelFamily::Turbo);
        let pool = Pool::new(vec![a]);
        pool.disable(&pool.list()[0], "401").await;

        assert_eq!(
            pool.get_lockout_period(Service::OpenAi, ModelFamily::Turbo).await,
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn lockout_period_is_zero_while_any_enabled_key_is_clear() {
        let a = key(Service::OpenAi, ModelFamily::Turbo);
        let b = key(Service::OpenAi, ModelFamily::Turbo);
        let pool = Pool::new(vec![a, b]);
        pool.mark_rate_limited(&pool.list()[0]).await;

        assert_eq!(
            pool.get_lockout_period(Service::OpenAi, ModelFamily::Turbo).await,
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn incrementing_usage_is_per_family_and_monotonic() {
        let a = key(Service::OpenAi, ModelFamily::Turbo);
        let pool = Pool::new(vec![a]);
        let key = Arc::clone(&pool.list()[0]);

        pool.increment_usage(&key, ModelFamily::Turbo, 10).await;
        pool.increment_usage(&key, ModelFamily::Turbo, 5).await;

        assert_eq!(key.prompt_count.load(AtomicOrdering::Relaxed), 2);
        assert_eq!(*key.token_counts.read().await.get(&ModelFamily::Turbo).unwrap(), 15);
    }
}
