//! User store — tracks per-token identity, IP provenance and quota
//! consumption. Out-of-scope for deep testing per the distillation's
//! own boundary, but it is a real dependency of the queue's priority
//! ordering (`UserType`) and the mutator's quota check, so it gets a
//! complete in-memory implementation plus a pluggable remote-flush
//! interface.
//!
//! Grounded on the teacher's `vault::store` (an in-memory-plus-flush
//! pattern keyed by a stable id, guarded by a single lock) and
//! `auth::AuthGuard` (bounded per-caller bookkeeping, periodic sweep).

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::family::ModelFamily;

pub const MAX_IPS_PER_USER: usize = 8;
const TEMPORARY_USER_RETENTION: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Normal,
    Special,
    Temporary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub token: Uuid,
    pub ips: HashSet<String>,
    pub user_type: UserType,
    pub prompt_count: u64,
    pub token_counts: HashMap<ModelFamily, u64>,
    pub token_limits: HashMap<ModelFamily, u64>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub disabled_at: Option<DateTime<Utc>>,
    pub disabled_reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(user_type: UserType, token_limits: HashMap<ModelFamily, u64>) -> Self {
        let now = Utc::now();
        User {
            token: Uuid::new_v4(),
            ips: HashSet::new(),
            user_type,
            prompt_count: 0,
            token_counts: HashMap::new(),
            token_limits,
            created_at: now,
            last_used_at: now,
            disabled_at: None,
            disabled_reason: None,
            expires_at: None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_at.is_some()
    }

    pub fn quota_remaining(&self, family: ModelFamily) -> Option<u64> {
        let limit = *self.token_limits.get(&family)?;
        let used = self.token_counts.get(&family).copied().unwrap_or(0);
        Some(limit.saturating_sub(used))
    }
}

/// Remote persistence hook. Mocked in tests; a real deployment backs
/// this with whatever KV store the operator runs (spec explicitly
/// keeps this interface out of scope beyond "flush to remote KV").
#[async_trait]
pub trait RemoteFlush: Send + Sync {
    async fn flush(&self, users: &[User]) -> anyhow::Result<()>;
}

pub struct NoopFlush;
#[async_trait]
impl RemoteFlush for NoopFlush {
    async fn flush(&self, _users: &[User]) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct UserStore {
    users: RwLock<HashMap<Uuid, User>>,
    flush: Box<dyn RemoteFlush>,
    /// `tokenQuota` (§6): default quota granted to a newly provisioned
    /// non-special user when the caller doesn't supply explicit limits.
    default_token_limits: HashMap<ModelFamily, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpAdmission {
    Admitted,
    /// Adding this IP would exceed `MAX_IPS_PER_USER`; the caller must
    /// disable the user instead of admitting the request.
    CapExceeded,
}

impl UserStore {
    pub fn new(flush: Box<dyn RemoteFlush>, default_token_limits: HashMap<ModelFamily, u64>) -> Self {
        UserStore {
            users: RwLock::new(HashMap::new()),
            flush,
            default_token_limits,
        }
    }

    /// Creates a user. `token_limits` overrides the configured
    /// `tokenQuota` default when non-empty; `special` users are never
    /// defaulted, since §6's quota only describes non-special users.
    pub async fn create(&self, user_type: UserType, token_limits: HashMap<ModelFamily, u64>) -> Uuid {
        let token_limits = if token_limits.is_empty() && user_type != UserType::Special {
            self.default_token_limits.clone()
        } else {
            token_limits
        };
        let mut user = User::new(user_type, token_limits);
        if user_type == UserType::Temporary {
            user.expires_at = Some(Utc::now() + chrono::Duration::hours(24));
        }
        let token = user.token;
        self.users.write().await.insert(token, user);
        token
    }

    /// Record a new source IP for a user, enforcing the per-user cap.
    /// Per §3, exceeding the cap disables the user rather than
    /// silently dropping the IP or the request. `special` users bypass
    /// the cap entirely.
    pub async fn record_ip(&self, token: Uuid, ip: &str, ip_limit: usize) -> IpAdmission {
        let mut users = self.users.write().await;
        let Some(user) = users.get_mut(&token) else {
            return IpAdmission::Admitted;
        };
        if user.user_type == UserType::Special {
            user.ips.insert(ip.to_string());
            return IpAdmission::Admitted;
        }
        if user.ips.contains(ip) {
            return IpAdmission::Admitted;
        }
        if ip_limit > 0 && user.ips.len() >= ip_limit {
            user.disabled_at = Some(Utc::now());
            user.disabled_reason = Some("IP address limit exceeded".to_string());
            return IpAdmission::CapExceeded;
        }
        user.ips.insert(ip.to_string());
        IpAdmission::Admitted
    }

    pub async fn record_usage(&self, token: Uuid, family: ModelFamily, tokens: u64) {
        let mut users = self.users.write().await;
        if let Some(user) = users.get_mut(&token) {
            user.prompt_count += 1;
            *user.token_counts.entry(family).or_insert(0) += tokens;
            user.last_used_at = Utc::now();
        }
    }

    pub async fn get(&self, token: Uuid) -> Option<User> {
        self.users.read().await.get(&token).cloned()
    }

    /// Reset every user's consumed token counts. Whether this also
    /// resets temporary users' *limits* is an explicit open question
    /// (see DESIGN.md) — this resets counts only, for every user type
    /// uniformly, and never touches `token_limits`.
    pub async fn refresh_all_quotas(&self) {
        let mut users = self.users.write().await;
        for user in users.values_mut() {
            user.token_counts.clear();
        }
    }

    /// Periodic sweep (the `* * * * *` cron tick, §5): first disables
    /// any temporary user whose `expiresAt` has passed (§8 scenario 6 —
    /// "next cron tick sets disabledAt"), then deletes temporary users
    /// past their 24h post-disable retention window, matching the
    /// teacher's `AuthGuard` bounded-bookkeeping sweep cadence.
    pub async fn expire_temporary_users(&self) {
        let now = Utc::now();
        let mut users = self.users.write().await;

        for user in users.values_mut() {
            if user.user_type == UserType::Temporary && user.disabled_at.is_none() {
                if let Some(expires_at) = user.expires_at {
                    if expires_at <= now {
                        user.disabled_at = Some(now);
                        user.disabled_reason = Some("temporary token expired".to_string());
                    }
                }
            }
        }

        let now = SystemTime::now();
        users.retain(|_, user| {
            if user.user_type != UserType::Temporary {
                return true;
            }
            match user.disabled_at {
                None => true,
                Some(disabled_at) => {
                    let disabled_at: SystemTime = disabled_at.into();
                    match now.duration_since(disabled_at) {
                        Ok(elapsed) => elapsed < TEMPORARY_USER_RETENTION,
                        Err(_) => true,
                    }
                }
            }
        });
    }

    pub async fn flush(&self) -> anyhow::Result<()> {
        let users: Vec<User> = self.users.read().await.values().cloned().collect();
        self.flush.flush(&users).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_cap_disables_user_instead_of_dropping_request() {
        let store = UserStore::new(Box::new(NoopFlush), HashMap::new());
        let token = store.create(UserType::Normal, HashMap::new()).await;

        for i in 0..MAX_IPS_PER_USER {
            let admission = store.record_ip(token, &format!("10.0.0.{i}"), MAX_IPS_PER_USER).await;
            assert_eq!(admission, IpAdmission::Admitted);
        }
        let admission = store.record_ip(token, "10.0.0.99", MAX_IPS_PER_USER).await;
        assert_eq!(admission, IpAdmission::CapExceeded);
        let user = store.get(token).await.unwrap();
        assert!(user.is_disabled());
        assert_eq!(user.disabled_reason.as_deref(), Some("IP address limit exceeded"));
    }

    #[tokio::test]
    async fn special_users_bypass_the_ip_cap() {
        let store = UserStore::new(Box::new(NoopFlush), HashMap::new());
        let token = store.create(UserType::Special, HashMap::new()).await;

        for i in 0..MAX_IPS_PER_USER + 5 {
            let admission = store.record_ip(token, &format!("10.0.0.{i}"), MAX_IPS_PER_USER).await;
            assert_eq!(admission, IpAdmission::Admitted);
        }
        assert!(!store.get(token).await.unwrap().is_disabled());
    }

    #[tokio::test]
    async fn same_ip_recorded_twice_does_not_count_against_cap() {
        let store = UserStore::new(Box::new(NoopFlush), HashMap::new());
        let token = store.create(UserType::Normal, HashMap::new()).await;
        for _ in 0..MAX_IPS_PER_USER + 5 {
            store.record_ip(token, "10.0.0.1", MAX_IPS_PER_USER).await;
        }
        assert!(!store.get(token).await.unwrap().is_disabled());
    }

    #[tokio::test]
    async fn refresh_all_quotas_clears_counts_not_limits() {
        let store = UserStore::new(Box::new(NoopFlush), HashMap::new());
        let mut limits = HashMap::new();
        limits.insert(ModelFamily::Turbo, 1000);
        let token = store.create(UserType::Normal, limits).await;
        store.record_usage(token, ModelFamily::Turbo, 500).await;

        store.refresh_all_quotas().await;
        let user = store.get(token).await.unwrap();
        assert_eq!(user.token_counts.get(&ModelFamily::Turbo), None);
        assert_eq!(user.token_limits.get(&ModelFamily::Turbo), Some(&1000));
    }

    #[tokio::test]
    async fn expired_temporary_user_is_disabled_on_sweep() {
        let store = UserStore::new(Box::new(NoopFlush), HashMap::new());
        let token = store.create(UserType::Temporary, HashMap::new()).await;
        {
            let mut users = store.users.write().await;
            users.get_mut(&token).unwrap().expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        }

        store.expire_temporary_users().await;

        let user = store.get(token).await.unwrap();
        assert!(user.is_disabled());
        assert_eq!(user.disabled_reason.as_deref(), Some("temporary token expired"));
    }

    #[tokio::test]
    async fn disabled_temporary_user_is_deleted_after_retention_window() {
        let store = UserStore::new(Box::new(NoopFlush), HashMap::new());
        let token = store.create(UserType::Temporary, HashMap::new()).await;
        {
            let mut users = store.users.write().await;
            let user = users.get_mut(&token).unwrap();
            user.disabled_at = Some(Utc::now() - chrono::Duration::hours(25));
            user.expires_at = Some(Utc::now() - chrono::Duration::hours(26));
        }

        store.expire_temporary_users().await;

        assert!(store.get(token).await.is_none());
    }

    #[tokio::test]
    async fn non_special_user_gets_configured_default_quota() {
        let mut defaults = HashMap::new();
        defaults.insert(ModelFamily::Turbo, 5_000);
        let store = UserStore::new(Box::new(NoopFlush), defaults);

        let normal = store.create(UserType::Normal, HashMap::new()).await;
        assert_eq!(
            store.get(normal).await.unwrap().token_limits.get(&ModelFamily::Turbo),
            Some(&5_000)
        );

        let special = store.create(UserType::Special, HashMap::new()).await;
        assert_eq!(store.get(special).await.unwrap().token_limits.get(&ModelFamily::Turbo), None);
    }
}
