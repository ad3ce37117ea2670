//! Layered configuration: built-in defaults, then `llm-relay.toml` if
//! present, then `LLM_RELAY_*` environment variables — each layer
//! overriding the last. Grounded on the teacher's `Config::from_env`
//! (`main.rs`) pattern, generalized from a couple of hardcoded paths to
//! the full field set this system needs, via the `config` crate the
//! teacher already had in its dependency tree's sibling gateway crate.

use std::collections::HashMap;

use serde::Deserialize;

use crate::family::{ModelFamily, Service};
use crate::keypool::ProviderExt;
use crate::secret::Secret;

#[derive(Debug, Clone, Deserialize)]
pub struct KeyConfig {
    pub service: Service,
    pub families: Vec<ModelFamily>,
    pub secret: String,
    #[serde(flatten)]
    pub ext: ProviderExtConfig,
    #[serde(default)]
    pub is_trial: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProviderExtConfig {
    OpenAi {
        #[serde(default)]
        org_id: Option<String>,
    },
    Aws {
        region: String,
        access_key_id: String,
    },
    Anthropic,
    Google,
    Mistral,
}

impl From<ProviderExtConfig> for ProviderExt {
    fn from(c: ProviderExtConfig) -> Self {
        match c {
            ProviderExtConfig::OpenAi { org_id } => ProviderExt::OpenAi { org_id },
            ProviderExtConfig::Aws {
                region,
                access_key_id,
            } => ProviderExt::Aws {
                region,
                access_key_id,
            },
            ProviderExtConfig::Anthropic => ProviderExt::Anthropic,
            ProviderExtConfig::Google => ProviderExt::Google,
            ProviderExtConfig::Mistral => ProviderExt::Mistral,
        }
    }
}

impl KeyConfig {
    pub fn into_key(self) -> crate::keypool::Key {
        let mut key = crate::keypool::Key::new(
            self.service,
            self.families,
            Secret::new(self.secret),
            self.ext.into(),
        );
        key.is_trial = self.is_trial;
        key
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
    #[serde(default)]
    pub max_ips_per_user: usize,
    #[serde(default)]
    pub allowed_model_families: Option<Vec<ModelFamily>>,
    /// Keyed by the family's `Display` string (e.g. `"turbo"`,
    /// `"aws-claude"`) rather than `ModelFamily` directly — most config
    /// formats only deserialize map keys as strings.
    #[serde(default)]
    pub token_quota: HashMap<String, u64>,
    #[serde(default)]
    pub prompt_logging: bool,
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_threshold_ms")]
    pub heartbeat_threshold_ms: u64,
    #[serde(default)]
    pub key_health_sweep: bool,
    #[serde(default = "default_quota_refresh_period_secs")]
    pub quota_refresh_period_secs: u64,
    /// Cadence of the `* * * * *` temporary-user expiry sweep (§5),
    /// kept independent of `quota_refresh_period_secs` since the two
    /// run on unrelated schedules (minute-level vs hourly/daily).
    #[serde(default = "default_temp_user_sweep_interval_secs")]
    pub temp_user_sweep_interval_secs: u64,
    /// Cadence of the user-store remote flush (§5/§6, "every 20 s").
    #[serde(default = "default_user_store_flush_interval_secs")]
    pub user_store_flush_interval_secs: u64,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_upstream_timeout_ms() -> u64 {
    60_000
}
fn default_heartbeat_interval_ms() -> u64 {
    1_000
}
fn default_heartbeat_threshold_ms() -> u64 {
    10_000
}
fn default_quota_refresh_period_secs() -> u64 {
    24 * 3600
}
fn default_temp_user_sweep_interval_secs() -> u64 {
    60
}
fn default_user_store_flush_interval_secs() -> u64 {
    20
}
fn default_bind_addr() -> String {
    "0.0.0.0:8787".to_string()
}

impl Settings {
    /// Resolves `tokenQuota` into the `ModelFamily`-keyed default quota
    /// granted to a newly provisioned non-special user (§6). Entries
    /// naming a family this build doesn't recognize are dropped with a
    /// warning rather than failing config load outright.
    pub fn token_quota_limits(&self) -> HashMap<ModelFamily, u64> {
        let mut out = HashMap::with_capacity(self.token_quota.len());
        for (name, limit) in &self.token_quota {
            match crate::family::parse_known(name) {
                Some(family) => {
                    out.insert(family, *limit);
                }
                None => tracing::warn!(family = %name, "unrecognized model family in token_quota config"),
            }
        }
        out
    }

    /// Defaults -> `llm-relay.toml` (if present) -> `LLM_RELAY_*` env.
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .set_default("max_ips_per_user", crate::userstore::MAX_IPS_PER_USER as i64)?
            .set_default("prompt_logging", false)?
            .add_source(config::File::with_name("llm-relay").required(false))
            .add_source(config::Environment::with_prefix("LLM_RELAY").separator("__"));

        let settings = builder.build()?.try_deserialize::<Settings>()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_populate_when_no_file_or_env_present() {
        std::env::remove_var("LLM_RELAY_BIND_ADDR");
        let settings = Settings::load().expect("defaults alone must be loadable");
        assert_eq!(settings.bind_addr, "0.0.0.0:8787");
        assert_eq!(settings.upstream_timeout_ms, 60_000);
        assert_eq!(settings.temp_user_sweep_interval_secs, 60);
        assert_eq!(settings.user_store_flush_interval_secs, 20);
    }

    #[test]
    fn token_quota_limits_resolves_known_families_and_drops_unknown() {
        let mut settings = Settings::load().expect("defaults alone must be loadable");
        settings.token_quota.insert("turbo".to_string(), 100_000);
        settings.token_quota.insert("not-a-family".to_string(), 1);

        let limits = settings.token_quota_limits();
        assert_eq!(limits.get(&ModelFamily::Turbo), Some(&100_000));
        assert_eq!(limits.len(), 1);
    }
}
