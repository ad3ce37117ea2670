//! Error classifier — single taxonomy for everything that can go wrong
//! while proxying a request, rendered either as an HTTP JSON body or as
//! a fake SSE error frame (§4.4, §4.6, §4.6a).
//!
//! Grounded on the teacher's `server::mod` response-shaping (which
//! already distinguishes client-fault vs internal-fault JSON-RPC
//! errors) and `thiserror` usage in `vault::mod`/`auth`.

use serde::Serialize;
use thiserror::Error;

/// Stable, machine-readable error kind. Matches the upstream-compatible
/// error `type` strings clients already parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProxyValidationError,
    OrganizationAccountDisabled,
    ProxyQuotaExceeded,
    NoAvailableKey,
    ProxyInternalError,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::ProxyValidationError => 400,
            ErrorKind::OrganizationAccountDisabled => 403,
            ErrorKind::ProxyQuotaExceeded => 429,
            ErrorKind::NoAvailableKey => 503,
            ErrorKind::ProxyInternalError => 500,
        }
    }
}

/// The `{quota, used, requested}` detail §7 requires on a quota-exceeded
/// 429. Only ever attached to a `ProxyQuotaExceeded` error raised from
/// the actual quota check (§4.2's "Selection failures"'s own rejections
/// inside the mutator pipeline have no such numbers in hand and carry
/// `None`).
#[derive(Debug, Clone, Serialize)]
pub struct QuotaDetail {
    pub quota: u64,
    pub used: u64,
    pub requested: u64,
}

/// A single classified error, detached from whatever raised it.
/// Classification is idempotent: classifying an already-`ClassifiedError`
/// returns it unchanged rather than wrapping it again.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub issues: Option<Vec<String>>,
    pub quota: Option<QuotaDetail>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ClassifiedError {
            kind,
            message: message.into(),
            issues: None,
            quota: None,
        }
    }

    pub fn with_issues(mut self, issues: Vec<String>) -> Self {
        self.issues = Some(issues);
        self
    }

    pub fn with_quota_detail(mut self, quota: u64, used: u64, requested: u64) -> Self {
        self.quota = Some(QuotaDetail { quota, used, requested });
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProxyValidationError, message)
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProxyQuotaExceeded, message)
    }

    /// The §7 quota-exceeded shape: 429 body carrying `{quota, used,
    /// requested}` alongside the standard taxonomy fields.
    pub fn quota_exceeded_with_detail(quota: u64, used: u64, requested: u64) -> Self {
        Self::quota_exceeded("token quota exhausted for this model family")
            .with_quota_detail(quota, used, requested)
    }

    pub fn account_disabled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OrganizationAccountDisabled, message)
    }

    pub fn no_available_key() -> Self {
        Self::new(ErrorKind::NoAvailableKey, "No available key")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProxyInternalError, message)
    }

    /// Classify an upstream HTTP status into the proxy's own taxonomy.
    /// Idempotent re-classification happens at the call site: callers
    /// that already hold a `ClassifiedError` never pass it back through
    /// here, they just re-render it.
    pub fn from_upstream_status(status: u16, body_snippet: &str) -> Self {
        match status {
            400 | 422 => Self::validation(body_snippet),
            401 | 403 => Self::account_disabled(body_snippet),
            429 => Self::quota_exceeded(body_snippet),
            _ => Self::internal(body_snippet),
        }
    }

    /// Render as the JSON body of a pre-flight (non-streaming) HTTP
    /// error response. A quota-exceeded error carries its `{quota,
    /// used, requested}` detail (§7) alongside the standard fields.
    pub fn to_http_body(&self) -> serde_json::Value {
        let mut error = serde_json::json!({
            "type": self.kind,
            "message": self.message,
            "issues": self.issues,
        });
        if let Some(quota) = &self.quota {
            if let Some(obj) = error.as_object_mut() {
                obj.insert("quota".to_string(), serde_json::json!(quota.quota));
                obj.insert("used".to_string(), serde_json::json!(quota.used));
                obj.insert("requested".to_string(), serde_json::json!(quota.requested));
            }
        }
        serde_json::json!({ "error": error })
    }

    /// Render as a fake SSE error frame (§4.4): a single `data:` event
    /// whose payload embeds a fenced code block containing
    /// `{type, string}`, always immediately followed by the `[DONE]`
    /// terminator at the call site.
    pub fn to_sse_frame(&self) -> String {
        let fenced = format!(
            "```\n{{\"type\":\"{:?}\",\"string\":{}}}\n```",
            self.kind,
            serde_json::to_string(&self.message).unwrap_or_else(|_| "\"\"".to_string())
        );
        let payload = serde_json::json!({
            "choices": [{
                "delta": { "content": fenced },
                "index": 0,
                "finish_reason": serde_json::Value::Null,
            }]
        });
        format!("data: {}\n\n", payload)
    }
}

/// Internal glue error for the non-request-scoped parts of the system
/// (config loading, startup, background tasks). Kept distinct from
/// `ClassifiedError`, which is the type that ever reaches a client.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("key pool exhausted for shard {0}")]
    PoolExhausted(String),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<&ProxyError> for ClassifiedError {
    fn from(err: &ProxyError) -> Self {
        match err {
            ProxyError::Config(msg) => ClassifiedError::internal(msg.clone()),
            ProxyError::PoolExhausted(shard) => {
                ClassifiedError::new(ErrorKind::NoAvailableKey, format!("No available key for shard {shard}"))
            }
            ProxyError::Upstream(e) => ClassifiedError::internal(e.to_string()),
            ProxyError::Other(e) => ClassifiedError::internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_matches_taxonomy() {
        assert_eq!(ErrorKind::ProxyValidationError.http_status(), 400);
        assert_eq!(ErrorKind::OrganizationAccountDisabled.http_status(), 403);
        assert_eq!(ErrorKind::ProxyQuotaExceeded.http_status(), 429);
        assert_eq!(ErrorKind::NoAvailableKey.http_status(), 503);
        assert_eq!(ErrorKind::ProxyInternalError.http_status(), 500);
    }

    #[test]
    fn upstream_429_classifies_as_quota_exceeded() {
        let e = ClassifiedError::from_upstream_status(429, "rate limited");
        assert_eq!(e.kind, ErrorKind::ProxyQuotaExceeded);
    }

    #[test]
    fn quota_exceeded_http_body_carries_quota_used_requested() {
        let e = ClassifiedError::quota_exceeded_with_detail(100, 95, 10);
        let body = e.to_http_body();
        assert_eq!(body["error"]["quota"], serde_json::json!(100));
        assert_eq!(body["error"]["used"], serde_json::json!(95));
        assert_eq!(body["error"]["requested"], serde_json::json!(10));
    }

    #[test]
    fn quota_fields_absent_when_no_detail_was_attached() {
        let e = ClassifiedError::quota_exceeded("out of quota");
        let body = e.to_http_body();
        assert!(body["error"].get("quota").is_none());
    }

    #[test]
    fn sse_frame_embeds_fenced_json_and_has_no_trailing_done() {
        let e = ClassifiedError::quota_exceeded("out of quota");
        let frame = e.to_sse_frame();
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("```"));
        assert!(!frame.contains("[DONE]"));
    }
}
