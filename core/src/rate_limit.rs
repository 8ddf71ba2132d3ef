// Rate Limiting - OWASP A04: Insecure Design Prevention
//
// Fixed window counters keyed by client fingerprint or user id. Clients behind
// one shared proxy IP with identical user agents land in the same bucket; that
// false positive is accepted in exchange for not trusting client-chosen ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::config::RateLimitRule;
use crate::error::{GuardError, StoreError};
use crate::kv::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitClass {
    Auth,
    Api,
    Upload,
    PasswordReset,
    Sensitive,
    FormSubmission,
}

impl RateLimitClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitClass::Auth => "auth",
            RateLimitClass::Api => "api",
            RateLimitClass::Upload => "upload",
            RateLimitClass::PasswordReset => "password_reset",
            RateLimitClass::Sensitive => "sensitive",
            RateLimitClass::FormSubmission => "form_submission",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Seconds until the window resets, never below one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.reset_at - now).num_seconds().max(1)
    }

    pub fn into_error(self, now: DateTime<Utc>) -> GuardError {
        GuardError::RateLimitExceeded {
            limit: self.limit,
            reset_at: self.reset_at,
            retry_after_secs: self.retry_after_secs(now),
        }
    }
}

/// Identifier for anonymous callers: client IP plus a short user-agent digest.
pub fn client_fingerprint(ip: &str, user_agent: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_agent.unwrap_or_default().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}:{}", ip, &digest[..16])
}

/// Identifier for per-user limits, applied once the caller is authenticated.
pub fn user_identifier(user_id: &str) -> String {
    format!("user:{}", user_id)
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Count this request against `identifier` and decide whether it may pass.
    ///
    /// Denied requests still count, so hammering a closed window never opens
    /// it early.
    pub async fn check(
        &self,
        identifier: &str,
        rule: RateLimitRule,
    ) -> Result<RateLimitDecision, StoreError> {
        let key = format!("rl:{}", identifier);
        let counter = self.store.increment(&key, rule.window()).await?;
        let allowed = counter.count <= rule.max_requests;

        if !allowed {
            debug!(
                identifier = %identifier,
                count = counter.count,
                limit = rule.max_requests,
                "Rate limit exceeded"
            );
        }

        Ok(RateLimitDecision {
            allowed,
            limit: rule.max_requests,
            remaining: rule.max_requests.saturating_sub(counter.count),
            reset_at: counter.reset_at,
        })
    }

    /// Same as [`RateLimiter::check`] with the bucket namespaced by route class.
    pub async fn check_class(
        &self,
        class: RateLimitClass,
        identifier: &str,
        rule: RateLimitRule,
    ) -> Result<RateLimitDecision, StoreError> {
        self.check(&format!("{}:{}", class.as_str(), identifier), rule)
            .await
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
