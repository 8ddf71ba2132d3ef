// CSRF Protection - OWASP A01: Broken Access Control Prevention
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use http::Method;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;
use url::Url;

use crate::clock::Clock;
use crate::config::CsrfSettings;
use crate::error::{GuardError, StoreError};
use crate::kv::KvStore;
use crate::pipeline::SecureRequest;

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Constant-time comparison; length mismatch is the only early exit.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Session-bound synchronizer tokens. One live token per session key,
/// reusable until it expires or is replaced.
#[derive(Clone)]
pub struct CsrfGuard {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    exempt_paths: Vec<String>,
}

impl CsrfGuard {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, settings: &CsrfSettings) -> Self {
        Self {
            store,
            clock,
            ttl: settings.token_ttl(),
            exempt_paths: settings.exempt_paths.clone(),
        }
    }

    fn key(session_key: &str) -> String {
        format!("csrf:{}", session_key)
    }

    /// Issue a fresh token for `session_key`, replacing any previous one.
    pub async fn issue(&self, session_key: &str) -> Result<CsrfToken, StoreError> {
        let token = random_token();
        self.store
            .set_with_ttl(&Self::key(session_key), token.clone(), self.ttl)
            .await?;

        Ok(CsrfToken {
            token,
            expires_at: self.clock.now() + self.ttl,
        })
    }

    /// True iff `supplied` is the live token most recently issued for
    /// exactly this session key. Store failures fail closed.
    pub async fn validate(&self, session_key: &str, supplied: &str) -> bool {
        if supplied.is_empty() {
            return false;
        }

        let entry = match self.store.get(&Self::key(session_key)).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(err) => {
                warn!(error = %err, "CSRF token lookup failed");
                return false;
            }
        };

        if self.clock.now() >= entry.expires_at {
            return false;
        }

        constant_time_eq(&entry.value, supplied)
    }

    pub async fn revoke(&self, session_key: &str) -> Result<(), StoreError> {
        self.store.delete(&Self::key(session_key)).await
    }

    /// Safe methods and allow-listed path prefixes skip token checks.
    pub fn is_exempt(&self, method: &Method, path: &str) -> bool {
        if matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE) {
            return true;
        }
        self.exempt_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Compares `Origin` (or the origin of `Referer`) against an explicit list.
#[derive(Debug, Clone)]
pub struct OriginValidator {
    allowed: Vec<String>,
    require_origin: bool,
}

impl OriginValidator {
    pub fn new(allowed: &[String], require_origin: bool) -> Self {
        Self {
            allowed: allowed
                .iter()
                .filter_map(|origin| normalize_origin(origin))
                .collect(),
            require_origin,
        }
    }

    pub fn validate(&self, origin: Option<&str>, referer: Option<&str>) -> Result<(), String> {
        let claimed = origin.or(referer);
        let Some(claimed) = claimed else {
            return if self.require_origin {
                Err("missing Origin and Referer".to_string())
            } else {
                Ok(())
            };
        };

        match normalize_origin(claimed) {
            Some(normalized) if self.allowed.iter().any(|a| a == &normalized) => Ok(()),
            Some(normalized) => Err(normalized),
            None => Err(format!("unparseable origin {:?}", claimed)),
        }
    }
}

fn normalize_origin(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    match url.origin() {
        origin @ url::Origin::Tuple(..) => Some(origin.ascii_serialization()),
        url::Origin::Opaque(_) => None,
    }
}

// Double Submit Cookie pattern, composed as an additional gate
#[derive(Debug, Clone)]
pub struct DoubleSubmitCookie {
    cookie_name: String,
    header_name: String,
}

impl DoubleSubmitCookie {
    pub fn new(cookie_name: impl Into<String>, header_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            header_name: header_name.into(),
        }
    }

    pub fn generate_cookie_token(&self) -> String {
        random_token()
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn validate_double_submit(&self, cookie_token: &str, header_token: &str) -> bool {
        !cookie_token.is_empty()
            && !header_token.is_empty()
            && constant_time_eq(cookie_token, header_token)
    }

    pub fn validate_request(&self, request: &SecureRequest) -> bool {
        match (
            request.cookie(&self.cookie_name),
            request.header(&self.header_name),
        ) {
            (Some(cookie), Some(header)) => self.validate_double_submit(cookie, header),
            _ => false,
        }
    }
}

/// Every CSRF gate composed in order: origin, synchronizer token, and the
/// optional double-submit cookie.
#[derive(Clone)]
pub struct CsrfProtection {
    guard: CsrfGuard,
    origins: OriginValidator,
    double_submit: Option<DoubleSubmitCookie>,
    header_name: String,
}

impl CsrfProtection {
    pub fn new(guard: CsrfGuard, settings: &CsrfSettings) -> Self {
        let double_submit = settings
            .double_submit
            .then(|| DoubleSubmitCookie::new(&settings.cookie_name, &settings.header_name));

        Self {
            guard,
            origins: OriginValidator::new(&settings.allowed_origins, settings.require_origin),
            double_submit,
            header_name: settings.header_name.clone(),
        }
    }

    pub fn guard(&self) -> &CsrfGuard {
        &self.guard
    }

    pub async fn check(&self, request: &SecureRequest) -> Result<(), GuardError> {
        if self.guard.is_exempt(&request.method, &request.path) {
            return Ok(());
        }

        self.origins
            .validate(request.header("origin"), request.header("referer"))
            .map_err(GuardError::OriginMismatch)?;

        let session_key = request
            .session_key
            .as_deref()
            .ok_or_else(|| GuardError::CsrfValidationFailed("no session".to_string()))?;
        let token = request
            .header(&self.header_name)
            .ok_or_else(|| GuardError::CsrfValidationFailed("missing token".to_string()))?;

        if !self.guard.validate(session_key, token).await {
            return Err(GuardError::CsrfValidationFailed(
                "token invalid or expired".to_string(),
            ));
        }

        if let Some(double_submit) = &self.double_submit {
            if !double_submit.validate_request(request) {
                return Err(GuardError::CsrfValidationFailed(
                    "double submit mismatch".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::kv::MemoryKvStore;

    fn guard() -> (Arc<MockClock>, CsrfGuard) {
        let clock = Arc::new(MockClock::fixed());
        let store = Arc::new(MemoryKvStore::new(clock.clone()));
        let guard = CsrfGuard::new(store, clock.clone(), &CsrfSettings::default());
        (clock, guard)
    }

    #[tokio::test]
    async fn test_csrf_token_generation() {
        let (_clock, csrf) = guard();
        let token1 = csrf.issue("session-a").await.unwrap();
        let token2 = csrf.issue("session-b").await.unwrap();

        // Tokens should be different and carry 256 bits
        assert_ne!(token1.token, token2.token);
        assert_eq!(
            general_purpose::URL_SAFE_NO_PAD.decode(&token1.token).unwrap().len(),
            32
        );
    }

    #[tokio::test]
    async fn test_csrf_token_validation() {
        let (_clock, csrf) = guard();
        let token = csrf.issue("session-a").await.unwrap();

        // Reusable within the session until expiry
        assert!(csrf.validate("session-a", &token.token).await);
        assert!(csrf.validate("session-a", &token.token).await);

        // Never valid for another session
        assert!(!csrf.validate("session-b", &token.token).await);
        assert!(!csrf.validate("session-a", "forged").await);
        assert!(!csrf.validate("session-a", "").await);
    }

    #[tokio::test]
    async fn test_reissue_replaces_previous_token() {
        let (_clock, csrf) = guard();
        let old = csrf.issue("s").await.unwrap();
        let new = csrf.issue("s").await.unwrap();

        assert!(!csrf.validate("s", &old.token).await);
        assert!(csrf.validate("s", &new.token).await);

        csrf.revoke("s").await.unwrap();
        assert!(!csrf.validate("s", &new.token).await);
    }

    #[tokio::test]
    async fn test_token_expires_after_ttl() {
        let (clock, csrf) = guard();
        let token = csrf.issue("s").await.unwrap();
        assert_eq!(token.expires_at, clock.now() + Duration::hours(1));

        clock.advance(Duration::minutes(59));
        assert!(csrf.validate("s", &token.token).await);

        clock.advance(Duration::minutes(1));
        assert!(!csrf.validate("s", &token.token).await);
    }

    #[test]
    fn test_exemptions() {
        let (_clock, csrf) = guard();
        assert!(csrf.is_exempt(&Method::GET, "/api/requests"));
        assert!(csrf.is_exempt(&Method::POST, "/api/auth/login"));
        assert!(csrf.is_exempt(&Method::POST, "/health"));
        assert!(!csrf.is_exempt(&Method::POST, "/api/requests"));
        assert!(!csrf.is_exempt(&Method::DELETE, "/api/requests/1"));
    }

    #[test]
    fn test_origin_validator() {
        let validator = OriginValidator::new(&["https://bloodlink.org/".to_string()], false);

        assert!(validator.validate(Some("https://bloodlink.org"), None).is_ok());
        assert!(validator
            .validate(None, Some("https://bloodlink.org/requests/new"))
            .is_ok());
        assert!(validator.validate(Some("https://evil.bloodlink.org"), None).is_err());
        assert!(validator.validate(Some("http://bloodlink.org"), None).is_err());
        assert!(validator.validate(Some("null"), None).is_err());
        // Origin wins over Referer
        assert!(validator
            .validate(Some("https://evil.example"), Some("https://bloodlink.org/x"))
            .is_err());
        assert!(validator.validate(None, None).is_ok());

        let strict = OriginValidator::new(&["https://bloodlink.org".to_string()], true);
        assert!(strict.validate(None, None).is_err());
    }

    #[test]
    fn test_double_submit_cookie() {
        let dsc = DoubleSubmitCookie::new("csrf_token", "x-csrf-token");
        let token = dsc.generate_cookie_token();

        assert!(dsc.validate_double_submit(&token, &token));
        assert!(!dsc.validate_double_submit(&token, "different_token"));
        assert!(!dsc.validate_double_submit("", ""));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("hello", "hello"));
        assert!(!constant_time_eq("hello", "hellp"));
        assert!(!constant_time_eq("hello", "hello!"));
    }

    #[tokio::test]
    async fn test_protection_composes_gates() {
        let clock = Arc::new(MockClock::fixed());
        let store = Arc::new(MemoryKvStore::new(clock.clone()));
        let settings = CsrfSettings {
            allowed_origins: vec!["https://bloodlink.org".to_string()],
            double_submit: true,
            ..CsrfSettings::default()
        };
        let protection =
            CsrfProtection::new(CsrfGuard::new(store, clock, &settings), &settings);
        let token = protection.guard().issue("sess").await.unwrap().token;

        let request = |origin: &str, header: &str, cookie: &str| {
            SecureRequest::new(Method::POST, "/api/requests")
                .with_session("sess")
                .with_header("origin", origin)
                .with_header("x-csrf-token", header)
                .with_cookie("csrf_token", cookie)
        };

        assert!(protection
            .check(&request("https://bloodlink.org", &token, &token))
            .await
            .is_ok());
        assert!(matches!(
            protection
                .check(&request("https://evil.example", &token, &token))
                .await,
            Err(GuardError::OriginMismatch(_))
        ));
        assert!(matches!(
            protection
                .check(&request("https://bloodlink.org", &token, "other"))
                .await,
            Err(GuardError::CsrfValidationFailed(_))
        ));
        assert!(matches!(
            protection
                .check(&request("https://bloodlink.org", "wrong", "wrong"))
                .await,
            Err(GuardError::CsrfValidationFailed(_))
        ));
    }
}
