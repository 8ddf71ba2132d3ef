//! Layered security settings: built-in defaults, an optional TOML file, then
//! `BLOODLINK__SECTION__KEY` environment variables.

use chrono::Duration;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;
use crate::events::SecurityEventType;
use crate::rate_limit::RateLimitClass;
use crate::sanitizer::ThreatKind;

pub const ENV_PREFIX: &str = "BLOODLINK";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    pub rate_limits: RateLimitSettings,
    pub csrf: CsrfSettings,
    pub sanitizer: SanitizerSettings,
    pub password: PasswordSettings,
    pub lockout: LockoutSettings,
    pub two_factor: TwoFactorSettings,
    pub alerts: AlertSettings,
}

impl SecuritySettings {
    /// Load settings from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}

/// Fixed-window limit for one route class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub window_secs: u64,
    pub max_requests: u32,
}

impl RateLimitRule {
    pub const fn new(window_secs: u64, max_requests: u32) -> Self {
        Self {
            window_secs,
            max_requests,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub auth: RateLimitRule,
    pub api: RateLimitRule,
    pub upload: RateLimitRule,
    pub password_reset: RateLimitRule,
    pub sensitive: RateLimitRule,
    pub form_submission: RateLimitRule,
}

impl RateLimitSettings {
    pub fn rule(&self, class: RateLimitClass) -> RateLimitRule {
        match class {
            RateLimitClass::Auth => self.auth,
            RateLimitClass::Api => self.api,
            RateLimitClass::Upload => self.upload,
            RateLimitClass::PasswordReset => self.password_reset,
            RateLimitClass::Sensitive => self.sensitive,
            RateLimitClass::FormSubmission => self.form_submission,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            auth: RateLimitRule::new(15 * 60, 5),
            api: RateLimitRule::new(15 * 60, 100),
            upload: RateLimitRule::new(60, 5),
            password_reset: RateLimitRule::new(60 * 60, 3),
            sensitive: RateLimitRule::new(5 * 60, 10),
            form_submission: RateLimitRule::new(60, 3),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrfSettings {
    pub token_ttl_secs: u64,
    /// Path prefixes that never require a token (auth, webhooks, health).
    pub exempt_paths: Vec<String>,
    pub allowed_origins: Vec<String>,
    /// Reject mutating requests carrying neither `Origin` nor `Referer`.
    pub require_origin: bool,
    pub header_name: String,
    pub cookie_name: String,
    pub double_submit: bool,
}

impl CsrfSettings {
    pub fn token_ttl(&self) -> Duration {
        Duration::seconds(self.token_ttl_secs as i64)
    }
}

impl Default for CsrfSettings {
    fn default() -> Self {
        Self {
            token_ttl_secs: 60 * 60,
            exempt_paths: vec![
                "/api/auth/".to_string(),
                "/api/webhooks/".to_string(),
                "/health".to_string(),
            ],
            allowed_origins: vec!["http://localhost:3000".to_string()],
            require_origin: false,
            header_name: "x-csrf-token".to_string(),
            cookie_name: "csrf_token".to_string(),
            double_submit: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerSettings {
    pub max_length: usize,
    /// Threat kinds that reject the request instead of only being logged.
    pub blocking_threats: Vec<ThreatKind>,
    pub excerpt_length: usize,
}

impl Default for SanitizerSettings {
    fn default() -> Self {
        Self {
            max_length: 10_000,
            blocking_threats: Vec::new(),
            excerpt_length: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordSettings {
    pub min_length: usize,
    /// Longest allowed run of one repeated character.
    pub max_repeated_chars: usize,
    pub history_size: usize,
    pub max_age_days: i64,
    pub hash_memory_kib: u32,
    pub hash_iterations: u32,
    pub hash_parallelism: u32,
}

impl PasswordSettings {
    pub fn max_age(&self) -> Duration {
        Duration::days(self.max_age_days)
    }
}

impl Default for PasswordSettings {
    fn default() -> Self {
        Self {
            min_length: 8,
            max_repeated_chars: 2,
            history_size: 5,
            max_age_days: 90,
            hash_memory_kib: 19 * 1024,
            hash_iterations: 2,
            hash_parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutSettings {
    pub threshold: u32,
    pub window_secs: u64,
    pub duration_secs: u64,
}

impl LockoutSettings {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_secs as i64)
    }
}

impl Default for LockoutSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            window_secs: 15 * 60,
            duration_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwoFactorSettings {
    pub issuer: String,
    pub digits: u32,
    pub period_secs: u64,
    /// Accepted clock drift, in whole periods either side of now.
    pub skew_steps: u32,
    pub backup_code_count: usize,
}

impl Default for TwoFactorSettings {
    fn default() -> Self {
        Self {
            issuer: "BloodLink".to_string(),
            digits: 6,
            period_secs: 30,
            skew_steps: 1,
            backup_code_count: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub window_secs: u64,
    /// Per-type threshold overrides keyed by snake_case event type.
    pub thresholds: HashMap<String, u32>,
}

impl AlertSettings {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }

    pub fn threshold_for(&self, event_type: SecurityEventType) -> u32 {
        self.thresholds
            .get(event_type.key())
            .copied()
            .unwrap_or_else(|| event_type.default_alert_threshold())
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            window_secs: 15 * 60,
            thresholds: HashMap::new(),
        }
    }
}
