use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Credential and second-factor state owned by the identity store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSecurityProfile {
    pub password_hash: String,
    /// Prior hashes, newest first, bounded by the configured history size.
    pub password_history: Vec<String>,
    pub password_changed_at: DateTime<Utc>,
    pub is_locked: bool,
    pub locked_until: Option<DateTime<Utc>>,
    /// Failures before this instant no longer count toward a lockout.
    pub failures_reset_at: Option<DateTime<Utc>>,
    pub two_factor_enabled: bool,
    pub two_factor_secret: Option<String>,
    /// SHA-256 digests of unused backup codes.
    pub two_factor_backup_codes: BTreeSet<String>,
}

impl UserSecurityProfile {
    pub fn new(password_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            password_hash,
            password_history: Vec::new(),
            password_changed_at: now,
            is_locked: false,
            locked_until: None,
            failures_reset_at: None,
            two_factor_enabled: false,
            two_factor_secret: None,
            two_factor_backup_codes: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginAttempt {
    pub user_id: String,
    pub success: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}
