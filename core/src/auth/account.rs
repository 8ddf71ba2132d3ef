//! Lockout-aware authentication and password lifecycle.
//!
//! Account state moves Active -> Locked -> Active. Failures are counted over
//! a trailing window; reaching the threshold locks the account until
//! `locked_until`, after which the next access unlocks it lazily.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::max;
use std::sync::Arc;
use tracing::{info, warn};

use super::locks::ProfileLocks;
use super::password::{PasswordPolicy, PasswordValidation, UserInfo};
use super::profile::{LoginAttempt, UserSecurityProfile};
use crate::clock::Clock;
use crate::config::{LockoutSettings, PasswordSettings};
use crate::error::PasswordError;
use crate::events::{EventOrigin, SecurityEvent, SecurityEventLogger, SecurityEventType};
use crate::store::{ProfileStore, SecurityStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginOutcome {
    Success { password_expired: bool },
    InvalidCredentials,
    Locked { locked_until: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub is_locked: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub recent_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PasswordChange {
    pub success: bool,
    pub errors: Vec<String>,
}

impl PasswordChange {
    fn rejected(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
        }
    }
}

pub struct AccountSecurity {
    policy: PasswordPolicy,
    profiles: Arc<dyn ProfileStore>,
    store: Arc<dyn SecurityStore>,
    logger: Arc<SecurityEventLogger>,
    clock: Arc<dyn Clock>,
    lockout: LockoutSettings,
    // Shared with two-factor so no profile write is lost to a stale copy.
    locks: Arc<ProfileLocks>,
}

impl AccountSecurity {
    pub fn new(
        password: &PasswordSettings,
        lockout: &LockoutSettings,
        profiles: Arc<dyn ProfileStore>,
        store: Arc<dyn SecurityStore>,
        logger: Arc<SecurityEventLogger>,
        clock: Arc<dyn Clock>,
        locks: Arc<ProfileLocks>,
    ) -> Self {
        Self {
            policy: PasswordPolicy::new(password),
            profiles,
            store,
            logger,
            clock,
            lockout: lockout.clone(),
            locks,
        }
    }

    pub fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }

    async fn load(&self, user_id: &str) -> Result<UserSecurityProfile, PasswordError> {
        self.profiles
            .load_profile(user_id)
            .await?
            .ok_or_else(|| PasswordError::UnknownUser(user_id.to_string()))
    }

    /// Clears an expired lock. Returns whether the profile changed.
    fn release_expired_lock(profile: &mut UserSecurityProfile, now: DateTime<Utc>) -> bool {
        match (profile.is_locked, profile.locked_until) {
            (true, Some(until)) if now > until => {
                profile.is_locked = false;
                profile.locked_until = None;
                profile.failures_reset_at = Some(now);
                true
            }
            _ => false,
        }
    }

    fn failure_window_start(&self, profile: &UserSecurityProfile, now: DateTime<Utc>) -> DateTime<Utc> {
        let window_start = now - self.lockout.window();
        match profile.failures_reset_at {
            Some(reset) => max(window_start, reset),
            None => window_start,
        }
    }

    async fn record_attempt(
        &self,
        user_id: &str,
        success: bool,
        origin: &EventOrigin,
        now: DateTime<Utc>,
    ) -> Result<(), PasswordError> {
        let attempt = LoginAttempt {
            user_id: user_id.to_string(),
            success,
            ip_address: origin.ip_address.clone(),
            user_agent: origin.user_agent.clone(),
            timestamp: now,
        };
        self.store.append_login_attempt(&attempt).await?;
        Ok(())
    }

    /// Check credentials. A locked account is rejected even when the
    /// password is correct.
    pub async fn authenticate(
        &self,
        user_id: &str,
        password: &str,
        origin: &EventOrigin,
    ) -> Result<LoginOutcome, PasswordError> {
        let _guard = self.locks.lock(user_id).await;
        let now = self.clock.now();
        let origin = EventOrigin {
            user_id: Some(user_id.to_string()),
            ..origin.clone()
        };

        let Some(mut profile) = self.profiles.load_profile(user_id).await? else {
            self.policy.verify_decoy(password).await;
            self.record_attempt(user_id, false, &origin, now).await?;
            self.logger.log_failed_login(&origin, "unknown user").await;
            return Ok(LoginOutcome::InvalidCredentials);
        };

        if Self::release_expired_lock(&mut profile, now) {
            self.profiles.save_profile(user_id, &profile).await?;
            info!(user_id = %user_id, "Account lock expired");
        }

        if profile.is_locked {
            self.record_attempt(user_id, false, &origin, now).await?;
            self.logger.log_failed_login(&origin, "account locked").await;
            return Ok(LoginOutcome::Locked {
                locked_until: profile.locked_until.unwrap_or(now),
            });
        }

        if self.policy.verify_offloaded(password, &profile.password_hash).await {
            self.record_attempt(user_id, true, &origin, now).await?;
            profile.failures_reset_at = Some(now);
            self.profiles.save_profile(user_id, &profile).await?;
            self.logger.log_successful_login(&origin).await;
            return Ok(LoginOutcome::Success {
                password_expired: self.policy.is_expired(profile.password_changed_at, now),
            });
        }

        self.record_attempt(user_id, false, &origin, now).await?;
        self.logger.log_failed_login(&origin, "invalid password").await;

        let since = self.failure_window_start(&profile, now);
        let failures = self.store.count_failed_logins(user_id, since).await?;
        if failures < self.lockout.threshold {
            return Ok(LoginOutcome::InvalidCredentials);
        }

        let locked_until = now + self.lockout.duration();
        profile.is_locked = true;
        profile.locked_until = Some(locked_until);
        self.profiles.save_profile(user_id, &profile).await?;

        warn!(user_id = %user_id, failures, %locked_until, "Account locked");
        self.logger
            .log_brute_force(&origin, failures, locked_until)
            .await;
        Ok(LoginOutcome::Locked { locked_until })
    }

    /// Current lock state, releasing an expired lock on the way.
    pub async fn lock_status(&self, user_id: &str) -> Result<LockStatus, PasswordError> {
        let _guard = self.locks.lock(user_id).await;
        let now = self.clock.now();
        let mut profile = self.load(user_id).await?;
        if Self::release_expired_lock(&mut profile, now) {
            self.profiles.save_profile(user_id, &profile).await?;
            info!(user_id = %user_id, "Account lock expired");
        }

        let since = self.failure_window_start(&profile, now);
        Ok(LockStatus {
            is_locked: profile.is_locked,
            locked_until: profile.locked_until,
            recent_failures: self.store.count_failed_logins(user_id, since).await?,
        })
    }

    pub async fn admin_unlock(&self, user_id: &str, admin_id: &str) -> Result<(), PasswordError> {
        let _guard = self.locks.lock(user_id).await;
        let now = self.clock.now();
        let mut profile = self.load(user_id).await?;
        profile.is_locked = false;
        profile.locked_until = None;
        profile.failures_reset_at = Some(now);
        self.profiles.save_profile(user_id, &profile).await?;

        self.logger
            .log_event(
                SecurityEvent::new(
                    SecurityEventType::AccountUnlocked,
                    format!("Account {} unlocked by administrator", user_id),
                )
                .with_user(admin_id)
                .with_extra("subject_user_id", user_id),
            )
            .await;
        Ok(())
    }

    /// Create or overwrite the credential for a user without the
    /// current-password check. Used for registration and seeding.
    pub async fn set_initial_password(
        &self,
        user_id: &str,
        password: &str,
        user_info: Option<&UserInfo>,
    ) -> Result<PasswordValidation, PasswordError> {
        let validation = self.policy.validate(password, user_info);
        if !validation.is_valid {
            return Ok(validation);
        }

        let hash = self.policy.hash_offloaded(password).await?;
        let _guard = self.locks.lock(user_id).await;
        let now = self.clock.now();
        let profile = match self.profiles.load_profile(user_id).await? {
            Some(mut existing) => {
                existing.password_hash = hash;
                existing.password_changed_at = now;
                existing
            }
            None => UserSecurityProfile::new(hash, now),
        };
        self.profiles.save_profile(user_id, &profile).await?;
        Ok(validation)
    }

    pub async fn change_password(
        &self,
        user_id: &str,
        current_password: &str,
        new_password: &str,
        user_info: Option<&UserInfo>,
    ) -> Result<PasswordChange, PasswordError> {
        let _guard = self.locks.lock(user_id).await;
        let mut profile = self.load(user_id).await?;

        if !self
            .policy
            .verify_offloaded(current_password, &profile.password_hash)
            .await
        {
            self.logger
                .log_event(
                    SecurityEvent::new(
                        SecurityEventType::FailedLogin,
                        "Password change rejected: current password incorrect",
                    )
                    .with_user(user_id),
                )
                .await;
            return Ok(PasswordChange::rejected(vec![
                "Current password is incorrect".to_string(),
            ]));
        }

        let validation = self.policy.validate(new_password, user_info);
        if !validation.is_valid {
            return Ok(PasswordChange::rejected(validation.errors));
        }

        let history_size = self.policy.settings().history_size;
        let recent: Vec<String> = std::iter::once(&profile.password_hash)
            .chain(profile.password_history.iter())
            .take(history_size.max(1))
            .cloned()
            .collect();
        if self.policy.matches_any_offloaded(new_password, recent).await {
            return Ok(PasswordChange::rejected(vec![format!(
                "Password must differ from your last {} passwords",
                history_size.max(1)
            )]));
        }

        let new_hash = self.policy.hash_offloaded(new_password).await?;
        let previous = std::mem::replace(&mut profile.password_hash, new_hash);
        profile.password_history.insert(0, previous);
        profile.password_history.truncate(history_size);
        profile.password_changed_at = self.clock.now();
        self.profiles.save_profile(user_id, &profile).await?;

        self.logger
            .log_event(
                SecurityEvent::new(SecurityEventType::PasswordChanged, "Password changed")
                    .with_user(user_id),
            )
            .await;
        Ok(PasswordChange {
            success: true,
            errors: Vec::new(),
        })
    }

    /// Deletes the stored credential, second-factor material and login
    /// history for a user. Returns whether a profile existed.
    pub async fn erase(&self, user_id: &str) -> Result<bool, PasswordError> {
        let _guard = self.locks.lock(user_id).await;
        let existed = self.profiles.delete_profile(user_id).await?;
        let attempts = self.store.delete_login_attempts(user_id).await?;
        info!(user_id = %user_id, attempts, "Account credentials erased");
        Ok(existed)
    }

    pub async fn password_expired(&self, user_id: &str) -> Result<bool, PasswordError> {
        let profile = self.load(user_id).await?;
        Ok(self
            .policy
            .is_expired(profile.password_changed_at, self.clock.now()))
    }
}
