use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::locks::ProfileLocks;
use super::password::PasswordPolicy;
use super::profile::UserSecurityProfile;
use super::totp::Totp;
use crate::clock::Clock;
use crate::config::{PasswordSettings, TwoFactorSettings};
use crate::error::TwoFactorError;
use crate::events::{EventOrigin, SecurityEvent, SecurityEventLogger, SecurityEventType};
use crate::store::ProfileStore;

const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const BACKUP_CODE_LEN: usize = 8;

/// Shown to the user once. Only digests of the backup codes are stored.
#[derive(Debug)]
pub struct TwoFactorSetup {
    pub secret: SecretString,
    pub qr_code_url: String,
    pub backup_codes: Vec<String>,
}

fn generate_backup_code() -> String {
    let mut rng = rand::thread_rng();
    let raw: String = (0..BACKUP_CODE_LEN)
        .map(|_| BACKUP_CODE_ALPHABET[rng.gen_range(0..BACKUP_CODE_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", &raw[..4], &raw[4..])
}

fn hash_backup_code(code: &str) -> String {
    let normalized: String = code
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

pub struct TwoFactorAuthenticator {
    profiles: Arc<dyn ProfileStore>,
    policy: PasswordPolicy,
    logger: Arc<SecurityEventLogger>,
    clock: Arc<dyn Clock>,
    settings: TwoFactorSettings,
    // Same table as the account services; backup codes stay single-use.
    locks: Arc<ProfileLocks>,
}

impl TwoFactorAuthenticator {
    pub fn new(
        settings: &TwoFactorSettings,
        password: &PasswordSettings,
        profiles: Arc<dyn ProfileStore>,
        logger: Arc<SecurityEventLogger>,
        clock: Arc<dyn Clock>,
        locks: Arc<ProfileLocks>,
    ) -> Self {
        Self {
            profiles,
            policy: PasswordPolicy::new(password),
            logger,
            clock,
            settings: settings.clone(),
            locks,
        }
    }

    async fn load(&self, user_id: &str) -> Result<UserSecurityProfile, TwoFactorError> {
        self.profiles
            .load_profile(user_id)
            .await?
            .ok_or_else(|| TwoFactorError::UnknownUser(user_id.to_string()))
    }

    fn totp_for(&self, profile: &UserSecurityProfile) -> Result<Totp, TwoFactorError> {
        let encoded = profile
            .two_factor_secret
            .as_deref()
            .ok_or(TwoFactorError::NotSetUp)?;
        Totp::from_base32(encoded, self.settings.digits, self.settings.period_secs)
            .ok_or(TwoFactorError::InvalidSecret)
    }

    fn totp_matches(&self, totp: &Totp, code: &str) -> bool {
        totp.verify(code, self.clock.now().timestamp(), self.settings.skew_steps)
    }

    async fn log_failure(&self, user_id: &str, description: &str) {
        self.logger
            .log_event(SecurityEvent::new(SecurityEventType::TwoFactorFailed, description).with_user(user_id))
            .await;
    }

    /// Issue a fresh secret and backup codes. Two-factor stays disabled
    /// until `verify_and_enable` sees a valid code.
    pub async fn setup(&self, user_id: &str, account_label: &str) -> Result<TwoFactorSetup, TwoFactorError> {
        let _guard = self.locks.lock(user_id).await;
        let mut profile = self.load(user_id).await?;
        if profile.two_factor_enabled {
            return Err(TwoFactorError::AlreadyEnabled);
        }

        let raw_secret = Totp::generate_secret();
        let secret = Totp::encode_secret(&raw_secret);
        let totp = Totp::new(raw_secret, self.settings.digits, self.settings.period_secs);
        let backup_codes: Vec<String> = (0..self.settings.backup_code_count)
            .map(|_| generate_backup_code())
            .collect();

        profile.two_factor_secret = Some(secret.clone());
        profile.two_factor_backup_codes = backup_codes.iter().map(|c| hash_backup_code(c)).collect();
        self.profiles.save_profile(user_id, &profile).await?;

        Ok(TwoFactorSetup {
            qr_code_url: totp.provisioning_uri(&self.settings.issuer, account_label),
            secret: SecretString::new(secret),
            backup_codes,
        })
    }

    pub async fn verify_and_enable(&self, user_id: &str, code: &str) -> Result<bool, TwoFactorError> {
        let _guard = self.locks.lock(user_id).await;
        let mut profile = self.load(user_id).await?;
        if profile.two_factor_enabled {
            return Err(TwoFactorError::AlreadyEnabled);
        }
        let totp = self.totp_for(&profile)?;

        if !self.totp_matches(&totp, code) {
            self.log_failure(user_id, "Invalid code while enabling two-factor authentication")
                .await;
            return Ok(false);
        }

        profile.two_factor_enabled = true;
        self.profiles.save_profile(user_id, &profile).await?;
        self.logger
            .log_event(
                SecurityEvent::new(
                    SecurityEventType::TwoFactorEnabled,
                    "Two-factor authentication enabled",
                )
                .with_user(user_id),
            )
            .await;
        Ok(true)
    }

    /// Accepts a current TOTP code or an unused backup code. A backup code
    /// is removed as soon as it succeeds.
    pub async fn verify_login(
        &self,
        user_id: &str,
        code: &str,
        origin: &EventOrigin,
    ) -> Result<bool, TwoFactorError> {
        let _guard = self.locks.lock(user_id).await;
        let mut profile = self.load(user_id).await?;
        if !profile.two_factor_enabled {
            return Err(TwoFactorError::NotSetUp);
        }
        let totp = self.totp_for(&profile)?;

        if self.totp_matches(&totp, code) {
            return Ok(true);
        }

        if profile.two_factor_backup_codes.remove(&hash_backup_code(code)) {
            self.profiles.save_profile(user_id, &profile).await?;
            self.logger
                .log_event(
                    SecurityEvent::new(
                        SecurityEventType::SuccessfulLogin,
                        "Second factor satisfied with a backup code",
                    )
                    .with_origin(origin)
                    .with_user(user_id)
                    .with_extra("backup_codes_remaining", profile.two_factor_backup_codes.len()),
                )
                .await;
            return Ok(true);
        }

        self.logger
            .log_event(
                SecurityEvent::new(SecurityEventType::TwoFactorFailed, "Invalid second factor code")
                    .with_origin(origin)
                    .with_user(user_id),
            )
            .await;
        Ok(false)
    }

    /// Requires the account password; clears the secret and backup codes.
    pub async fn disable(&self, user_id: &str, password: &str) -> Result<bool, TwoFactorError> {
        let _guard = self.locks.lock(user_id).await;
        let mut profile = self.load(user_id).await?;

        if !self.policy.verify_offloaded(password, &profile.password_hash).await {
            self.log_failure(user_id, "Wrong password while disabling two-factor authentication")
                .await;
            return Ok(false);
        }

        profile.two_factor_enabled = false;
        profile.two_factor_secret = None;
        profile.two_factor_backup_codes.clear();
        self.profiles.save_profile(user_id, &profile).await?;
        self.logger
            .log_event(
                SecurityEvent::new(
                    SecurityEventType::TwoFactorDisabled,
                    "Two-factor authentication disabled",
                )
                .with_user(user_id),
            )
            .await;
        Ok(true)
    }

    pub async fn is_enabled(&self, user_id: &str) -> Result<bool, TwoFactorError> {
        Ok(self.load(user_id).await?.two_factor_enabled)
    }

    /// Current code for a secret; used by tooling and tests.
    pub fn current_code(&self, secret: &SecretString) -> Option<String> {
        Totp::from_base32(secret.expose_secret(), self.settings.digits, self.settings.period_secs)?
            .code_at(self.clock.now().timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::store::MemoryStore;
    use chrono::Duration;

    const PASSWORD: &str = "Vq7#mLp2!xRz9&Kd";

    struct Harness {
        clock: Arc<MockClock>,
        store: Arc<MemoryStore>,
        two_factor: TwoFactorAuthenticator,
    }

    async fn harness() -> Harness {
        let clock = Arc::new(MockClock::fixed());
        let store = Arc::new(MemoryStore::new());
        let logger = Arc::new(SecurityEventLogger::new(store.clone(), clock.clone()));
        let password = PasswordSettings {
            hash_memory_kib: 256,
            hash_iterations: 1,
            ..PasswordSettings::default()
        };
        let hash = PasswordPolicy::new(&password).hash(PASSWORD).unwrap();
        store
            .save_profile("donor-1", &UserSecurityProfile::new(hash, clock.now()))
            .await
            .unwrap();

        let two_factor = TwoFactorAuthenticator::new(
            &TwoFactorSettings::default(),
            &password,
            store.clone(),
            logger,
            clock.clone(),
            Arc::new(ProfileLocks::new()),
        );
        Harness {
            clock,
            store,
            two_factor,
        }
    }

    async fn enabled() -> (Harness, TwoFactorSetup) {
        let h = harness().await;
        let setup = h.two_factor.setup("donor-1", "donor@example.org").await.unwrap();
        let code = h.two_factor.current_code(&setup.secret).unwrap();
        assert!(h.two_factor.verify_and_enable("donor-1", &code).await.unwrap());
        (h, setup)
    }

    #[tokio::test]
    async fn test_setup_does_not_enable() {
        let h = harness().await;
        let setup = h.two_factor.setup("donor-1", "donor@example.org").await.unwrap();

        assert_eq!(setup.backup_codes.len(), 10);
        assert!(setup.qr_code_url.starts_with("otpauth://totp/BloodLink"));
        assert!(!h.two_factor.is_enabled("donor-1").await.unwrap());

        let profile = h.store.load_profile("donor-1").await.unwrap().unwrap();
        assert_eq!(profile.two_factor_secret.as_deref(), Some(setup.secret.expose_secret().as_str()));
        for code in &setup.backup_codes {
            assert!(!profile.two_factor_backup_codes.contains(code));
        }

    }

    #[tokio::test]
    async fn test_enable_with_valid_code() {
        let (h, _setup) = enabled().await;
        assert!(h.two_factor.is_enabled("donor-1").await.unwrap());
        assert!(matches!(
            h.two_factor.setup("donor-1", "donor@example.org").await,
            Err(TwoFactorError::AlreadyEnabled)
        ));
    }

    #[tokio::test]
    async fn test_totp_outside_tolerance_fails() {
        let (h, setup) = enabled().await;
        let code = h.two_factor.current_code(&setup.secret).unwrap();

        h.clock.advance(Duration::seconds(30));
        assert!(h.two_factor.verify_login("donor-1", &code, &EventOrigin::default()).await.unwrap());

        h.clock.advance(Duration::seconds(60));
        assert!(!h.two_factor.verify_login("donor-1", &code, &EventOrigin::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_backup_code_is_single_use() {
        let (h, setup) = enabled().await;
        let backup = setup.backup_codes[0].to_lowercase();

        assert!(h.two_factor.verify_login("donor-1", &backup, &EventOrigin::default()).await.unwrap());
        assert!(!h.two_factor.verify_login("donor-1", &backup, &EventOrigin::default()).await.unwrap());

        let profile = h.store.load_profile("donor-1").await.unwrap().unwrap();
        assert_eq!(profile.two_factor_backup_codes.len(), 9);
    }

    #[tokio::test]
    async fn test_concurrent_backup_code_use_succeeds_once() {
        let (h, setup) = enabled().await;
        let backup = setup.backup_codes[3].clone();
        let origin = EventOrigin::default();

        let (first, second) = tokio::join!(
            h.two_factor.verify_login("donor-1", &backup, &origin),
            h.two_factor.verify_login("donor-1", &backup, &origin),
        );
        assert!(first.unwrap() ^ second.unwrap());
    }

    #[tokio::test]
    async fn test_disable_requires_password() {
        let (h, _setup) = enabled().await;

        assert!(!h.two_factor.disable("donor-1", "wrong").await.unwrap());
        assert!(h.two_factor.is_enabled("donor-1").await.unwrap());

        assert!(h.two_factor.disable("donor-1", PASSWORD).await.unwrap());
        let profile = h.store.load_profile("donor-1").await.unwrap().unwrap();
        assert!(!profile.two_factor_enabled);
        assert!(profile.two_factor_secret.is_none());
        assert!(profile.two_factor_backup_codes.is_empty());
    }

    #[tokio::test]
    async fn test_login_before_enable_is_rejected() {
        let h = harness().await;
        assert!(matches!(
            h.two_factor.verify_login("donor-1", "123456", &EventOrigin::default()).await,
            Err(TwoFactorError::NotSetUp)
        ));
    }
}
