pub mod alerts;
pub mod auth;
pub mod clock;
pub mod config;
pub mod csrf;
pub mod error;
pub mod events;
pub mod kv;
pub mod pipeline;
pub mod rate_limit;
pub mod sanitizer;
pub mod store;

pub use alerts::{AlertAggregator, AlertNotifier, SecurityAlert, TracingNotifier};
pub use auth::{
    AccountSecurity, LoginOutcome, PasswordPolicy, ProfileLocks, TwoFactorAuthenticator,
    UserInfo, UserSecurityProfile,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::SecuritySettings;
pub use error::{AlertError, GuardError, PasswordError, StoreError, TwoFactorError};
pub use events::{EventOrigin, SecurityEvent, SecurityEventLogger, SecurityEventType, Severity};
pub use kv::{KvStore, MemoryKvStore};
pub use pipeline::{
    GuardedHandler, Identity, IdentityProvider, RequestContext, Role, RouteConfig,
    SecureRequest, SecureResponse, SecurityPipeline,
};
pub use rate_limit::{RateLimitClass, RateLimiter};
pub use sanitizer::{InputSanitizer, SanitizeOptions, ThreatKind};
pub use store::{MemoryStore, ProfileStore, SecurityStore};

use std::sync::Arc;
use tracing::info;

/// Every security service wired to shared stores, clock and logger.
pub struct BloodLinkSecurity {
    pub settings: SecuritySettings,
    pub clock: Arc<dyn Clock>,
    pub logger: Arc<SecurityEventLogger>,
    pub alerts: AlertAggregator,
    pub accounts: Arc<AccountSecurity>,
    pub two_factor: Arc<TwoFactorAuthenticator>,
    pub pipeline: Arc<SecurityPipeline>,
}

/// Storage backends the services run on.
pub struct Backends {
    pub kv: Arc<dyn KvStore>,
    pub store: Arc<dyn SecurityStore>,
    pub profiles: Arc<dyn ProfileStore>,
}

impl Backends {
    /// Process-local backends; state is lost on restart.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            kv: Arc::new(MemoryKvStore::new(clock)),
            store: store.clone(),
            profiles: store,
        }
    }
}

impl BloodLinkSecurity {
    pub fn new(
        settings: SecuritySettings,
        backends: Backends,
        identities: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn AlertNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let alerts = AlertAggregator::new(backends.store.clone(), clock.clone(), settings.alerts.clone())
            .with_notifier(notifier);
        let logger = Arc::new(
            SecurityEventLogger::new(backends.store.clone(), clock.clone())
                .with_alerts(alerts.clone())
                .with_excerpt_length(settings.sanitizer.excerpt_length),
        );

        // One lock table for every service writing user profiles.
        let locks = Arc::new(ProfileLocks::new());
        let accounts = Arc::new(AccountSecurity::new(
            &settings.password,
            &settings.lockout,
            backends.profiles.clone(),
            backends.store.clone(),
            logger.clone(),
            clock.clone(),
            locks.clone(),
        ));
        let two_factor = Arc::new(TwoFactorAuthenticator::new(
            &settings.two_factor,
            &settings.password,
            backends.profiles,
            logger.clone(),
            clock.clone(),
            locks,
        ));
        let pipeline = Arc::new(SecurityPipeline::new(
            &settings,
            backends.kv,
            identities,
            logger.clone(),
            clock.clone(),
        ));

        info!(
            lockout_threshold = settings.lockout.threshold,
            alert_window_secs = settings.alerts.window_secs,
            "Security services initialised"
        );

        Self {
            settings,
            clock,
            logger,
            alerts,
            accounts,
            two_factor,
            pipeline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pipeline::AnonymousProvider;
    use std::time::Duration;

    const PASSWORD: &str = "Vq7#mLp2!xRz9&Kd";
    const NEW_PASSWORD: &str = "Zt5$wQn8@pLc3!Hy";

    /// Profile store whose writes land late, widening any window in which a
    /// stale copy could overwrite a newer one.
    struct SlowProfiles {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl ProfileStore for SlowProfiles {
        async fn load_profile(&self, user_id: &str) -> Result<Option<UserSecurityProfile>, StoreError> {
            self.inner.load_profile(user_id).await
        }

        async fn save_profile(&self, user_id: &str, profile: &UserSecurityProfile) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_millis(40)).await;
            self.inner.save_profile(user_id, profile).await
        }

        async fn delete_profile(&self, user_id: &str) -> Result<bool, StoreError> {
            self.inner.delete_profile(user_id).await
        }
    }

    fn fast_settings() -> SecuritySettings {
        let mut settings = SecuritySettings::default();
        settings.password.hash_memory_kib = 256;
        settings.password.hash_iterations = 1;
        settings
    }

    async fn slow_security() -> (BloodLinkSecurity, Arc<MemoryStore>) {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::fixed());
        let store = Arc::new(MemoryStore::new());
        let backends = Backends {
            kv: Arc::new(MemoryKvStore::new(clock.clone())),
            store: store.clone(),
            profiles: Arc::new(SlowProfiles {
                inner: store.clone(),
            }),
        };
        let security = BloodLinkSecurity::new(
            fast_settings(),
            backends,
            Arc::new(AnonymousProvider),
            Arc::new(TracingNotifier),
            clock,
        );
        let seeded = security
            .accounts
            .set_initial_password("donor-1", PASSWORD, None)
            .await
            .unwrap();
        assert!(seeded.is_valid);
        (security, store)
    }

    #[tokio::test]
    async fn test_services_share_one_event_trail() {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::fixed());
        let security = BloodLinkSecurity::new(
            SecuritySettings::default(),
            Backends::in_memory(clock.clone()),
            Arc::new(AnonymousProvider),
            Arc::new(TracingNotifier),
            clock.clone(),
        );

        let outcome = security
            .accounts
            .authenticate("ghost", "Irrelevant#1", &EventOrigin::user("ghost").with_ip("198.51.100.7"))
            .await
            .unwrap();
        assert_eq!(outcome, LoginOutcome::InvalidCredentials);

        let events = security
            .logger
            .recent_events(clock.now() - chrono::Duration::minutes(1), 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, SecurityEventType::FailedLogin);
        assert!(security.logger.alerts().is_some());
    }

    #[tokio::test]
    async fn test_lock_survives_concurrent_password_change() {
        let (security, store) = slow_security().await;
        let origin = EventOrigin::default().with_ip("203.0.113.7");
        for _ in 0..4 {
            let outcome = security.accounts.authenticate("donor-1", "wrong", &origin).await.unwrap();
            assert_eq!(outcome, LoginOutcome::InvalidCredentials);
        }

        let (changed, fifth) = tokio::join!(
            security
                .accounts
                .change_password("donor-1", PASSWORD, NEW_PASSWORD, None),
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                security.accounts.authenticate("donor-1", "wrong", &origin).await
            },
        );
        assert!(changed.unwrap().success);
        assert!(matches!(fifth.unwrap(), LoginOutcome::Locked { .. }));

        let profile = store.load_profile("donor-1").await.unwrap().unwrap();
        assert!(profile.is_locked);
        assert_eq!(profile.password_history.len(), 1);
        assert!(security.accounts.lock_status("donor-1").await.unwrap().is_locked);
    }

    #[tokio::test]
    async fn test_used_backup_code_survives_concurrent_password_change() {
        let (security, store) = slow_security().await;
        let setup = security
            .two_factor
            .setup("donor-1", "donor@example.org")
            .await
            .unwrap();
        let code = security.two_factor.current_code(&setup.secret).unwrap();
        assert!(security.two_factor.verify_and_enable("donor-1", &code).await.unwrap());

        let backup = setup.backup_codes[0].clone();
        let origin = EventOrigin::default();
        let (changed, used) = tokio::join!(
            security
                .accounts
                .change_password("donor-1", PASSWORD, NEW_PASSWORD, None),
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                security.two_factor.verify_login("donor-1", &backup, &origin).await
            },
        );
        assert!(changed.unwrap().success);
        assert!(used.unwrap());

        let profile = store.load_profile("donor-1").await.unwrap().unwrap();
        assert_eq!(profile.two_factor_backup_codes.len(), setup.backup_codes.len() - 1);
        assert!(!security
            .two_factor
            .verify_login("donor-1", &backup, &origin)
            .await
            .unwrap());
    }
}
