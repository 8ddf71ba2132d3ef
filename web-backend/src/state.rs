use bloodlink_core::{
    Backends, BloodLinkSecurity, Clock, MemoryKvStore, MemoryStore, Role, SecuritySettings,
    TracingNotifier, UserInfo,
};
use bloodlink_core::sanitizer::UploadPolicy;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::security::jwt::{JwtIdentityProvider, TokenIssuer};
use crate::settings::ServerSettings;

/// Account record kept by the directory; credentials live in the
/// security profile store.
#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn user_info(&self) -> UserInfo {
        UserInfo {
            name: Some(self.name.clone()),
            email: Some(self.email.clone()),
            phone: self.phone.clone(),
        }
    }
}

#[derive(Default)]
pub struct UserDirectory {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl UserDirectory {
    /// Returns false when the email is already registered.
    pub async fn insert(&self, record: UserRecord) -> bool {
        let mut users = self.users.write().await;
        if users
            .values()
            .any(|existing| existing.email.eq_ignore_ascii_case(&record.email))
        {
            return false;
        }
        users.insert(record.user_id.clone(), record);
        true
    }

    pub async fn get(&self, user_id: &str) -> Option<UserRecord> {
        self.users.read().await.get(user_id).cloned()
    }

    pub async fn find_by_email(&self, email: &str) -> Option<UserRecord> {
        self.users
            .read()
            .await
            .values()
            .find(|user| user.email.eq_ignore_ascii_case(email.trim()))
            .cloned()
    }

    pub async fn remove(&self, user_id: &str) -> Option<UserRecord> {
        self.users.write().await.remove(user_id)
    }
}

/// A posted blood request, stored as sanitized.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BloodRequestRecord {
    pub id: Uuid,
    pub requested_by: String,
    pub request: Value,
    pub created_at: DateTime<Utc>,
}

/// Why a registration was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    EmailTaken,
    WeakPassword(Vec<String>),
}

/// Settings the HTTP layer needs per request.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub trust_proxy: bool,
    pub max_body_bytes: usize,
    pub session_cookie: String,
    pub secure_cookies: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub security: Arc<BloodLinkSecurity>,
    pub store: Arc<MemoryStore>,
    pub directory: Arc<UserDirectory>,
    pub tokens: Arc<TokenIssuer>,
    pub uploads: Arc<UploadPolicy>,
    pub requests: Arc<RwLock<Vec<BloodRequestRecord>>>,
    pub http: Arc<HttpSettings>,
}

impl AppState {
    pub async fn new(
        security_settings: SecuritySettings,
        server: &ServerSettings,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(UserDirectory::default());

        let secret = match &server.jwt_secret {
            Some(secret) => secret.expose_secret().as_bytes().to_vec(),
            None => {
                warn!("No JWT secret configured; tokens will not survive a restart");
                let mut bytes = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                bytes
            }
        };
        let tokens = Arc::new(TokenIssuer::new(
            &secret,
            Duration::seconds(server.token_ttl_secs),
            clock.clone(),
        ));

        let identities = Arc::new(JwtIdentityProvider::new(
            tokens.clone(),
            directory.clone(),
            store.clone(),
        ));
        let backends = Backends {
            kv: Arc::new(MemoryKvStore::new(clock.clone())),
            store: store.clone(),
            profiles: store.clone(),
        };
        let security = Arc::new(BloodLinkSecurity::new(
            security_settings,
            backends,
            identities,
            Arc::new(TracingNotifier),
            clock,
        ));

        let state = Self {
            security,
            store,
            directory,
            tokens,
            uploads: Arc::new(UploadPolicy::default()),
            requests: Arc::new(RwLock::new(Vec::new())),
            http: Arc::new(HttpSettings {
                trust_proxy: server.trust_proxy,
                max_body_bytes: server.max_body_bytes,
                session_cookie: server.session_cookie.clone(),
                secure_cookies: server.secure_cookies,
            }),
        };

        if let (Some(email), Some(password)) = (
            &server.bootstrap_admin_email,
            &server.bootstrap_admin_password,
        ) {
            state
                .bootstrap_admin(email, password.expose_secret())
                .await?;
        }
        Ok(state)
    }

    /// Register a user and set their first password.
    pub async fn register(
        &self,
        email: &str,
        name: &str,
        phone: Option<String>,
        role: Role,
        password: &str,
    ) -> anyhow::Result<Result<UserRecord, Registration>> {
        let record = UserRecord {
            user_id: Uuid::new_v4().to_string(),
            email: email.trim().to_ascii_lowercase(),
            name: name.trim().to_string(),
            phone,
            role,
            is_active: true,
            created_at: self.security.clock.now(),
        };

        let validation = self
            .security
            .accounts
            .policy()
            .validate(password, Some(&record.user_info()));
        if !validation.is_valid {
            return Ok(Err(Registration::WeakPassword(validation.errors)));
        }
        if !self.directory.insert(record.clone()).await {
            return Ok(Err(Registration::EmailTaken));
        }

        if let Err(err) = self
            .security
            .accounts
            .set_initial_password(&record.user_id, password, Some(&record.user_info()))
            .await
        {
            self.directory.remove(&record.user_id).await;
            warn!(user_id = %record.user_id, error = %err, "Registration rolled back");
            return Err(err.into());
        }
        info!(user_id = %record.user_id, role = %record.role, "User registered");
        Ok(Ok(record))
    }

    async fn bootstrap_admin(&self, email: &str, password: &str) -> anyhow::Result<()> {
        if self.directory.find_by_email(email).await.is_some() {
            return Ok(());
        }
        match self
            .register(email, "Administrator", None, Role::Admin, password)
            .await?
        {
            Ok(record) => info!(user_id = %record.user_id, "Bootstrap admin created"),
            Err(Registration::WeakPassword(errors)) => {
                anyhow::bail!("bootstrap admin password rejected: {}", errors.join("; "))
            }
            Err(Registration::EmailTaken) => {}
        }
        Ok(())
    }
}
