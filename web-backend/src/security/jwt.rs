use async_trait::async_trait;
use bloodlink_core::{Clock, Identity, IdentityProvider, ProfileStore, Role, SecureRequest};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::state::{UserDirectory, UserRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// HS256 bearer tokens. Expiry is checked against the injected clock.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
            clock,
        }
    }

    pub fn issue(&self, user: &UserRecord) -> Result<IssuedToken, jsonwebtoken::errors::Error> {
        let now = self.clock.now();
        let expires_at = now + self.ttl;
        let claims = Claims {
            sub: user.user_id.clone(),
            role: user.role,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(IssuedToken { token, expires_at })
    }

    /// Claims of a well-signed, unexpired token.
    pub fn verify(&self, token: &str) -> Option<Claims> {
        let claims = match decode::<Claims>(token, &self.decoding, &self.validation) {
            Ok(data) => data.claims,
            Err(err) => {
                debug!(error = %err, "Bearer token rejected");
                return None;
            }
        };
        if claims.exp <= self.clock.now().timestamp() {
            debug!(user_id = %claims.sub, "Bearer token expired");
            return None;
        }
        Some(claims)
    }
}

/// Resolves bearer tokens against the user directory, with lock and
/// second-factor state read from the security profile.
pub struct JwtIdentityProvider {
    tokens: Arc<TokenIssuer>,
    directory: Arc<UserDirectory>,
    profiles: Arc<dyn ProfileStore>,
}

impl JwtIdentityProvider {
    pub fn new(
        tokens: Arc<TokenIssuer>,
        directory: Arc<UserDirectory>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        Self {
            tokens,
            directory,
            profiles,
        }
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn resolve(&self, request: &SecureRequest) -> Option<Identity> {
        let claims = self.tokens.verify(request.bearer_token()?)?;
        let user = self.directory.get(&claims.sub).await?;

        let profile = match self.profiles.load_profile(&user.user_id).await {
            Ok(profile) => profile,
            Err(err) => {
                warn!(error = %err, user_id = %user.user_id, "Profile lookup failed");
                return None;
            }
        };

        // Role comes from the directory so demotions apply to live tokens.
        Some(Identity {
            user_id: user.user_id,
            role: user.role,
            is_active: user.is_active,
            is_locked: profile.as_ref().map_or(false, |p| p.is_locked),
            locked_until: profile.as_ref().and_then(|p| p.locked_until),
            two_factor_enabled: profile.as_ref().map_or(false, |p| p.two_factor_enabled),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloodlink_core::{MemoryStore, MockClock, UserSecurityProfile};
    use axum::http::Method;

    fn user(role: Role) -> UserRecord {
        UserRecord {
            user_id: "user-1".into(),
            email: "ayesha@example.org".into(),
            name: "Ayesha Rahman".into(),
            phone: None,
            role,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    fn bearer(token: &str) -> SecureRequest {
        SecureRequest::new(Method::GET, "/api/requests")
            .with_header("authorization", &format!("Bearer {}", token))
    }

    #[test]
    fn test_token_expires_on_injected_clock() {
        let clock = Arc::new(MockClock::fixed());
        let issuer = TokenIssuer::new(b"test-secret", Duration::minutes(10), clock.clone());
        let issued = issuer.issue(&user(Role::Donor)).unwrap();

        assert_eq!(issuer.verify(&issued.token).unwrap().sub, "user-1");
        clock.advance(Duration::minutes(11));
        assert!(issuer.verify(&issued.token).is_none());
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::fixed());
        let ours = TokenIssuer::new(b"ours", Duration::minutes(10), clock.clone());
        let theirs = TokenIssuer::new(b"theirs", Duration::minutes(10), clock);
        let forged = theirs.issue(&user(Role::Admin)).unwrap();
        assert!(ours.verify(&forged.token).is_none());
    }

    #[tokio::test]
    async fn test_resolve_reads_directory_and_profile() {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::fixed());
        let tokens = Arc::new(TokenIssuer::new(b"secret", Duration::minutes(10), clock.clone()));
        let directory = Arc::new(UserDirectory::default());
        let store = Arc::new(MemoryStore::new());
        let provider = JwtIdentityProvider::new(tokens.clone(), directory.clone(), store.clone());

        let issued = tokens.issue(&user(Role::Hospital)).unwrap();
        // Unknown to the directory
        assert!(provider.resolve(&bearer(&issued.token)).await.is_none());

        directory.insert(user(Role::Donor)).await;
        let mut profile = UserSecurityProfile::new("hash".into(), clock.now());
        profile.is_locked = true;
        profile.two_factor_enabled = true;
        store.save_profile("user-1", &profile).await.unwrap();

        let identity = provider.resolve(&bearer(&issued.token)).await.unwrap();
        assert_eq!(identity.role, Role::Donor);
        assert!(identity.is_locked);
        assert!(identity.two_factor_enabled);

        assert!(provider.resolve(&bearer("not-a-jwt")).await.is_none());
        assert!(provider
            .resolve(&SecureRequest::new(Method::GET, "/"))
            .await
            .is_none());
    }
}
