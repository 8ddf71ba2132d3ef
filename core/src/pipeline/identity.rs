use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::context::SecureRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Donor,
    Recipient,
    Hospital,
    Volunteer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Donor => "donor",
            Role::Recipient => "recipient",
            Role::Hospital => "hospital",
            Role::Volunteer => "volunteer",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "donor" => Ok(Role::Donor),
            "recipient" => Ok(Role::Recipient),
            "hospital" => Ok(Role::Hospital),
            "volunteer" => Ok(Role::Volunteer),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Caller identity as reported by the identity/session provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
    pub is_active: bool,
    pub is_locked: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub two_factor_enabled: bool,
}

impl Identity {
    /// Whether the account may act now. A lock without an end is permanent.
    pub fn can_act(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        match (self.is_locked, self.locked_until) {
            (false, _) => true,
            (true, Some(until)) => now > until,
            (true, None) => false,
        }
    }
}

/// Resolves request credentials to an identity, or `None` when absent or
/// invalid.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, request: &SecureRequest) -> Option<Identity>;
}

/// Provider for deployments without authentication; never resolves anyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousProvider;

#[async_trait]
impl IdentityProvider for AnonymousProvider {
    async fn resolve(&self, _request: &SecureRequest) -> Option<Identity> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn identity() -> Identity {
        Identity {
            user_id: "u1".into(),
            role: Role::Donor,
            is_active: true,
            is_locked: false,
            locked_until: None,
            two_factor_enabled: false,
        }
    }

    #[test]
    fn test_can_act() {
        let now = Utc::now();
        assert!(identity().can_act(now));
        assert!(!Identity { is_active: false, ..identity() }.can_act(now));
        assert!(!Identity { is_locked: true, ..identity() }.can_act(now));
        assert!(!Identity {
            is_locked: true,
            locked_until: Some(now + Duration::minutes(5)),
            ..identity()
        }
        .can_act(now));
        assert!(Identity {
            is_locked: true,
            locked_until: Some(now - Duration::minutes(5)),
            ..identity()
        }
        .can_act(now));
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("Hospital".parse::<Role>().unwrap(), Role::Hospital);
        assert!("root".parse::<Role>().is_err());
    }
}
