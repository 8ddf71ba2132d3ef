//! Durable storage contracts and the in-memory implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::alerts::SecurityAlert;
use crate::auth::{LoginAttempt, UserSecurityProfile};
use crate::error::StoreError;
use crate::events::{DataDeletionRecord, SecurityEvent, SecurityEventType};

/// Append-only logs plus alert upserts.
#[async_trait]
pub trait SecurityStore: Send + Sync {
    async fn append_event(&self, event: &SecurityEvent) -> Result<(), StoreError>;

    /// Events of one type at or after `since` whose IP equals `ip_address`.
    /// `None` selects only events recorded without an IP.
    async fn events_since(
        &self,
        event_type: SecurityEventType,
        since: DateTime<Utc>,
        ip_address: Option<&str>,
    ) -> Result<Vec<SecurityEvent>, StoreError>;

    /// Newest first, at most `limit`.
    async fn recent_events(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SecurityEvent>, StoreError>;

    async fn find_open_alert(
        &self,
        alert_type: SecurityEventType,
        scope_ip: Option<&str>,
    ) -> Result<Option<SecurityAlert>, StoreError>;

    async fn get_alert(&self, id: Uuid) -> Result<Option<SecurityAlert>, StoreError>;

    async fn upsert_alert(&self, alert: &SecurityAlert) -> Result<(), StoreError>;

    async fn list_alerts(&self, include_resolved: bool) -> Result<Vec<SecurityAlert>, StoreError>;

    async fn append_login_attempt(&self, attempt: &LoginAttempt) -> Result<(), StoreError>;

    async fn count_failed_logins(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    /// Drops every login attempt for a user. Returns how many were removed.
    async fn delete_login_attempts(&self, user_id: &str) -> Result<usize, StoreError>;

    async fn append_deletion(&self, record: &DataDeletionRecord) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn load_profile(&self, user_id: &str) -> Result<Option<UserSecurityProfile>, StoreError>;

    async fn save_profile(&self, user_id: &str, profile: &UserSecurityProfile) -> Result<(), StoreError>;

    /// Whether a profile existed.
    async fn delete_profile(&self, user_id: &str) -> Result<bool, StoreError>;
}

/// Process-local store for development and tests.
#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<Vec<SecurityEvent>>,
    alerts: RwLock<Vec<SecurityAlert>>,
    login_attempts: RwLock<Vec<LoginAttempt>>,
    deletions: RwLock<Vec<DataDeletionRecord>>,
    profiles: RwLock<HashMap<String, UserSecurityProfile>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event in insertion order.
    pub async fn all_events(&self) -> Vec<SecurityEvent> {
        self.events.read().await.clone()
    }

    pub async fn login_attempts(&self) -> Vec<LoginAttempt> {
        self.login_attempts.read().await.clone()
    }

    pub async fn deletion_log(&self) -> Vec<DataDeletionRecord> {
        self.deletions.read().await.clone()
    }
}

#[async_trait]
impl SecurityStore for MemoryStore {
    async fn append_event(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn events_since(
        &self,
        event_type: SecurityEventType,
        since: DateTime<Utc>,
        ip_address: Option<&str>,
    ) -> Result<Vec<SecurityEvent>, StoreError> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| e.event_type == event_type && e.timestamp >= since)
            .filter(|e| e.ip_address.as_deref() == ip_address)
            .cloned()
            .collect())
    }

    async fn recent_events(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SecurityEvent>, StoreError> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .rev()
            .filter(|e| e.timestamp >= since)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_open_alert(
        &self,
        alert_type: SecurityEventType,
        scope_ip: Option<&str>,
    ) -> Result<Option<SecurityAlert>, StoreError> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .iter()
            .find(|a| {
                !a.is_resolved && a.alert_type == alert_type && a.scope_ip.as_deref() == scope_ip
            })
            .cloned())
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<SecurityAlert>, StoreError> {
        let alerts = self.alerts.read().await;
        Ok(alerts.iter().find(|a| a.id == id).cloned())
    }

    async fn upsert_alert(&self, alert: &SecurityAlert) -> Result<(), StoreError> {
        let mut alerts = self.alerts.write().await;
        match alerts.iter_mut().find(|a| a.id == alert.id) {
            Some(existing) => *existing = alert.clone(),
            None => alerts.push(alert.clone()),
        }
        Ok(())
    }

    async fn list_alerts(&self, include_resolved: bool) -> Result<Vec<SecurityAlert>, StoreError> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .iter()
            .filter(|a| include_resolved || !a.is_resolved)
            .cloned()
            .collect())
    }

    async fn append_login_attempt(&self, attempt: &LoginAttempt) -> Result<(), StoreError> {
        self.login_attempts.write().await.push(attempt.clone());
        Ok(())
    }

    async fn count_failed_logins(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let attempts = self.login_attempts.read().await;
        let count = attempts
            .iter()
            .filter(|a| !a.success && a.user_id == user_id && a.timestamp >= since)
            .count();
        Ok(count as u32)
    }

    async fn delete_login_attempts(&self, user_id: &str) -> Result<usize, StoreError> {
        let mut attempts = self.login_attempts.write().await;
        let before = attempts.len();
        attempts.retain(|a| a.user_id != user_id);
        Ok(before - attempts.len())
    }

    async fn append_deletion(&self, record: &DataDeletionRecord) -> Result<(), StoreError> {
        self.deletions.write().await.push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn load_profile(&self, user_id: &str) -> Result<Option<UserSecurityProfile>, StoreError> {
        Ok(self.profiles.read().await.get(user_id).cloned())
    }

    async fn save_profile(&self, user_id: &str, profile: &UserSecurityProfile) -> Result<(), StoreError> {
        self.profiles
            .write()
            .await
            .insert(user_id.to_string(), profile.clone());
        Ok(())
    }

    async fn delete_profile(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.profiles.write().await.remove(user_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn attempt(user: &str, success: bool, at: DateTime<Utc>) -> LoginAttempt {
        LoginAttempt {
            user_id: user.to_string(),
            success,
            ip_address: None,
            user_agent: None,
            timestamp: at,
        }
    }

    #[tokio::test]
    async fn test_failed_logins_counted_per_user_and_window() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store.append_login_attempt(&attempt("u1", false, now - Duration::minutes(30))).await.unwrap();
        store.append_login_attempt(&attempt("u1", false, now)).await.unwrap();
        store.append_login_attempt(&attempt("u1", true, now)).await.unwrap();
        store.append_login_attempt(&attempt("u2", false, now)).await.unwrap();

        let since = now - Duration::minutes(15);
        assert_eq!(store.count_failed_logins("u1", since).await.unwrap(), 1);
        assert_eq!(store.count_failed_logins("u2", since).await.unwrap(), 1);
        assert_eq!(store.count_failed_logins("u3", since).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recent_events_newest_first() {
        let store = MemoryStore::new();
        let base = Utc::now();
        for i in 0..3 {
            let mut event = SecurityEvent::new(SecurityEventType::ApiAccess, format!("e{}", i));
            event.timestamp = base + Duration::seconds(i);
            store.append_event(&event).await.unwrap();
        }

        let recent = store.recent_events(base, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].description, "e2");
        assert_eq!(recent[1].description, "e1");
    }

    #[tokio::test]
    async fn test_profiles_round_trip() {
        let store = MemoryStore::new();
        assert!(store.load_profile("u1").await.unwrap().is_none());

        let profile = UserSecurityProfile::new("hash".to_string(), Utc::now());
        store.save_profile("u1", &profile).await.unwrap();
        assert_eq!(store.load_profile("u1").await.unwrap(), Some(profile));

        assert!(store.delete_profile("u1").await.unwrap());
        assert!(store.load_profile("u1").await.unwrap().is_none());
        assert!(!store.delete_profile("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_events_since_matches_ip_exactly() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut from_ip = SecurityEvent::new(SecurityEventType::FailedLogin, "with ip");
        from_ip.ip_address = Some("10.0.0.1".to_string());
        from_ip.timestamp = now;
        let mut without_ip = SecurityEvent::new(SecurityEventType::FailedLogin, "without ip");
        without_ip.timestamp = now;
        store.append_event(&from_ip).await.unwrap();
        store.append_event(&without_ip).await.unwrap();

        let scoped = store
            .events_since(SecurityEventType::FailedLogin, now, Some("10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].description, "with ip");

        let unscoped = store
            .events_since(SecurityEventType::FailedLogin, now, None)
            .await
            .unwrap();
        assert_eq!(unscoped.len(), 1);
        assert_eq!(unscoped[0].description, "without ip");
    }

    #[tokio::test]
    async fn test_delete_login_attempts_is_per_user() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.append_login_attempt(&attempt("u1", false, now)).await.unwrap();
        store.append_login_attempt(&attempt("u1", true, now)).await.unwrap();
        store.append_login_attempt(&attempt("u2", false, now)).await.unwrap();

        assert_eq!(store.delete_login_attempts("u1").await.unwrap(), 2);
        let remaining = store.login_attempts().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].user_id, "u2");
    }
}
