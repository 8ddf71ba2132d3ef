//! Typed security events and the logger that persists them.
//!
//! The logger is constructed explicitly and shared by `Arc`; there is no
//! global instance. Persistence failures are reported through `tracing` and
//! never propagate to the caller, so a broken store cannot fail a request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alerts::AlertAggregator;
use crate::clock::Clock;
use crate::error::StoreError;
use crate::sanitizer::{excerpt, ThreatKind};
use crate::store::SecurityStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventType {
    FailedLogin,
    SuccessfulLogin,
    BruteForceAttack,
    AccountLocked,
    AccountUnlocked,
    PasswordChanged,
    TwoFactorEnabled,
    TwoFactorDisabled,
    TwoFactorFailed,
    CsrfAttack,
    XssAttempt,
    SqlInjectionAttempt,
    MaliciousInput,
    RateLimitExceeded,
    UnauthorizedAccess,
    PrivilegeEscalation,
    SuspiciousActivity,
    ApiAccess,
    DataDeletion,
}

impl SecurityEventType {
    pub fn default_severity(&self) -> Severity {
        use SecurityEventType::*;
        match self {
            CsrfAttack | XssAttempt | SqlInjectionAttempt | PrivilegeEscalation
            | BruteForceAttack => Severity::Critical,
            UnauthorizedAccess | SuspiciousActivity | MaliciousInput | AccountLocked
            | TwoFactorFailed => Severity::High,
            RateLimitExceeded | FailedLogin | AccountUnlocked | TwoFactorDisabled => {
                Severity::Medium
            }
            SuccessfulLogin | PasswordChanged | TwoFactorEnabled | ApiAccess | DataDeletion => {
                Severity::Low
            }
        }
    }

    /// Occurrences within the alert window that open an alert.
    /// `u32::MAX` means the type never alerts.
    pub fn default_alert_threshold(&self) -> u32 {
        use SecurityEventType::*;
        match self {
            CsrfAttack | XssAttempt | SqlInjectionAttempt | PrivilegeEscalation
            | BruteForceAttack | AccountLocked => 1,
            MaliciousInput => 3,
            FailedLogin | SuspiciousActivity | TwoFactorFailed => 5,
            UnauthorizedAccess | RateLimitExceeded => 10,
            SuccessfulLogin | AccountUnlocked | PasswordChanged | TwoFactorEnabled
            | TwoFactorDisabled | ApiAccess | DataDeletion => u32::MAX,
        }
    }

    /// snake_case name used in configuration keys.
    pub fn key(&self) -> &'static str {
        use SecurityEventType::*;
        match self {
            FailedLogin => "failed_login",
            SuccessfulLogin => "successful_login",
            BruteForceAttack => "brute_force_attack",
            AccountLocked => "account_locked",
            AccountUnlocked => "account_unlocked",
            PasswordChanged => "password_changed",
            TwoFactorEnabled => "two_factor_enabled",
            TwoFactorDisabled => "two_factor_disabled",
            TwoFactorFailed => "two_factor_failed",
            CsrfAttack => "csrf_attack",
            XssAttempt => "xss_attempt",
            SqlInjectionAttempt => "sql_injection_attempt",
            MaliciousInput => "malicious_input",
            RateLimitExceeded => "rate_limit_exceeded",
            UnauthorizedAccess => "unauthorized_access",
            PrivilegeEscalation => "privilege_escalation",
            SuspiciousActivity => "suspicious_activity",
            ApiAccess => "api_access",
            DataDeletion => "data_deletion",
        }
    }

    pub fn for_threat(kind: ThreatKind) -> Self {
        match kind {
            ThreatKind::Xss => SecurityEventType::XssAttempt,
            ThreatKind::SqlInjection => SecurityEventType::SqlInjectionAttempt,
            ThreatKind::PathTraversal
            | ThreatKind::CommandInjection
            | ThreatKind::LdapInjection => SecurityEventType::MaliciousInput,
        }
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Structured, per-kind payload of an event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDetail {
    #[default]
    None,
    Threat {
        field: String,
        threat: ThreatKind,
        excerpt: String,
    },
    RateLimit {
        route_class: String,
        limit: u32,
        reset_at: DateTime<Utc>,
    },
    Access {
        method: String,
        path: String,
        authenticated: bool,
    },
    Lockout {
        failed_attempts: u32,
        locked_until: DateTime<Utc>,
    },
    Authorization {
        required_roles: Vec<String>,
        actual_role: Option<String>,
    },
    Alerted {
        alert_id: Uuid,
    },
}

/// Who or what caused an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventOrigin {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub user_id: Option<String>,
}

impl EventOrigin {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub description: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub user_id: Option<String>,
    pub detail: EventDetail,
    /// Forward-compatible extra fields.
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            severity: event_type.default_severity(),
            description: description.into(),
            ip_address: None,
            user_agent: None,
            user_id: None,
            detail: EventDetail::None,
            extra: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_origin(mut self, origin: &EventOrigin) -> Self {
        self.ip_address = origin.ip_address.clone();
        self.user_agent = origin.user_agent.clone();
        self.user_id = origin.user_id.clone();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_detail(mut self, detail: EventDetail) -> Self {
        self.detail = detail;
        self
    }

    pub fn with_extra<T: Serialize>(mut self, key: &str, value: T) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.extra.insert(key.to_string(), value);
        }
        self
    }
}

/// Append-only record of a personal-data deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDeletionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub requested_by: String,
    pub reason: String,
    pub entities: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SecuritySummary {
    pub since: Option<DateTime<Utc>>,
    pub total_events: usize,
    pub by_type: BTreeMap<SecurityEventType, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub open_alerts: usize,
}

pub struct SecurityEventLogger {
    store: Arc<dyn SecurityStore>,
    clock: Arc<dyn Clock>,
    alerts: Option<AlertAggregator>,
    excerpt_length: usize,
}

impl SecurityEventLogger {
    pub fn new(store: Arc<dyn SecurityStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            alerts: None,
            excerpt_length: 100,
        }
    }

    pub fn with_alerts(mut self, aggregator: AlertAggregator) -> Self {
        self.alerts = Some(aggregator);
        self
    }

    pub fn with_excerpt_length(mut self, excerpt_length: usize) -> Self {
        self.excerpt_length = excerpt_length;
        self
    }

    pub fn alerts(&self) -> Option<&AlertAggregator> {
        self.alerts.as_ref()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Stamp, persist and evaluate an event for alerting.
    pub async fn log_event(&self, mut event: SecurityEvent) {
        event.timestamp = self.clock.now();
        mirror_to_tracing(&event);

        if let Err(err) = self.store.append_event(&event).await {
            error!(
                error = %err,
                event_id = %event.id,
                event_type = %event.event_type,
                "Failed to persist security event"
            );
            return;
        }

        if let Some(aggregator) = &self.alerts {
            if let Err(err) = aggregator.process(&event).await {
                error!(error = %err, event_id = %event.id, "Alert evaluation failed");
            }
        }
    }

    pub async fn log_failed_login(&self, origin: &EventOrigin, reason: &str) {
        self.log_event(
            SecurityEvent::new(
                SecurityEventType::FailedLogin,
                format!("Failed login attempt: {}", reason),
            )
            .with_origin(origin),
        )
        .await;
    }

    pub async fn log_successful_login(&self, origin: &EventOrigin) {
        self.log_event(
            SecurityEvent::new(SecurityEventType::SuccessfulLogin, "Successful login")
                .with_origin(origin),
        )
        .await;
    }

    pub async fn log_brute_force(
        &self,
        origin: &EventOrigin,
        failed_attempts: u32,
        locked_until: DateTime<Utc>,
    ) {
        self.log_event(
            SecurityEvent::new(
                SecurityEventType::BruteForceAttack,
                format!("Account locked after {} failed login attempts", failed_attempts),
            )
            .with_origin(origin)
            .with_detail(EventDetail::Lockout {
                failed_attempts,
                locked_until,
            }),
        )
        .await;
    }

    pub async fn log_csrf_attempt(&self, origin: &EventOrigin, reason: &str) {
        self.log_event(
            SecurityEvent::new(
                SecurityEventType::CsrfAttack,
                format!("CSRF validation failed: {}", reason),
            )
            .with_origin(origin),
        )
        .await;
    }

    pub async fn log_rate_limit_exceeded(
        &self,
        origin: &EventOrigin,
        route_class: &str,
        limit: u32,
        reset_at: DateTime<Utc>,
    ) {
        self.log_event(
            SecurityEvent::new(
                SecurityEventType::RateLimitExceeded,
                format!("Rate limit exceeded for {} routes", route_class),
            )
            .with_origin(origin)
            .with_detail(EventDetail::RateLimit {
                route_class: route_class.to_string(),
                limit,
                reset_at,
            }),
        )
        .await;
    }

    pub async fn log_unauthorized_access(&self, origin: &EventOrigin, description: &str) {
        self.log_event(
            SecurityEvent::new(SecurityEventType::UnauthorizedAccess, description)
                .with_origin(origin),
        )
        .await;
    }

    pub async fn log_suspicious_activity(&self, origin: &EventOrigin, description: &str) {
        self.log_event(
            SecurityEvent::new(SecurityEventType::SuspiciousActivity, description)
                .with_origin(origin),
        )
        .await;
    }

    pub async fn log_xss_attempt(&self, origin: &EventOrigin, field: &str, payload: &str) {
        self.log_threat(origin, field, ThreatKind::Xss, payload).await;
    }

    pub async fn log_sql_injection(&self, origin: &EventOrigin, field: &str, payload: &str) {
        self.log_threat(origin, field, ThreatKind::SqlInjection, payload)
            .await;
    }

    /// One event per detected threat family, with a capped payload excerpt.
    pub async fn log_threats(
        &self,
        origin: &EventOrigin,
        field: &str,
        threats: &[ThreatKind],
        payload: &str,
    ) {
        for threat in threats {
            self.log_threat(origin, field, *threat, payload).await;
        }
    }

    async fn log_threat(&self, origin: &EventOrigin, field: &str, threat: ThreatKind, payload: &str) {
        self.log_event(
            SecurityEvent::new(
                SecurityEventType::for_threat(threat),
                format!("{} pattern detected in field {}", threat, field),
            )
            .with_origin(origin)
            .with_detail(EventDetail::Threat {
                field: field.to_string(),
                threat,
                excerpt: excerpt(payload, self.excerpt_length),
            }),
        )
        .await;
    }

    pub async fn log_access(&self, origin: &EventOrigin, method: &str, path: &str) {
        let authenticated = origin.user_id.is_some();
        self.log_event(
            SecurityEvent::new(
                SecurityEventType::ApiAccess,
                format!("{} {}", method, path),
            )
            .with_origin(origin)
            .with_detail(EventDetail::Access {
                method: method.to_string(),
                path: path.to_string(),
                authenticated,
            }),
        )
        .await;
    }

    pub async fn record_data_deletion(
        &self,
        user_id: &str,
        requested_by: &str,
        reason: &str,
        entities: Vec<String>,
    ) -> Result<DataDeletionRecord, StoreError> {
        let record = DataDeletionRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            requested_by: requested_by.to_string(),
            reason: reason.to_string(),
            entities,
            timestamp: self.clock.now(),
        };
        self.store.append_deletion(&record).await?;

        self.log_event(
            SecurityEvent::new(
                SecurityEventType::DataDeletion,
                format!("Personal data deleted for user {}", user_id),
            )
            .with_user(requested_by)
            .with_extra("subject_user_id", user_id)
            .with_extra("entities", &record.entities),
        )
        .await;

        Ok(record)
    }

    pub async fn recent_events(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SecurityEvent>, StoreError> {
        self.store.recent_events(since, limit).await
    }

    pub async fn summary(&self, since: DateTime<Utc>) -> Result<SecuritySummary, StoreError> {
        let events = self.store.recent_events(since, usize::MAX).await?;
        let mut summary = SecuritySummary {
            since: Some(since),
            total_events: events.len(),
            ..SecuritySummary::default()
        };
        for event in &events {
            *summary.by_type.entry(event.event_type).or_default() += 1;
            *summary.by_severity.entry(event.severity).or_default() += 1;
        }
        summary.open_alerts = self.store.list_alerts(false).await?.len();
        Ok(summary)
    }
}

fn mirror_to_tracing(event: &SecurityEvent) {
    match event.severity {
        Severity::Low => info!(
            event_type = %event.event_type,
            ip = ?event.ip_address,
            user_id = ?event.user_id,
            "SECURITY EVENT: {}", event.description
        ),
        Severity::Medium | Severity::High => warn!(
            event_type = %event.event_type,
            severity = ?event.severity,
            ip = ?event.ip_address,
            user_id = ?event.user_id,
            "SECURITY EVENT: {}", event.description
        ),
        Severity::Critical => error!(
            event_type = %event.event_type,
            ip = ?event.ip_address,
            user_id = ?event.user_id,
            "CRITICAL SECURITY EVENT: {}", event.description
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn logger() -> (Arc<MockClock>, Arc<MemoryStore>, SecurityEventLogger) {
        let clock = Arc::new(MockClock::fixed());
        let store = Arc::new(MemoryStore::new());
        let logger = SecurityEventLogger::new(store.clone(), clock.clone());
        (clock, store, logger)
    }

    #[test]
    fn test_default_severities() {
        assert_eq!(SecurityEventType::CsrfAttack.default_severity(), Severity::Critical);
        assert_eq!(SecurityEventType::BruteForceAttack.default_severity(), Severity::Critical);
        assert_eq!(SecurityEventType::MaliciousInput.default_severity(), Severity::High);
        assert_eq!(SecurityEventType::UnauthorizedAccess.default_severity(), Severity::High);
        assert_eq!(SecurityEventType::RateLimitExceeded.default_severity(), Severity::Medium);
        assert_eq!(SecurityEventType::FailedLogin.default_severity(), Severity::Medium);
        assert_eq!(SecurityEventType::ApiAccess.default_severity(), Severity::Low);
        assert!(Severity::Critical > Severity::High);
    }

    #[tokio::test]
    async fn test_events_are_stamped_with_clock() {
        let (clock, store, logger) = logger();
        logger
            .log_failed_login(&EventOrigin::user("u1").with_ip("10.0.0.1"), "bad password")
            .await;

        let events = store.all_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, clock.now());
        assert_eq!(events[0].severity, Severity::Medium);
        assert_eq!(events[0].ip_address.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_threats_logged_separately_with_excerpt() {
        let (_clock, store, logger) = logger();
        let payload = format!("<script>{}</script>' OR 1=1 --", "x".repeat(300));
        logger
            .log_threats(
                &EventOrigin::default(),
                "notes",
                &[ThreatKind::Xss, ThreatKind::SqlInjection],
                &payload,
            )
            .await;

        let events = store.all_events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, SecurityEventType::XssAttempt);
        assert_eq!(events[1].event_type, SecurityEventType::SqlInjectionAttempt);
        match &events[0].detail {
            EventDetail::Threat { field, excerpt, .. } => {
                assert_eq!(field, "notes");
                assert_eq!(excerpt.chars().count(), 103);
            }
            other => panic!("unexpected detail {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_summary_counts_by_type_and_severity() {
        let (clock, _store, logger) = logger();
        let start = clock.now();
        let origin = EventOrigin::default();

        logger.log_access(&origin, "GET", "/api/requests").await;
        logger.log_failed_login(&origin, "unknown user").await;
        clock.advance(Duration::minutes(1));
        logger.log_failed_login(&origin, "bad password").await;

        let summary = logger.summary(start).await.unwrap();
        assert_eq!(summary.total_events, 3);
        assert_eq!(summary.by_type[&SecurityEventType::FailedLogin], 2);
        assert_eq!(summary.by_severity[&Severity::Low], 1);

        let later = logger.summary(start + Duration::seconds(30)).await.unwrap();
        assert_eq!(later.total_events, 1);
    }

    #[tokio::test]
    async fn test_data_deletion_is_recorded() {
        let (_clock, store, logger) = logger();
        let record = logger
            .record_data_deletion("donor-1", "admin-1", "GDPR request", vec!["profile".into()])
            .await
            .unwrap();

        assert_eq!(store.deletion_log().await, vec![record]);
        let events = store.all_events().await;
        assert_eq!(events[0].event_type, SecurityEventType::DataDeletion);
        assert_eq!(events[0].extra["subject_user_id"], "donor-1");
    }
}
