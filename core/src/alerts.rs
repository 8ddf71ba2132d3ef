//! Threshold-based alerting over recently logged events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::AlertSettings;
use crate::error::{AlertError, StoreError};
use crate::events::{SecurityEvent, SecurityEventType, Severity};
use crate::store::SecurityStore;

/// One incident. At most one unresolved alert exists per (type, ip) scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub id: Uuid,
    pub alert_type: SecurityEventType,
    pub severity: Severity,
    pub count: u32,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    /// Scope of the alert; `None` for events without an IP.
    pub scope_ip: Option<String>,
    pub ip_addresses: BTreeSet<String>,
    pub user_ids: BTreeSet<String>,
    pub is_resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SecurityAlert {
    fn absorb(&mut self, event: &SecurityEvent) {
        if let Some(ip) = &event.ip_address {
            self.ip_addresses.insert(ip.clone());
        }
        if let Some(user) = &event.user_id {
            self.user_ids.insert(user.clone());
        }
    }
}

/// Out-of-band channel invoked when a CRITICAL alert opens.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &SecurityAlert);
}

/// Writes critical alerts to the error log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl AlertNotifier for TracingNotifier {
    async fn notify(&self, alert: &SecurityAlert) {
        error!(
            alert_id = %alert.id,
            alert_type = %alert.alert_type,
            count = alert.count,
            ips = ?alert.ip_addresses,
            "CRITICAL SECURITY ALERT opened"
        );
    }
}

#[derive(Clone)]
pub struct AlertAggregator {
    store: Arc<dyn SecurityStore>,
    clock: Arc<dyn Clock>,
    settings: AlertSettings,
    notifier: Option<Arc<dyn AlertNotifier>>,
    // Serializes find-or-create so concurrent events cannot open twin alerts.
    gate: Arc<Mutex<()>>,
}

impl AlertAggregator {
    pub fn new(store: Arc<dyn SecurityStore>, clock: Arc<dyn Clock>, settings: AlertSettings) -> Self {
        Self {
            store,
            clock,
            settings,
            notifier: None,
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Open or update the alert for `event`'s scope once the trailing-window
    /// count reaches the type's threshold.
    pub async fn process(&self, event: &SecurityEvent) -> Result<Option<SecurityAlert>, StoreError> {
        let threshold = self.settings.threshold_for(event.event_type);
        if threshold == u32::MAX {
            return Ok(None);
        }

        let _guard = self.gate.lock().await;
        let since = self.clock.now() - self.settings.window();
        let scope_ip = event.ip_address.as_deref();
        let recent = self
            .store
            .events_since(event.event_type, since, scope_ip)
            .await?;
        if (recent.len() as u64) < u64::from(threshold) {
            return Ok(None);
        }

        if let Some(mut alert) = self.store.find_open_alert(event.event_type, scope_ip).await? {
            alert.count = alert.count.saturating_add(1);
            alert.last_occurrence = event.timestamp;
            alert.absorb(event);
            self.store.upsert_alert(&alert).await?;
            return Ok(Some(alert));
        }

        let first_occurrence = recent
            .iter()
            .map(|e| e.timestamp)
            .min()
            .unwrap_or(event.timestamp);
        let mut alert = SecurityAlert {
            id: Uuid::new_v4(),
            alert_type: event.event_type,
            severity: event.severity,
            count: recent.len() as u32,
            first_occurrence,
            last_occurrence: event.timestamp,
            scope_ip: event.ip_address.clone(),
            ip_addresses: BTreeSet::new(),
            user_ids: BTreeSet::new(),
            is_resolved: false,
            resolved_by: None,
            resolved_at: None,
        };
        for seen in &recent {
            alert.absorb(seen);
        }
        self.store.upsert_alert(&alert).await?;

        info!(
            alert_id = %alert.id,
            alert_type = %alert.alert_type,
            count = alert.count,
            "Security alert opened"
        );
        if alert.severity == Severity::Critical {
            if let Some(notifier) = &self.notifier {
                notifier.notify(&alert).await;
            }
        }

        Ok(Some(alert))
    }

    /// Operator action closing an incident. Resolution is terminal.
    pub async fn resolve(&self, alert_id: Uuid, resolved_by: &str) -> Result<SecurityAlert, AlertError> {
        let mut alert = self
            .store
            .get_alert(alert_id)
            .await?
            .ok_or(AlertError::NotFound(alert_id))?;
        if alert.is_resolved {
            return Err(AlertError::AlreadyResolved(alert_id));
        }

        alert.is_resolved = true;
        alert.resolved_by = Some(resolved_by.to_string());
        alert.resolved_at = Some(self.clock.now());
        self.store.upsert_alert(&alert).await?;

        info!(alert_id = %alert_id, resolved_by = %resolved_by, "Security alert resolved");
        Ok(alert)
    }

    pub async fn list(&self, include_resolved: bool) -> Result<Vec<SecurityAlert>, StoreError> {
        self.store.list_alerts(include_resolved).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::events::{EventOrigin, SecurityEventLogger};
    use crate::store::MemoryStore;
    use chrono::Duration;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: std::sync::Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl AlertNotifier for RecordingNotifier {
        async fn notify(&self, alert: &SecurityAlert) {
            self.seen.lock().unwrap().push(alert.id);
        }
    }

    struct Harness {
        clock: Arc<MockClock>,
        logger: SecurityEventLogger,
        aggregator: AlertAggregator,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(MockClock::fixed());
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let aggregator = AlertAggregator::new(store.clone(), clock.clone(), AlertSettings::default())
            .with_notifier(notifier.clone());
        let logger =
            SecurityEventLogger::new(store, clock.clone()).with_alerts(aggregator.clone());
        Harness {
            clock,
            logger,
            aggregator,
            notifier,
        }
    }

    fn from_ip(ip: &str) -> EventOrigin {
        EventOrigin::default().with_ip(ip)
    }

    #[tokio::test]
    async fn test_repeated_events_update_one_alert() {
        let h = harness();
        // FailedLogin alerts at 5 occurrences
        for i in 0..8 {
            h.logger
                .log_failed_login(&from_ip("10.0.0.1"), &format!("attempt {}", i))
                .await;
            h.clock.advance(Duration::seconds(10));
        }

        let alerts = h.aggregator.list(true).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].count, 8);
        assert_eq!(alerts[0].alert_type, SecurityEventType::FailedLogin);
        assert_eq!(
            alerts[0].last_occurrence - alerts[0].first_occurrence,
            Duration::seconds(70)
        );
        // Medium severity never pages
        assert!(h.notifier.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_below_threshold_opens_nothing() {
        let h = harness();
        for _ in 0..4 {
            h.logger.log_failed_login(&from_ip("10.0.0.1"), "bad").await;
        }
        assert!(h.aggregator.list(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events_outside_window_do_not_count() {
        let h = harness();
        for _ in 0..4 {
            h.logger.log_failed_login(&from_ip("10.0.0.1"), "bad").await;
        }
        h.clock.advance(Duration::minutes(16));
        h.logger.log_failed_login(&from_ip("10.0.0.1"), "bad").await;

        assert!(h.aggregator.list(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scopes_are_per_ip() {
        let h = harness();
        h.logger.log_csrf_attempt(&from_ip("1.1.1.1"), "bad token").await;
        h.logger.log_csrf_attempt(&from_ip("2.2.2.2"), "bad token").await;
        h.logger.log_csrf_attempt(&from_ip("1.1.1.1"), "bad token").await;

        let alerts = h.aggregator.list(false).await.unwrap();
        assert_eq!(alerts.len(), 2);
        let first = alerts
            .iter()
            .find(|a| a.scope_ip.as_deref() == Some("1.1.1.1"))
            .unwrap();
        assert_eq!(first.count, 2);
        assert_eq!(h.notifier.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_events_without_ip_form_their_own_bucket() {
        let h = harness();
        for _ in 0..4 {
            h.logger.log_failed_login(&from_ip("10.0.0.1"), "bad").await;
        }
        h.logger.log_failed_login(&EventOrigin::default(), "bad").await;
        assert!(h.aggregator.list(true).await.unwrap().is_empty());

        for _ in 0..4 {
            h.logger.log_failed_login(&EventOrigin::default(), "bad").await;
        }
        let alerts = h.aggregator.list(true).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].scope_ip, None);
        assert_eq!(alerts[0].count, 5);
        assert!(alerts[0].ip_addresses.is_empty());
    }

    #[tokio::test]
    async fn test_resolution_is_terminal_and_new_ip_is_new_incident() {
        let h = harness();
        h.logger.log_csrf_attempt(&from_ip("1.1.1.1"), "bad token").await;
        let open = h.aggregator.list(false).await.unwrap();
        assert_eq!(open.len(), 1);

        let resolved = h.aggregator.resolve(open[0].id, "ops@bloodlink").await.unwrap();
        assert!(resolved.is_resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("ops@bloodlink"));
        assert_eq!(resolved.resolved_at, Some(h.clock.now()));
        assert!(matches!(
            h.aggregator.resolve(open[0].id, "ops@bloodlink").await,
            Err(AlertError::AlreadyResolved(_))
        ));

        h.logger.log_csrf_attempt(&from_ip("3.3.3.3"), "bad token").await;
        let open = h.aggregator.list(false).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].scope_ip.as_deref(), Some("3.3.3.3"));
        assert_eq!(open[0].count, 1);
        assert_eq!(h.aggregator.list(true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_unknown_alert() {
        let h = harness();
        assert!(matches!(
            h.aggregator.resolve(Uuid::new_v4(), "ops").await,
            Err(AlertError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_low_severity_types_never_alert() {
        let h = harness();
        for _ in 0..20 {
            h.logger.log_access(&from_ip("1.1.1.1"), "GET", "/").await;
        }
        assert!(h.aggregator.list(true).await.unwrap().is_empty());
    }
}
