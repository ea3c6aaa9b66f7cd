use crate::{
    AlertType, Result, StorageError, Subject, UsageAlert, UsageAlertStore, UsageError,
    UsageEventType, UsageLimits, UsagePeriod,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_THRESHOLDS: [u8; 3] = [80, 90, 100];

/// Receives every newly created alert, e.g. to fan it out as e-mail.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn alert_created(&self, alert: &UsageAlert);
}

/// Raises threshold alerts for a period and manages their acknowledgement.
pub struct AlertEngine {
    alerts: Arc<dyn UsageAlertStore>,
    thresholds: Vec<u8>,
    notifier: Option<Arc<dyn AlertNotifier>>,
}

impl AlertEngine {
    pub fn new(alerts: Arc<dyn UsageAlertStore>, mut thresholds: Vec<u8>) -> Self {
        thresholds.retain(|t| *t > 0);
        thresholds.sort_unstable();
        thresholds.dedup();
        Self {
            alerts,
            thresholds,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn thresholds(&self) -> &[u8] {
        &self.thresholds
    }

    /// Creates an alert for every threshold `period` has reached on the given
    /// metrics that has no alert yet. The store's uniqueness on (subject,
    /// usage type, alert type, period) makes repeated evaluation a no-op.
    /// A failed create does not stop the remaining thresholds; the first
    /// failure is returned after all of them were tried.
    pub(crate) async fn evaluate(
        &self,
        period: &UsagePeriod,
        limits: &UsageLimits,
        metrics: &[UsageEventType],
    ) -> Result<Vec<UsageAlert>> {
        let mut created = Vec::new();
        let mut first_error = None;

        for metric in metrics {
            let limit = limits.get(*metric);
            if limit <= 0 {
                continue;
            }
            let used = period.usage_totals.get(*metric);

            for threshold in &self.thresholds {
                if !reached(used, limit, *threshold) {
                    break;
                }

                let alert = UsageAlert {
                    id: Uuid::new_v4(),
                    subject: period.subject,
                    alert_type: AlertType::for_threshold(*threshold),
                    usage_type: *metric,
                    current_usage: used,
                    usage_limit: limit,
                    percentage_used: used as f64 * 100.0 / limit as f64,
                    period_start: period.period_start,
                    period_end: period.period_end,
                    acknowledged: false,
                    acknowledged_at: None,
                    acknowledged_by: None,
                    created_at: Utc::now(),
                };

                match self.alerts.create(&alert).await {
                    Ok(()) => {
                        info!(
                            subject = %alert.subject,
                            usage_type = %alert.usage_type,
                            alert_type = %alert.alert_type,
                            current_usage = used,
                            usage_limit = limit,
                            "Usage alert raised"
                        );
                        if let Some(notifier) = &self.notifier {
                            notifier.alert_created(&alert).await;
                        }
                        created.push(alert);
                    }
                    Err(StorageError::Conflict(_)) => {}
                    Err(e) => {
                        warn!(
                            subject = %alert.subject,
                            usage_type = %alert.usage_type,
                            alert_type = %alert.alert_type,
                            error = %e,
                            "Failed to store usage alert"
                        );
                        first_error.get_or_insert(UsageError::storage("create usage alert")(e));
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(created),
        }
    }

    pub async fn unacknowledged(&self, subject: &Subject) -> Result<Vec<UsageAlert>> {
        self.alerts
            .find_unacknowledged(subject)
            .await
            .map_err(UsageError::storage("find unacknowledged alerts"))
    }

    /// The first acknowledgement wins; acknowledging again is a no-op.
    pub async fn acknowledge(&self, alert_id: Uuid, acting_user_id: Uuid) -> Result<UsageAlert> {
        match self.alerts.acknowledge(alert_id, acting_user_id, Utc::now()).await {
            Ok(alert) => {
                info!(%alert_id, acknowledged_by = ?alert.acknowledged_by, "Usage alert acknowledged");
                Ok(alert)
            }
            Err(StorageError::NotFound(_)) => {
                warn!(%alert_id, "Acknowledge requested for unknown alert");
                Err(UsageError::AlertNotFound(alert_id))
            }
            Err(e) => Err(UsageError::storage("acknowledge usage alert")(e)),
        }
    }
}

fn reached(used: i64, limit: i64, threshold: u8) -> bool {
    limit > 0 && used as i128 * 100 >= limit as i128 * threshold as i128
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BillingPeriod, InMemoryStorage, StorageResult, UsageTotals};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct CollectingNotifier {
        seen: Mutex<Vec<AlertType>>,
    }

    #[async_trait]
    impl AlertNotifier for CollectingNotifier {
        async fn alert_created(&self, alert: &UsageAlert) {
            self.seen.lock().await.push(alert.alert_type);
        }
    }

    fn limits() -> UsageLimits {
        UsageLimits {
            api_calls: 100,
            storage_bytes: 1000,
            compute_ms: 1000,
            file_uploads: 10,
        }
    }

    fn period_with(subject: Subject, api_calls: i64) -> UsagePeriod {
        let bounds = BillingPeriod::current();
        let now = Utc::now();
        UsagePeriod {
            id: Uuid::new_v4(),
            subject,
            period_start: bounds.start,
            period_end: bounds.end,
            usage_totals: UsageTotals {
                api_calls,
                ..Default::default()
            },
            usage_limits: limits(),
            created_at: now,
            updated_at: now,
        }
    }

    struct FlakyAlertStore {
        inner: InMemoryStorage,
        failures_left: AtomicUsize,
    }

    impl FlakyAlertStore {
        fn failing(times: usize) -> Self {
            Self {
                inner: InMemoryStorage::new(),
                failures_left: AtomicUsize::new(times),
            }
        }
    }

    #[async_trait]
    impl UsageAlertStore for FlakyAlertStore {
        async fn create(&self, alert: &UsageAlert) -> StorageResult<()> {
            let fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(StorageError::Backend("write timeout".to_string()));
            }
            UsageAlertStore::create(&self.inner, alert).await
        }

        async fn find_unacknowledged(&self, subject: &Subject) -> StorageResult<Vec<UsageAlert>> {
            self.inner.find_unacknowledged(subject).await
        }

        async fn acknowledge(
            &self,
            alert_id: Uuid,
            actor_id: Uuid,
            at: chrono::DateTime<Utc>,
        ) -> StorageResult<UsageAlert> {
            self.inner.acknowledge(alert_id, actor_id, at).await
        }
    }

    #[tokio::test]
    async fn test_threshold_fires_once_per_period() {
        let storage = Arc::new(InMemoryStorage::new());
        let engine = AlertEngine::new(storage.clone(), DEFAULT_THRESHOLDS.to_vec());
        let subject = Subject::User(Uuid::new_v4());
        let metrics = [UsageEventType::ApiCall];

        let below = engine
            .evaluate(&period_with(subject, 79), &limits(), &metrics)
            .await
            .unwrap();
        assert!(below.is_empty());

        let crossed = engine
            .evaluate(&period_with(subject, 80), &limits(), &metrics)
            .await
            .unwrap();
        assert_eq!(crossed.len(), 1);
        assert_eq!(crossed[0].alert_type, AlertType::Warning(80));

        for used in 81..90 {
            let again = engine
                .evaluate(&period_with(subject, used), &limits(), &metrics)
                .await
                .unwrap();
            assert!(again.is_empty());
        }

        let ninety = engine
            .evaluate(&period_with(subject, 90), &limits(), &metrics)
            .await
            .unwrap();
        assert_eq!(ninety.len(), 1);
        assert_eq!(ninety[0].alert_type, AlertType::Warning(90));

        assert_eq!(storage.alerts().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_create_is_retried_on_next_evaluation() {
        let store = Arc::new(FlakyAlertStore::failing(1));
        let engine = AlertEngine::new(store.clone(), DEFAULT_THRESHOLDS.to_vec());
        let subject = Subject::User(Uuid::new_v4());
        let metrics = [UsageEventType::ApiCall];

        // warning_80 fails; warning_90 is still written.
        let result = engine
            .evaluate(&period_with(subject, 95), &limits(), &metrics)
            .await;
        assert!(matches!(
            result,
            Err(UsageError::Storage { operation: "create usage alert", .. })
        ));
        let stored: Vec<AlertType> = store.inner.alerts().await.iter().map(|a| a.alert_type).collect();
        assert_eq!(stored, vec![AlertType::Warning(90)]);

        let retried = engine
            .evaluate(&period_with(subject, 96), &limits(), &metrics)
            .await
            .unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].alert_type, AlertType::Warning(80));
        assert_eq!(retried[0].current_usage, 96);
        assert_eq!(store.inner.alerts().await.len(), 2);
    }

    #[tokio::test]
    async fn test_jump_past_several_thresholds() {
        let storage = Arc::new(InMemoryStorage::new());
        let notifier = Arc::new(CollectingNotifier::default());
        let engine = AlertEngine::new(storage.clone(), DEFAULT_THRESHOLDS.to_vec())
            .with_notifier(notifier.clone());
        let subject = Subject::Organization(Uuid::new_v4());

        let alerts = engine
            .evaluate(
                &period_with(subject, 150),
                &limits(),
                &[UsageEventType::ApiCall],
            )
            .await
            .unwrap();

        let types: Vec<AlertType> = alerts.iter().map(|a| a.alert_type).collect();
        assert_eq!(
            types,
            vec![AlertType::Warning(80), AlertType::Warning(90), AlertType::Exceeded]
        );
        assert_eq!(alerts[2].percentage_used, 150.0);
        assert_eq!(*notifier.seen.lock().await, types);
    }

    #[tokio::test]
    async fn test_zero_limit_never_alerts() {
        let engine = AlertEngine::new(Arc::new(InMemoryStorage::new()), vec![80]);
        let subject = Subject::User(Uuid::new_v4());
        let zero = UsageLimits {
            api_calls: 0,
            ..limits()
        };

        let alerts = engine
            .evaluate(&period_with(subject, 500), &zero, &[UsageEventType::ApiCall])
            .await
            .unwrap();
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_first_actor_wins() {
        let storage = Arc::new(InMemoryStorage::new());
        let engine = AlertEngine::new(storage.clone(), vec![80]);
        let subject = Subject::User(Uuid::new_v4());
        let alert = engine
            .evaluate(&period_with(subject, 95), &limits(), &[UsageEventType::ApiCall])
            .await
            .unwrap()
            .remove(0);

        assert_eq!(engine.unacknowledged(&subject).await.unwrap().len(), 1);

        let first = Uuid::new_v4();
        let acked = engine.acknowledge(alert.id, first).await.unwrap();
        assert!(acked.acknowledged);
        assert_eq!(acked.acknowledged_by, Some(first));
        assert!(acked.acknowledged_at.is_some());

        let again = engine.acknowledge(alert.id, Uuid::new_v4()).await.unwrap();
        assert_eq!(again.acknowledged_by, Some(first));
        assert_eq!(again.acknowledged_at, acked.acknowledged_at);

        assert!(engine.unacknowledged(&subject).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_alert() {
        let engine = AlertEngine::new(Arc::new(InMemoryStorage::new()), vec![80]);
        let missing = Uuid::new_v4();
        let result = engine.acknowledge(missing, Uuid::new_v4()).await;
        assert!(matches!(result, Err(UsageError::AlertNotFound(id)) if id == missing));
    }

    #[test]
    fn test_thresholds_normalized() {
        let engine = AlertEngine::new(Arc::new(InMemoryStorage::new()), vec![100, 0, 80, 90, 80]);
        assert_eq!(engine.thresholds(), &[80, 90, 100]);
    }
}
