use crate::{Subject, UsageAlert, UsageEvent, UsageLimits, UsagePeriod, UsageTotals};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// A uniqueness constraint rejected the write.
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait UsageEventStore: Send + Sync {
    async fn create(&self, event: &UsageEvent) -> StorageResult<()>;
}

#[async_trait]
pub trait UsagePeriodStore: Send + Sync {
    async fn find(
        &self,
        subject: &Subject,
        period_start: NaiveDate,
    ) -> StorageResult<Option<UsagePeriod>>;
    /// Fails with `Conflict` if the subject already has a row for that month.
    async fn create(&self, period: &UsagePeriod) -> StorageResult<()>;
    /// Replaces the limit snapshot in place, leaving totals untouched.
    async fn update_limits(
        &self,
        subject: &Subject,
        period_start: NaiveDate,
        limits: &UsageLimits,
    ) -> StorageResult<UsagePeriod>;
    /// Atomically adds `delta` to the stored totals and returns the new row.
    async fn add_usage(
        &self,
        subject: &Subject,
        period_start: NaiveDate,
        delta: &UsageTotals,
    ) -> StorageResult<UsagePeriod>;
    /// Up to `months` periods, newest first.
    async fn find_history(&self, subject: &Subject, months: usize)
        -> StorageResult<Vec<UsagePeriod>>;
}

#[async_trait]
pub trait UsageAlertStore: Send + Sync {
    /// Fails with `Conflict` if an alert with the same subject, usage type,
    /// alert type and period already exists.
    async fn create(&self, alert: &UsageAlert) -> StorageResult<()>;
    async fn find_unacknowledged(&self, subject: &Subject) -> StorageResult<Vec<UsageAlert>>;
    /// Marks the alert acknowledged. Already-acknowledged alerts keep their
    /// original acknowledger.
    async fn acknowledge(
        &self,
        alert_id: Uuid,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) -> StorageResult<UsageAlert>;
}

// In-memory storage implementation for development/testing
#[derive(Default)]
pub struct InMemoryStorage {
    events: Arc<RwLock<Vec<UsageEvent>>>,
    periods: Arc<RwLock<HashMap<(Subject, NaiveDate), UsagePeriod>>>,
    alerts: Arc<RwLock<Vec<UsageAlert>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, in insertion order.
    pub async fn events(&self) -> Vec<UsageEvent> {
        self.events.read().await.clone()
    }

    pub async fn alerts(&self) -> Vec<UsageAlert> {
        self.alerts.read().await.clone()
    }
}

#[async_trait]
impl UsageEventStore for InMemoryStorage {
    async fn create(&self, event: &UsageEvent) -> StorageResult<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl UsagePeriodStore for InMemoryStorage {
    async fn find(
        &self,
        subject: &Subject,
        period_start: NaiveDate,
    ) -> StorageResult<Option<UsagePeriod>> {
        Ok(self
            .periods
            .read()
            .await
            .get(&(*subject, period_start))
            .cloned())
    }

    async fn create(&self, period: &UsagePeriod) -> StorageResult<()> {
        let mut periods = self.periods.write().await;
        let key = (period.subject, period.period_start);
        if periods.contains_key(&key) {
            return Err(StorageError::Conflict(format!(
                "period {} already exists for {}",
                period.period_start, period.subject
            )));
        }
        periods.insert(key, period.clone());
        Ok(())
    }

    async fn update_limits(
        &self,
        subject: &Subject,
        period_start: NaiveDate,
        limits: &UsageLimits,
    ) -> StorageResult<UsagePeriod> {
        let mut periods = self.periods.write().await;
        let period = periods
            .get_mut(&(*subject, period_start))
            .ok_or_else(|| StorageError::NotFound(format!("period {period_start} for {subject}")))?;
        period.usage_limits = *limits;
        period.updated_at = Utc::now();
        Ok(period.clone())
    }

    async fn add_usage(
        &self,
        subject: &Subject,
        period_start: NaiveDate,
        delta: &UsageTotals,
    ) -> StorageResult<UsagePeriod> {
        let mut periods = self.periods.write().await;
        let period = periods
            .get_mut(&(*subject, period_start))
            .ok_or_else(|| StorageError::NotFound(format!("period {period_start} for {subject}")))?;
        period.usage_totals = period.usage_totals.saturating_add(delta);
        period.updated_at = Utc::now();
        Ok(period.clone())
    }

    async fn find_history(
        &self,
        subject: &Subject,
        months: usize,
    ) -> StorageResult<Vec<UsagePeriod>> {
        let periods = self.periods.read().await;
        let mut history: Vec<UsagePeriod> = periods
            .values()
            .filter(|p| p.subject == *subject)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.period_start.cmp(&a.period_start));
        history.truncate(months);
        Ok(history)
    }
}

#[async_trait]
impl UsageAlertStore for InMemoryStorage {
    async fn create(&self, alert: &UsageAlert) -> StorageResult<()> {
        let mut alerts = self.alerts.write().await;
        let duplicate = alerts.iter().any(|a| {
            a.subject == alert.subject
                && a.usage_type == alert.usage_type
                && a.alert_type == alert.alert_type
                && a.period_start == alert.period_start
        });
        if duplicate {
            return Err(StorageError::Conflict(format!(
                "{} {} alert already raised for {} in period {}",
                alert.usage_type, alert.alert_type, alert.subject, alert.period_start
            )));
        }
        alerts.push(alert.clone());
        Ok(())
    }

    async fn find_unacknowledged(&self, subject: &Subject) -> StorageResult<Vec<UsageAlert>> {
        Ok(self
            .alerts
            .read()
            .await
            .iter()
            .filter(|a| a.subject == *subject && !a.acknowledged)
            .cloned()
            .collect())
    }

    async fn acknowledge(
        &self,
        alert_id: Uuid,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) -> StorageResult<UsageAlert> {
        let mut alerts = self.alerts.write().await;
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| StorageError::NotFound(format!("alert {alert_id}")))?;
        if !alert.acknowledged {
            alert.acknowledged = true;
            alert.acknowledged_at = Some(at);
            alert.acknowledged_by = Some(actor_id);
        }
        Ok(alert.clone())
    }
}
