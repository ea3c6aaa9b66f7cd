use crate::ingest::{IngestStatsSnapshot, JobHandler};
use crate::{
    AlertEngine, AlertNotifier, EventRecorder, IngestPool, JobFailureObserver, MeterConfig,
    NewUsageEvent, PeriodSummary, Result, ShutdownReport, Subject, TierCatalog, UsageAggregator,
    UsageAlert, UsageAlertStore, UsageError, UsageEvent, UsageEventStore, UsageEventType,
    UsagePeriod, UsagePeriodStore, UsageSummary,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// The synchronous recording path shared by `record_event` and the workers.
struct MeteringCore {
    recorder: EventRecorder,
    aggregator: UsageAggregator,
    alerts: AlertEngine,
    observer: Option<Arc<dyn JobFailureObserver>>,
}

impl MeteringCore {
    async fn record(&self, event: NewUsageEvent) -> Result<UsageEvent> {
        let event = self.recorder.record_event(event).await?;
        let period = self.aggregator.apply_event(&event).await?;
        // The event and its totals are committed from here on.
        self.raise_alerts(&period, &[event.event_type]).await;
        Ok(event)
    }

    async fn update_limits(&self, subject: Subject, plan_id: &str) -> Result<UsagePeriod> {
        let period = self.aggregator.update_limits(&subject, plan_id).await?;
        // A downgrade can put the subject past a threshold without new usage.
        self.raise_alerts(&period, &UsageEventType::ALL).await;
        Ok(period)
    }

    async fn raise_alerts(&self, period: &UsagePeriod, metrics: &[UsageEventType]) {
        let limits = self.aggregator.effective_limits(period);
        if let Err(e) = self.alerts.evaluate(period, &limits, metrics).await {
            error!(subject = %period.subject, error = %e, "Failed to raise usage alerts");
            if let Some(observer) = &self.observer {
                observer.alerts_failed(&period.subject, &e);
            }
        }
    }
}

#[async_trait]
impl JobHandler for MeteringCore {
    async fn handle(&self, event: &NewUsageEvent) -> Result<()> {
        self.record(event.clone()).await.map(|_| ())
    }
}

pub struct UsageTrackerBuilder {
    config: MeterConfig,
    events: Option<Arc<dyn UsageEventStore>>,
    periods: Option<Arc<dyn UsagePeriodStore>>,
    alerts: Option<Arc<dyn UsageAlertStore>>,
    catalog: Option<TierCatalog>,
    notifier: Option<Arc<dyn AlertNotifier>>,
    observer: Option<Arc<dyn JobFailureObserver>>,
}

impl UsageTrackerBuilder {
    /// Uses one backend for events, periods and alerts.
    pub fn storage<S>(self, storage: Arc<S>) -> Self
    where
        S: UsageEventStore + UsagePeriodStore + UsageAlertStore + 'static,
    {
        self.event_store(storage.clone())
            .period_store(storage.clone())
            .alert_store(storage)
    }

    pub fn event_store(mut self, store: Arc<dyn UsageEventStore>) -> Self {
        self.events = Some(store);
        self
    }

    pub fn period_store(mut self, store: Arc<dyn UsagePeriodStore>) -> Self {
        self.periods = Some(store);
        self
    }

    pub fn alert_store(mut self, store: Arc<dyn UsageAlertStore>) -> Self {
        self.alerts = Some(store);
        self
    }

    /// Replaces the catalog derived from the configuration.
    pub fn catalog(mut self, catalog: TierCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn failure_observer(mut self, observer: Arc<dyn JobFailureObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<UsageTracker> {
        self.config.validate()?;
        let missing = |store: &str| UsageError::Config(format!("no {store} store configured"));
        let events = self.events.ok_or_else(|| missing("event"))?;
        let periods = self.periods.ok_or_else(|| missing("period"))?;
        let alert_store = self.alerts.ok_or_else(|| missing("alert"))?;

        let catalog = Arc::new(self.catalog.unwrap_or_else(|| self.config.tier_catalog()));
        let mut alerts = AlertEngine::new(alert_store, self.config.alert_thresholds.clone());
        if let Some(notifier) = self.notifier {
            alerts = alerts.with_notifier(notifier);
        }

        let core = Arc::new(MeteringCore {
            recorder: EventRecorder::new(events),
            aggregator: UsageAggregator::new(periods, catalog),
            alerts,
            observer: self.observer.clone(),
        });

        let mut pool = IngestPool::new(&self.config, core.clone());
        if let Some(observer) = self.observer {
            pool = pool.with_failure_observer(observer);
        }

        Ok(UsageTracker { core, pool })
    }
}

/// Entry point of the metering pipeline. Owns the ingestion pool; call
/// [`UsageTracker::start`] once a Tokio runtime is running and
/// [`UsageTracker::shutdown`] before dropping it.
pub struct UsageTracker {
    core: Arc<MeteringCore>,
    pool: IngestPool,
}

impl UsageTracker {
    pub fn builder(config: MeterConfig) -> UsageTrackerBuilder {
        UsageTrackerBuilder {
            config,
            events: None,
            periods: None,
            alerts: None,
            catalog: None,
            notifier: None,
            observer: None,
        }
    }

    pub fn start(&self) -> Result<()> {
        self.pool.start()
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        self.pool.shutdown().await
    }

    pub fn catalog(&self) -> &TierCatalog {
        self.core.aggregator.catalog()
    }

    pub fn stats(&self) -> IngestStatsSnapshot {
        self.pool.stats()
    }

    pub fn pending_jobs(&self) -> usize {
        self.pool.pending_jobs()
    }

    /// Records and aggregates an event before returning. Use this when the
    /// caller needs the write to be durable; the `record_*` helpers are
    /// best-effort.
    pub async fn record_event(&self, event: NewUsageEvent) -> Result<UsageEvent> {
        self.core.record(event).await
    }

    pub async fn record_api_call(
        &self,
        user_id: Option<Uuid>,
        organization_id: Option<Uuid>,
        endpoint: &str,
        ip: &str,
        user_agent: &str,
    ) -> Result<()> {
        let subject = Subject::from_parts(user_id, organization_id)?;
        let mut event = NewUsageEvent::new(subject, UsageEventType::ApiCall, endpoint)
            .with_quantity(1)
            .with_unit("count");
        if !ip.is_empty() {
            event = event.with_metadata("ip", ip);
        }
        if !user_agent.is_empty() {
            event = event.with_metadata("user_agent", user_agent);
        }
        self.pool.submit(event).await
    }

    pub async fn record_storage_usage(
        &self,
        user_id: Option<Uuid>,
        organization_id: Option<Uuid>,
        bytes: i64,
        resource_name: &str,
    ) -> Result<()> {
        let subject = Subject::from_parts(user_id, organization_id)?;
        self.pool.submit(storage_event(subject, bytes, resource_name)?).await
    }

    /// Queues a `file_upload` event followed by a `storage` event for the
    /// uploaded bytes. Both are queued or neither is.
    pub async fn record_file_upload(
        &self,
        user_id: Option<Uuid>,
        organization_id: Option<Uuid>,
        filename: &str,
        bytes: i64,
    ) -> Result<()> {
        let subject = Subject::from_parts(user_id, organization_id)?;
        let storage = storage_event(subject, bytes, filename)?;
        let upload = NewUsageEvent::new(subject, UsageEventType::FileUpload, filename)
            .with_quantity(1)
            .with_unit("count");

        debug!(%subject, filename, bytes, "Queueing file upload");
        self.pool.submit_all(vec![upload, storage]).await
    }

    pub async fn record_compute_time(
        &self,
        user_id: Option<Uuid>,
        organization_id: Option<Uuid>,
        duration_ms: i64,
        resource: &str,
    ) -> Result<()> {
        let subject = Subject::from_parts(user_id, organization_id)?;
        if duration_ms < 0 {
            return Err(UsageError::Validation(format!(
                "compute duration must not be negative, got {duration_ms}"
            )));
        }
        let event = NewUsageEvent::new(subject, UsageEventType::Compute, resource)
            .with_quantity(duration_ms)
            .with_unit("ms");
        self.pool.submit(event).await
    }

    pub async fn get_current_usage_summary(
        &self,
        user_id: Option<Uuid>,
        organization_id: Option<Uuid>,
    ) -> Result<UsageSummary> {
        let subject = Subject::from_parts(user_id, organization_id)?;
        self.core.aggregator.current_summary(&subject).await
    }

    pub async fn update_user_limits(&self, user_id: Uuid, plan_id: &str) -> Result<UsagePeriod> {
        self.core.update_limits(Subject::User(user_id), plan_id).await
    }

    pub async fn update_organization_limits(
        &self,
        organization_id: Uuid,
        plan_id: &str,
    ) -> Result<UsagePeriod> {
        self.core
            .update_limits(Subject::Organization(organization_id), plan_id)
            .await
    }

    pub async fn check_limits(
        &self,
        user_id: Option<Uuid>,
        organization_id: Option<Uuid>,
    ) -> Result<bool> {
        let subject = Subject::from_parts(user_id, organization_id)?;
        self.core.aggregator.check_limits(&subject).await
    }

    pub async fn get_usage_history(
        &self,
        user_id: Option<Uuid>,
        organization_id: Option<Uuid>,
        months: usize,
    ) -> Result<Vec<PeriodSummary>> {
        let subject = Subject::from_parts(user_id, organization_id)?;
        self.core.aggregator.history(&subject, months).await
    }

    pub async fn get_unacknowledged_alerts(
        &self,
        user_id: Option<Uuid>,
        organization_id: Option<Uuid>,
    ) -> Result<Vec<UsageAlert>> {
        let subject = Subject::from_parts(user_id, organization_id)?;
        self.core.alerts.unacknowledged(&subject).await
    }

    pub async fn acknowledge_alert(&self, alert_id: Uuid, acting_user_id: Uuid) -> Result<UsageAlert> {
        self.core.alerts.acknowledge(alert_id, acting_user_id).await
    }

}

fn storage_event(subject: Subject, bytes: i64, resource: &str) -> Result<NewUsageEvent> {
    if bytes < 0 {
        return Err(UsageError::Validation(format!(
            "storage bytes must not be negative, got {bytes}"
        )));
    }
    Ok(NewUsageEvent::new(subject, UsageEventType::Storage, resource)
        .with_quantity(bytes)
        .with_unit("bytes"))
}
