use crate::{
    classify_plan, BillingPeriod, PeriodSummary, Result, StorageError, Subject, TierCatalog,
    UsageError, UsageEvent, UsageEventType, UsageLimits, UsagePercentages, UsagePeriod,
    UsagePeriodStore, UsageSummary, UsageTotals,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Maintains per-subject, per-month running totals and reads them back as
/// summaries.
pub struct UsageAggregator {
    periods: Arc<dyn UsagePeriodStore>,
    catalog: Arc<TierCatalog>,
}

impl UsageAggregator {
    pub fn new(periods: Arc<dyn UsagePeriodStore>, catalog: Arc<TierCatalog>) -> Self {
        Self { periods, catalog }
    }

    pub fn catalog(&self) -> &TierCatalog {
        &self.catalog
    }

    /// The stored snapshot, or the default limits if it was never set.
    pub fn effective_limits(&self, period: &UsagePeriod) -> UsageLimits {
        if period.usage_limits.is_unset() {
            self.catalog.default_limits()
        } else {
            period.usage_limits
        }
    }

    pub fn summarize(&self, period: &UsagePeriod) -> PeriodSummary {
        let limits = self.effective_limits(period);
        PeriodSummary {
            period_start: period.period_start,
            period_end: period.period_end,
            totals: period.usage_totals,
            limits,
            percentages: UsagePercentages::compute(&period.usage_totals, &limits),
        }
    }

    pub async fn current_summary(&self, subject: &Subject) -> Result<UsageSummary> {
        let bounds = BillingPeriod::current();
        let period = self
            .periods
            .find(subject, bounds.start)
            .await
            .map_err(UsageError::storage("find current usage period"))?;

        let summary = match period {
            Some(period) => self.summarize(&period),
            None => {
                let limits = self.catalog.default_limits();
                PeriodSummary {
                    period_start: bounds.start,
                    period_end: bounds.end,
                    totals: UsageTotals::default(),
                    limits,
                    percentages: UsagePercentages::default(),
                }
            }
        };

        Ok(UsageSummary {
            subject: *subject,
            plan: classify_plan(&summary.limits),
            limit_exceeded: exceeds_limits(&summary.totals, &summary.limits),
            period: summary,
        })
    }

    /// Sets the current period's limit snapshot from the catalog entry for
    /// `plan_id`, creating the period if needed.
    #[instrument(skip(self, subject), fields(%subject))]
    pub async fn update_limits(&self, subject: &Subject, plan_id: &str) -> Result<UsagePeriod> {
        let limits = self.catalog.limits_for_plan(plan_id);
        let bounds = BillingPeriod::current();

        let existing = self
            .periods
            .find(subject, bounds.start)
            .await
            .map_err(UsageError::storage("find current usage period"))?;

        let period = if existing.is_some() {
            self.replace_limits(subject, bounds, &limits).await?
        } else {
            let period = new_period(*subject, bounds, limits);
            match self.periods.create(&period).await {
                Ok(()) => period,
                // Created by a concurrent writer in the meantime.
                Err(StorageError::Conflict(_)) => {
                    self.replace_limits(subject, bounds, &limits).await?
                }
                Err(e) => return Err(UsageError::storage("create usage period")(e)),
            }
        };

        info!(
            tier = %self.catalog.tier_for_plan(plan_id),
            period = %bounds,
            "Usage limits updated"
        );
        Ok(period)
    }

    /// True if any metric with a positive limit has reached it.
    pub async fn check_limits(&self, subject: &Subject) -> Result<bool> {
        let summary = self.current_summary(subject).await?;
        Ok(summary.limit_exceeded)
    }

    pub async fn history(&self, subject: &Subject, months: usize) -> Result<Vec<PeriodSummary>> {
        if months == 0 {
            return Ok(Vec::new());
        }
        let periods = self
            .periods
            .find_history(subject, months)
            .await
            .map_err(UsageError::storage("find usage history"))?;
        Ok(periods.iter().map(|p| self.summarize(p)).collect())
    }

    /// Adds the event's quantity to the total it meters, in the event's own
    /// billing period, and returns the updated period.
    pub(crate) async fn apply_event(&self, event: &UsageEvent) -> Result<UsagePeriod> {
        let bounds = BillingPeriod::containing(event.billing_period_start);
        self.ensure_period(&event.subject, bounds).await?;

        let delta = UsageTotals::single(event.event_type, event.quantity);
        let period = self
            .periods
            .add_usage(&event.subject, bounds.start, &delta)
            .await
            .map_err(UsageError::storage("add usage to period"))?;

        debug!(
            subject = %event.subject,
            metric = %event.event_type,
            total = period.usage_totals.get(event.event_type),
            "Usage aggregated"
        );
        Ok(period)
    }

    async fn ensure_period(&self, subject: &Subject, bounds: BillingPeriod) -> Result<()> {
        let existing = self
            .periods
            .find(subject, bounds.start)
            .await
            .map_err(UsageError::storage("find usage period"))?;
        if existing.is_some() {
            return Ok(());
        }

        // Carry the latest known snapshot into the new month.
        let limits = self
            .periods
            .find_history(subject, 1)
            .await
            .map_err(UsageError::storage("find usage history"))?
            .into_iter()
            .map(|p| p.usage_limits)
            .find(|l| !l.is_unset())
            .unwrap_or_else(|| self.catalog.default_limits());

        match self.periods.create(&new_period(*subject, bounds, limits)).await {
            Ok(()) => {
                info!(%subject, period = %bounds, "Usage period opened");
                Ok(())
            }
            Err(StorageError::Conflict(_)) => Ok(()),
            Err(e) => Err(UsageError::storage("create usage period")(e)),
        }
    }

    async fn replace_limits(
        &self,
        subject: &Subject,
        bounds: BillingPeriod,
        limits: &UsageLimits,
    ) -> Result<UsagePeriod> {
        self.periods
            .update_limits(subject, bounds.start, limits)
            .await
            .map_err(UsageError::storage("update usage limits"))
    }
}

fn new_period(subject: Subject, bounds: BillingPeriod, limits: UsageLimits) -> UsagePeriod {
    let now = Utc::now();
    UsagePeriod {
        id: Uuid::new_v4(),
        subject,
        period_start: bounds.start,
        period_end: bounds.end,
        usage_totals: UsageTotals::default(),
        usage_limits: limits,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn exceeds_limits(totals: &UsageTotals, limits: &UsageLimits) -> bool {
    UsageEventType::ALL.iter().any(|metric| {
        let limit = limits.get(*metric);
        limit > 0 && totals.get(*metric) >= limit
    })
}
