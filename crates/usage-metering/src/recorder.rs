use crate::{
    BillingPeriod, NewUsageEvent, Result, UsageError, UsageEvent, UsageEventStore, DEFAULT_UNIT,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Validates, stamps and persists single usage events.
pub struct EventRecorder {
    events: Arc<dyn UsageEventStore>,
}

impl EventRecorder {
    pub fn new(events: Arc<dyn UsageEventStore>) -> Self {
        Self { events }
    }

    #[instrument(skip(self, event), fields(subject = %event.subject, event_type = %event.event_type))]
    pub async fn record_event(&self, event: NewUsageEvent) -> Result<UsageEvent> {
        if event.quantity < 0 {
            return Err(UsageError::Validation(format!(
                "quantity must not be negative, got {}",
                event.quantity
            )));
        }

        let created_at = Utc::now();
        let period = BillingPeriod::at(created_at);
        let event = UsageEvent {
            id: Uuid::new_v4(),
            subject: event.subject,
            event_type: event.event_type,
            resource: event.resource,
            quantity: if event.quantity == 0 { 1 } else { event.quantity },
            unit: if event.unit.is_empty() {
                DEFAULT_UNIT.to_string()
            } else {
                event.unit
            },
            metadata: event.metadata,
            billing_period_start: period.start,
            billing_period_end: period.end,
            created_at,
        };

        self.events
            .create(&event)
            .await
            .map_err(UsageError::storage("create usage event"))?;

        debug!(event_id = %event.id, quantity = event.quantity, unit = %event.unit, "Usage event recorded");
        Ok(event)
    }
}
