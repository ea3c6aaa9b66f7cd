// Usage metering - per-tenant event ingestion, billing-period aggregation,
// tier limits and threshold alerts
use thiserror::Error;
use uuid::Uuid;

mod aggregator;
mod alerts;
mod config;
mod ingest;
mod period;
mod recorder;
mod storage;
mod tiers;
mod tracker;
mod types;

pub use aggregator::UsageAggregator;
pub use alerts::{AlertEngine, AlertNotifier, DEFAULT_THRESHOLDS};
pub use config::{MeterConfig, OverflowPolicy};
pub use ingest::{
    IngestJob, IngestPool, IngestStats, IngestStatsSnapshot, JobFailureObserver, JobHandler,
    ShutdownReport,
};
pub use period::BillingPeriod;
pub use recorder::EventRecorder;
pub use storage::{
    InMemoryStorage, StorageError, StorageResult, UsageAlertStore, UsageEventStore,
    UsagePeriodStore,
};
pub use tiers::{classify_plan, upgrade_suggestion, PlanTier, TierCatalog};
pub use tracker::{UsageTracker, UsageTrackerBuilder};
pub use types::*;

// Error Types
#[derive(Error, Debug)]
pub enum UsageError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Storage error during {operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: StorageError,
    },
    #[error("Alert not found: {0}")]
    AlertNotFound(Uuid),
    #[error("Ingestion queue is full")]
    QueueFull,
    #[error("Ingestion pool is shut down")]
    ShuttingDown,
    #[error("Configuration error: {0}")]
    Config(String),
}

impl UsageError {
    pub(crate) fn storage(operation: &'static str) -> impl FnOnce(StorageError) -> Self {
        move |source| UsageError::Storage { operation, source }
    }
}

pub type Result<T> = std::result::Result<T, UsageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_keeps_operation_and_source() {
        let err = UsageError::storage("create event")(StorageError::Backend("disk full".into()));
        assert_eq!(
            err.to_string(),
            "Storage error during create event: Backend error: disk full"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
