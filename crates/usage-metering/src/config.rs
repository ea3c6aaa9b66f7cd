use crate::alerts::DEFAULT_THRESHOLDS;
use crate::{PlanTier, Result, TierCatalog, UsageError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const MIN_QUEUE_CAPACITY: usize = 100;
pub const MAX_QUEUE_CAPACITY: usize = 10_000;
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 10;

/// What happens to a `record_*` call when the ingestion queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Drop the job, log it and report it to the failure observer.
    #[default]
    Drop,
    /// Wait up to `enqueue_timeout_ms` for space, then drop.
    Block,
    /// Return `UsageError::QueueFull` to the caller.
    Reject,
}

impl FromStr for OverflowPolicy {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "drop" => Ok(OverflowPolicy::Drop),
            "block" => Ok(OverflowPolicy::Block),
            "reject" => Ok(OverflowPolicy::Reject),
            other => Err(UsageError::Config(format!(
                "unknown overflow policy '{other}', expected drop, block or reject"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub overflow_policy: OverflowPolicy,
    pub enqueue_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub alert_thresholds: Vec<u8>,
    pub pro_plan_ids: Vec<String>,
    pub enterprise_plan_ids: Vec<String>,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            worker_count: 4,
            overflow_policy: OverflowPolicy::Drop,
            enqueue_timeout_ms: 250,
            shutdown_timeout_ms: 30_000,
            alert_thresholds: DEFAULT_THRESHOLDS.to_vec(),
            pro_plan_ids: Vec::new(),
            enterprise_plan_ids: Vec::new(),
        }
    }
}

impl MeterConfig {
    /// Reads `USAGE_METER_*` variables, loading a `.env` file first if one
    /// exists. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("USAGE_METER_QUEUE_CAPACITY") {
            config.queue_capacity = parse_number("USAGE_METER_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("USAGE_METER_WORKERS") {
            config.worker_count = parse_number("USAGE_METER_WORKERS", &v)?;
        }
        if let Some(v) = lookup("USAGE_METER_OVERFLOW_POLICY") {
            config.overflow_policy = v.parse()?;
        }
        if let Some(v) = lookup("USAGE_METER_ENQUEUE_TIMEOUT_MS") {
            config.enqueue_timeout_ms = parse_number("USAGE_METER_ENQUEUE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("USAGE_METER_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout_ms = parse_number("USAGE_METER_SHUTDOWN_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("USAGE_METER_ALERT_THRESHOLDS") {
            config.alert_thresholds = split_list(&v)
                .map(|t| parse_number("USAGE_METER_ALERT_THRESHOLDS", &t))
                .collect::<Result<_>>()?;
        }
        if let Some(v) = lookup("USAGE_METER_PRO_PLAN_IDS") {
            config.pro_plan_ids = split_list(&v).collect();
        }
        if let Some(v) = lookup("USAGE_METER_ENTERPRISE_PLAN_IDS") {
            config.enterprise_plan_ids = split_list(&v).collect();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_QUEUE_CAPACITY..=MAX_QUEUE_CAPACITY).contains(&self.queue_capacity) {
            return Err(UsageError::Config(format!(
                "queue_capacity must be between {MIN_QUEUE_CAPACITY} and {MAX_QUEUE_CAPACITY}, got {}",
                self.queue_capacity
            )));
        }
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.worker_count) {
            return Err(UsageError::Config(format!(
                "worker_count must be between {MIN_WORKERS} and {MAX_WORKERS}, got {}",
                self.worker_count
            )));
        }
        if self.overflow_policy == OverflowPolicy::Block && self.enqueue_timeout_ms == 0 {
            return Err(UsageError::Config(
                "enqueue_timeout_ms must be positive with the block overflow policy".to_string(),
            ));
        }
        if let Some(bad) = self.alert_thresholds.iter().find(|t| !(1..=100).contains(*t)) {
            return Err(UsageError::Config(format!(
                "alert thresholds must be between 1 and 100, got {bad}"
            )));
        }
        Ok(())
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// The built-in catalog extended with the configured plan identifiers.
    pub fn tier_catalog(&self) -> TierCatalog {
        let pro = self.pro_plan_ids.iter().map(|id| (id, PlanTier::Pro));
        let enterprise = self
            .enterprise_plan_ids
            .iter()
            .map(|id| (id, PlanTier::Enterprise));
        pro.chain(enterprise)
            .fold(TierCatalog::default(), |catalog, (id, tier)| {
                catalog.with_plan(id.clone(), tier)
            })
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| UsageError::Config(format!("{key}: invalid number '{value}'")))
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
