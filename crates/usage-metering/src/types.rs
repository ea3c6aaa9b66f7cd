use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::{PlanTier, Result, UsageError};

/// The billable entity an event, period or alert belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Subject {
    User(Uuid),
    Organization(Uuid),
}

impl Subject {
    /// Builds a subject from the optional id pair accepted by the public API.
    /// Exactly one of the two must be set.
    pub fn from_parts(user_id: Option<Uuid>, organization_id: Option<Uuid>) -> Result<Self> {
        match (user_id, organization_id) {
            (Some(user), None) => Ok(Subject::User(user)),
            (None, Some(org)) => Ok(Subject::Organization(org)),
            (None, None) => Err(UsageError::Validation(
                "either user_id or organization_id must be provided".to_string(),
            )),
            (Some(_), Some(_)) => Err(UsageError::Validation(
                "user_id and organization_id are mutually exclusive".to_string(),
            )),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::User(id) => write!(f, "user:{id}"),
            Subject::Organization(id) => write!(f, "organization:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageEventType {
    ApiCall,
    Storage,
    Compute,
    FileUpload,
}

impl UsageEventType {
    pub const ALL: [UsageEventType; 4] = [
        UsageEventType::ApiCall,
        UsageEventType::Storage,
        UsageEventType::Compute,
        UsageEventType::FileUpload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UsageEventType::ApiCall => "api_call",
            UsageEventType::Storage => "storage",
            UsageEventType::Compute => "compute",
            UsageEventType::FileUpload => "file_upload",
        }
    }
}

impl fmt::Display for UsageEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_UNIT: &str = "count";

/// A usage event as handed in by a caller, before the recorder applies
/// defaults and stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUsageEvent {
    pub subject: Subject,
    pub event_type: UsageEventType,
    pub resource: String,
    /// 0 means "not set" and is recorded as 1.
    pub quantity: i64,
    /// Empty means "not set" and is recorded as `"count"`.
    pub unit: String,
    pub metadata: HashMap<String, String>,
}

impl NewUsageEvent {
    pub fn new(subject: Subject, event_type: UsageEventType, resource: impl Into<String>) -> Self {
        Self {
            subject,
            event_type,
            resource: resource.into(),
            quantity: 0,
            unit: String::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_quantity(mut self, quantity: i64) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A persisted usage fact. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: Uuid,
    pub subject: Subject,
    pub event_type: UsageEventType,
    pub resource: String,
    pub quantity: i64,
    pub unit: String,
    pub metadata: HashMap<String, String>,
    pub billing_period_start: NaiveDate,
    pub billing_period_end: NaiveDate,
    pub created_at: DateTime<Utc>,
}

// Limits and totals
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLimits {
    pub api_calls: i64,
    pub storage_bytes: i64,
    pub compute_ms: i64,
    pub file_uploads: i64,
}

impl UsageLimits {
    /// An all-zero snapshot is treated as "never set".
    pub fn is_unset(&self) -> bool {
        *self == UsageLimits::default()
    }

    pub fn get(&self, metric: UsageEventType) -> i64 {
        match metric {
            UsageEventType::ApiCall => self.api_calls,
            UsageEventType::Storage => self.storage_bytes,
            UsageEventType::Compute => self.compute_ms,
            UsageEventType::FileUpload => self.file_uploads,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub api_calls: i64,
    pub storage_bytes: i64,
    pub compute_ms: i64,
    pub file_uploads: i64,
}

impl UsageTotals {
    pub fn get(&self, metric: UsageEventType) -> i64 {
        match metric {
            UsageEventType::ApiCall => self.api_calls,
            UsageEventType::Storage => self.storage_bytes,
            UsageEventType::Compute => self.compute_ms,
            UsageEventType::FileUpload => self.file_uploads,
        }
    }

    /// Totals holding `quantity` in the field metered by `metric`.
    pub fn single(metric: UsageEventType, quantity: i64) -> Self {
        let mut totals = UsageTotals::default();
        match metric {
            UsageEventType::ApiCall => totals.api_calls = quantity,
            UsageEventType::Storage => totals.storage_bytes = quantity,
            UsageEventType::Compute => totals.compute_ms = quantity,
            UsageEventType::FileUpload => totals.file_uploads = quantity,
        }
        totals
    }

    pub fn saturating_add(&self, delta: &UsageTotals) -> Self {
        Self {
            api_calls: self.api_calls.saturating_add(delta.api_calls),
            storage_bytes: self.storage_bytes.saturating_add(delta.storage_bytes),
            compute_ms: self.compute_ms.saturating_add(delta.compute_ms),
            file_uploads: self.file_uploads.saturating_add(delta.file_uploads),
        }
    }
}

/// Integer percentage of `limit` consumed by `used`, floored.
/// A non-positive limit yields 0.
pub fn percentage_used(used: i64, limit: i64) -> i64 {
    if limit <= 0 || used <= 0 {
        return 0;
    }
    ((used as i128 * 100) / limit as i128).min(i64::MAX as i128) as i64
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePercentages {
    pub api_calls: i64,
    pub storage_bytes: i64,
    pub compute_ms: i64,
    pub file_uploads: i64,
}

impl UsagePercentages {
    pub fn compute(totals: &UsageTotals, limits: &UsageLimits) -> Self {
        Self {
            api_calls: percentage_used(totals.api_calls, limits.api_calls),
            storage_bytes: percentage_used(totals.storage_bytes, limits.storage_bytes),
            compute_ms: percentage_used(totals.compute_ms, limits.compute_ms),
            file_uploads: percentage_used(totals.file_uploads, limits.file_uploads),
        }
    }
}

/// Per-subject aggregate for one calendar month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePeriod {
    pub id: Uuid,
    pub subject: Subject,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub usage_totals: UsageTotals,
    /// Snapshot taken at creation or on limit update.
    pub usage_limits: UsageLimits,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum AlertType {
    /// `warning_<percent>`, for thresholds below 100.
    Warning(u8),
    Exceeded,
}

impl AlertType {
    pub fn for_threshold(threshold: u8) -> Self {
        if threshold >= 100 {
            AlertType::Exceeded
        } else {
            AlertType::Warning(threshold)
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertType::Warning(pct) => write!(f, "warning_{pct}"),
            AlertType::Exceeded => f.write_str("exceeded"),
        }
    }
}

impl From<AlertType> for String {
    fn from(value: AlertType) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for AlertType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        if value == "exceeded" {
            return Ok(AlertType::Exceeded);
        }
        value
            .strip_prefix("warning_")
            .and_then(|pct| pct.parse::<u8>().ok())
            .filter(|pct| (1..100).contains(pct))
            .map(AlertType::Warning)
            .ok_or_else(|| format!("unknown alert type: {value}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAlert {
    pub id: Uuid,
    pub subject: Subject,
    pub alert_type: AlertType,
    pub usage_type: UsageEventType,
    pub current_usage: i64,
    pub usage_limit: i64,
    pub percentage_used: f64,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// Read models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub totals: UsageTotals,
    pub limits: UsageLimits,
    pub percentages: UsagePercentages,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub subject: Subject,
    pub plan: PlanTier,
    pub limit_exceeded: bool,
    #[serde(flatten)]
    pub period: PeriodSummary,
}
