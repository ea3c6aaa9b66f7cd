use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::UsageLimits;

const GIB: i64 = 1024 * 1024 * 1024;
const HOUR_MS: i64 = 60 * 60 * 1000;

const PRO_API_CALL_FLOOR: i64 = 100_000;
const ENTERPRISE_API_CALL_FLOOR: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,       // Default for unknown or missing plans
    Pro,        // price_pro_monthly / price_pro_yearly
    Enterprise, // price_enterprise_monthly / price_enterprise_yearly
}

impl PlanTier {
    pub fn limits(&self) -> UsageLimits {
        match self {
            PlanTier::Free => UsageLimits {
                api_calls: 10_000,
                storage_bytes: GIB,
                compute_ms: HOUR_MS,
                file_uploads: 100,
            },
            PlanTier::Pro => UsageLimits {
                api_calls: 100_000,
                storage_bytes: 100 * GIB,
                compute_ms: 100 * HOUR_MS,
                file_uploads: 10_000,
            },
            PlanTier::Enterprise => UsageLimits {
                api_calls: 1_000_000,
                storage_bytes: 1024 * GIB,
                compute_ms: 1000 * HOUR_MS,
                file_uploads: 100_000,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a limit set by its API-call allowance.
pub fn classify_plan(limits: &UsageLimits) -> PlanTier {
    match limits.api_calls {
        x if x >= ENTERPRISE_API_CALL_FLOOR => PlanTier::Enterprise,
        x if x >= PRO_API_CALL_FLOOR => PlanTier::Pro,
        _ => PlanTier::Free,
    }
}

/// Display name of the next tier up, or `None` when there is nothing to
/// upgrade to. Matching is exact and case-sensitive.
pub fn upgrade_suggestion(current_plan: &str) -> Option<&'static str> {
    match current_plan {
        "free" => Some("Pro"),
        "pro" => Some("Enterprise"),
        _ => None,
    }
}

/// Maps plan/price identifiers to tiers. Unknown identifiers fall back to
/// the free tier.
#[derive(Debug, Clone)]
pub struct TierCatalog {
    plans: HashMap<String, PlanTier>,
}

impl Default for TierCatalog {
    fn default() -> Self {
        let plans = [
            ("free", PlanTier::Free),
            ("price_pro_monthly", PlanTier::Pro),
            ("price_pro_yearly", PlanTier::Pro),
            ("price_enterprise_monthly", PlanTier::Enterprise),
            ("price_enterprise_yearly", PlanTier::Enterprise),
        ]
        .into_iter()
        .map(|(id, tier)| (id.to_string(), tier))
        .collect();
        Self { plans }
    }
}

impl TierCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an additional identifier for `tier`, e.g. a billing
    /// provider price id.
    pub fn with_plan(mut self, plan_id: impl Into<String>, tier: PlanTier) -> Self {
        self.plans.insert(plan_id.into(), tier);
        self
    }

    pub fn default_limits(&self) -> UsageLimits {
        PlanTier::Free.limits()
    }

    pub fn tier_for_plan(&self, plan_id: &str) -> PlanTier {
        self.plans.get(plan_id).copied().unwrap_or(PlanTier::Free)
    }

    pub fn limits_for_plan(&self, plan_id: &str) -> UsageLimits {
        self.tier_for_plan(plan_id).limits()
    }
}
