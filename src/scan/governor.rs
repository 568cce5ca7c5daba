//! API Budget Governor
//!
//! Admission control for expensive telemetry API calls (CloudWatch
//! `GetMetricData`, Azure Monitor metrics, Cloud Monitoring time series).
//!
//! The governor keeps a per-day ledger of calls and estimated cost for each
//! (tenant, api) pair. A single lock serializes check-and-increment so
//! concurrent plugins can never jointly overshoot a budget. The ledger
//! resets when the UTC day changes.
//!
//! ## Modes
//!
//! - **Disabled**: every call admitted, calls/cost still counted in metrics
//! - **Observe only**: over-budget calls admitted and reported as `would_deny`
//! - **Enforcing**: over-budget calls denied without touching the ledger

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::config::GovernorConfig;
use super::context::{current_scan_context, ScanContext};
use super::metrics::{Decision, MetricsRecorder};

/// Tenant label used when no scan context is available
pub const UNKNOWN_TENANT: &str = "unknown";

/// Provider label used when no scan context is available
pub const UNKNOWN_PROVIDER: &str = "unknown";

/// Source of the current UTC day
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Wall clock in UTC
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

/// Ledger key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BudgetKey {
    pub day: NaiveDate,
    pub tenant_id: String,
    pub api: String,
}

/// Usage recorded against one key
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LedgerEntry {
    pub calls_used: u64,
    pub cost_used: f64,
}

#[derive(Debug)]
struct Ledger {
    day: NaiveDate,
    entries: HashMap<BudgetKey, LedgerEntry>,
}

impl Ledger {
    fn new(day: NaiveDate) -> Self {
        Self {
            day,
            entries: HashMap::new(),
        }
    }

    /// Start a fresh ledger when the day advances. Returns true on rollover.
    fn roll_to(&mut self, today: NaiveDate) -> bool {
        if today <= self.day {
            return false;
        }
        let previous = std::mem::replace(&mut self.day, today);
        let dropped = self.entries.len();
        self.entries.clear();
        info!(
            previous_day = %previous,
            day = %today,
            keys_dropped = dropped,
            "Budget ledger rolled over"
        );
        true
    }
}

/// A request to spend budget
#[derive(Debug, Clone)]
pub struct ConsumeRequest<'a> {
    api: &'a str,
    units: i64,
    operation: Option<&'a str>,
    estimated_cost_usd: Option<f64>,
    context: Option<&'a ScanContext>,
}

impl<'a> ConsumeRequest<'a> {
    /// One unit against `api`
    pub fn new(api: &'a str) -> Self {
        Self {
            api,
            units: 1,
            operation: None,
            estimated_cost_usd: None,
            context: None,
        }
    }

    pub fn units(mut self, units: i64) -> Self {
        self.units = units;
        self
    }

    /// Operation name, for logs
    pub fn operation(mut self, operation: &'a str) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Explicit cost estimate; overrides the configured per-call rate
    pub fn estimated_cost(mut self, usd: f64) -> Self {
        self.estimated_cost_usd = Some(usd);
        self
    }

    /// Explicit context; overrides the ambient scan context
    pub fn context(mut self, context: &'a ScanContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Outcome of a [`BudgetGovernor::consume_detailed`] call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub decision: Decision,
    /// Calls recorded for the key after this request
    pub calls_used: u64,
    /// Calls left today; `None` when unlimited or not tracked
    pub remaining: Option<u64>,
}

impl Admission {
    fn unmetered() -> Self {
        Self {
            decision: Decision::Allow,
            calls_used: 0,
            remaining: None,
        }
    }

    pub fn is_admitted(&self) -> bool {
        self.decision != Decision::Deny
    }
}

/// Process-wide budget governor
pub struct BudgetGovernor {
    config: GovernorConfig,
    ledger: Mutex<Ledger>,
    metrics: Arc<dyn MetricsRecorder>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BudgetGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never block here: the ledger may be held by the caller.
        let mut debug = f.debug_struct("BudgetGovernor");
        debug.field("config", &self.config);
        match self.ledger.try_lock() {
            Some(ledger) => debug.field("ledger", &*ledger),
            None => debug.field("ledger", &"<locked>"),
        };
        debug.finish_non_exhaustive()
    }
}

impl BudgetGovernor {
    /// Create a governor using the system UTC clock
    pub fn new(config: GovernorConfig, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self::with_clock(config, metrics, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: GovernorConfig,
        metrics: Arc<dyn MetricsRecorder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let today = clock.today();
        info!(
            enabled = config.enabled,
            enforce = config.enforce,
            budgets = config.daily_budgets.len(),
            "BudgetGovernor initialized"
        );

        Self {
            config,
            ledger: Mutex::new(Ledger::new(today)),
            metrics,
            clock,
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Spend one unit against `api` for the ambient tenant
    pub fn consume(&self, api: &str) -> bool {
        self.consume_with(ConsumeRequest::new(api))
    }

    /// Spend budget; `false` means the caller must proceed without the call
    pub fn consume_with(&self, request: ConsumeRequest<'_>) -> bool {
        self.consume_detailed(request).is_admitted()
    }

    pub fn consume_detailed(&self, request: ConsumeRequest<'_>) -> Admission {
        let ConsumeRequest {
            api,
            units,
            operation,
            estimated_cost_usd,
            context,
        } = request;

        if units <= 0 {
            return Admission::unmetered();
        }
        let units = units as u64;

        let ambient;
        let context = match context {
            Some(ctx) => Some(ctx),
            None => {
                ambient = current_scan_context();
                ambient.as_ref()
            }
        };
        let tenant = context.map_or(UNKNOWN_TENANT, |c| c.tenant_id.as_str());
        let provider = context.map_or(UNKNOWN_PROVIDER, |c| c.provider.as_str());
        let operation = operation.unwrap_or("-");

        let cost = estimated_cost_usd
            .or_else(|| self.config.cost_per_call(api).map(|rate| rate * units as f64))
            .unwrap_or(0.0);

        if !self.config.enabled {
            self.metrics.record_calls(provider, api, units, cost);
            return Admission::unmetered();
        }

        let budget = self.config.budget_for(api);

        let (decision, calls_used) = {
            let mut ledger = self.ledger.lock();
            ledger.roll_to(self.clock.today());

            let key = BudgetKey {
                day: ledger.day,
                tenant_id: tenant.to_string(),
                api: api.to_string(),
            };
            let current = ledger.entries.get(&key).map_or(0, |e| e.calls_used);
            let projected = current.saturating_add(units);
            let over_budget = budget > 0 && projected > budget;

            if over_budget && self.config.enforce {
                (Decision::Deny, current)
            } else {
                let entry = ledger.entries.entry(key).or_default();
                entry.calls_used = projected;
                entry.cost_used += cost;
                let decision = if over_budget {
                    Decision::WouldDeny
                } else {
                    Decision::Allow
                };
                (decision, projected)
            }
        };

        let remaining = (budget > 0).then(|| budget.saturating_sub(calls_used));
        if let Some(remaining) = remaining {
            self.metrics.set_budget_remaining(provider, api, remaining);
        }
        self.metrics.record_decision(provider, api, decision);

        match decision {
            Decision::Deny => {
                warn!(
                    tenant = %tenant,
                    provider = %provider,
                    api = %api,
                    operation = %operation,
                    units,
                    calls_used,
                    budget,
                    "API budget exhausted, call denied"
                );
            }
            Decision::WouldDeny => {
                self.metrics.record_calls(provider, api, units, cost);
                warn!(
                    tenant = %tenant,
                    provider = %provider,
                    api = %api,
                    operation = %operation,
                    calls_used,
                    budget,
                    "API budget exceeded (observe only), call admitted"
                );
            }
            Decision::Allow => {
                self.metrics.record_calls(provider, api, units, cost);
                debug!(
                    tenant = %tenant,
                    api = %api,
                    operation = %operation,
                    calls_used,
                    "API call admitted"
                );
            }
        }

        Admission {
            decision,
            calls_used,
            remaining,
        }
    }

    /// Today's usage for a key (zero if untouched or from a previous day)
    pub fn usage(&self, tenant_id: &str, api: &str) -> LedgerEntry {
        let today = self.clock.today();
        let ledger = self.ledger.lock();
        if ledger.day < today {
            return LedgerEntry::default();
        }

        let key = BudgetKey {
            day: ledger.day,
            tenant_id: tenant_id.to_string(),
            api: api.to_string(),
        };
        ledger.entries.get(&key).copied().unwrap_or_default()
    }

    /// Calls left today; `None` when `api` is unlimited
    pub fn remaining(&self, tenant_id: &str, api: &str) -> Option<u64> {
        let budget = self.config.budget_for(api);
        (budget > 0).then(|| budget.saturating_sub(self.usage(tenant_id, api).calls_used))
    }
}
