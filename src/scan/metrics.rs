//! Scan Metrics
//!
//! Counters and gauges emitted by the budget governor, labeled by provider
//! and api. [`InMemoryMetrics`] keeps them in process and renders the
//! Prometheus text exposition format for a `/metrics` endpoint.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Admission decision label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Decision {
    Allow,
    Deny,
    WouldDeny,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::WouldDeny => "would_deny",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for governor metrics
pub trait MetricsRecorder: Send + Sync {
    /// Admitted calls and their estimated cost
    fn record_calls(&self, provider: &str, api: &str, units: u64, cost_usd: f64);

    /// Remaining daily budget after a decision
    fn set_budget_remaining(&self, provider: &str, api: &str, remaining: u64);

    fn record_decision(&self, provider: &str, api: &str, decision: Decision);
}

type Labels = (String, String);

#[derive(Debug, Default)]
struct MetricsState {
    calls: BTreeMap<Labels, u64>,
    cost: BTreeMap<Labels, f64>,
    remaining: BTreeMap<Labels, u64>,
    decisions: BTreeMap<(String, String, Decision), u64>,
}

/// In-process metrics store
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    state: Mutex<MetricsState>,
}

fn labels(provider: &str, api: &str) -> Labels {
    (provider.to_string(), api.to_string())
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls_total(&self, provider: &str, api: &str) -> u64 {
        self.state
            .lock()
            .calls
            .get(&labels(provider, api))
            .copied()
            .unwrap_or(0)
    }

    pub fn cost_total(&self, provider: &str, api: &str) -> f64 {
        self.state
            .lock()
            .cost
            .get(&labels(provider, api))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn budget_remaining(&self, provider: &str, api: &str) -> Option<u64> {
        self.state
            .lock()
            .remaining
            .get(&labels(provider, api))
            .copied()
    }

    pub fn decisions(&self, provider: &str, api: &str, decision: Decision) -> u64 {
        self.state
            .lock()
            .decisions
            .get(&(provider.to_string(), api.to_string(), decision))
            .copied()
            .unwrap_or(0)
    }

    /// Prometheus text exposition
    pub fn render_prometheus(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();

        let _ = writeln!(out, "# HELP zombie_scan_api_calls_total Admitted telemetry API calls");
        let _ = writeln!(out, "# TYPE zombie_scan_api_calls_total counter");
        for ((provider, api), value) in &state.calls {
            let _ = writeln!(
                out,
                "zombie_scan_api_calls_total{{provider=\"{provider}\",api=\"{api}\"}} {value}"
            );
        }

        let _ = writeln!(
            out,
            "# HELP zombie_scan_api_estimated_cost_usd_total Estimated spend on telemetry API calls"
        );
        let _ = writeln!(out, "# TYPE zombie_scan_api_estimated_cost_usd_total counter");
        for ((provider, api), value) in &state.cost {
            let _ = writeln!(
                out,
                "zombie_scan_api_estimated_cost_usd_total{{provider=\"{provider}\",api=\"{api}\"}} {value}"
            );
        }

        let _ = writeln!(out, "# HELP zombie_scan_api_budget_remaining Calls left in today's budget");
        let _ = writeln!(out, "# TYPE zombie_scan_api_budget_remaining gauge");
        for ((provider, api), value) in &state.remaining {
            let _ = writeln!(
                out,
                "zombie_scan_api_budget_remaining{{provider=\"{provider}\",api=\"{api}\"}} {value}"
            );
        }

        let _ = writeln!(out, "# HELP zombie_scan_budget_decisions_total Budget admission decisions");
        let _ = writeln!(out, "# TYPE zombie_scan_budget_decisions_total counter");
        for ((provider, api, decision), value) in &state.decisions {
            let _ = writeln!(
                out,
                "zombie_scan_budget_decisions_total{{provider=\"{provider}\",api=\"{api}\",decision=\"{decision}\"}} {value}"
            );
        }

        out
    }
}

impl MetricsRecorder for InMemoryMetrics {
    fn record_calls(&self, provider: &str, api: &str, units: u64, cost_usd: f64) {
        let mut state = self.state.lock();
        *state.calls.entry(labels(provider, api)).or_default() += units;
        if cost_usd > 0.0 {
            *state.cost.entry(labels(provider, api)).or_default() += cost_usd;
        }
    }

    fn set_budget_remaining(&self, provider: &str, api: &str, remaining: u64) {
        self.state
            .lock()
            .remaining
            .insert(labels(provider, api), remaining);
    }

    fn record_decision(&self, provider: &str, api: &str, decision: Decision) {
        *self
            .state
            .lock()
            .decisions
            .entry((provider.to_string(), api.to_string(), decision))
            .or_default() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = InMemoryMetrics::new();
        metrics.record_calls("aws", "cloudwatch", 2, 0.02);
        metrics.record_calls("aws", "cloudwatch", 1, 0.01);
        metrics.record_calls("gcp", "cloudwatch", 1, 0.0);

        assert_eq!(metrics.calls_total("aws", "cloudwatch"), 3);
        assert!((metrics.cost_total("aws", "cloudwatch") - 0.03).abs() < 1e-9);
        assert_eq!(metrics.calls_total("gcp", "cloudwatch"), 1);
        assert_eq!(metrics.cost_total("gcp", "cloudwatch"), 0.0);
    }

    #[test]
    fn test_gauge_overwrites() {
        let metrics = InMemoryMetrics::new();
        assert_eq!(metrics.budget_remaining("aws", "cloudwatch"), None);

        metrics.set_budget_remaining("aws", "cloudwatch", 5);
        metrics.set_budget_remaining("aws", "cloudwatch", 4);
        assert_eq!(metrics.budget_remaining("aws", "cloudwatch"), Some(4));
    }

    #[test]
    fn test_render_prometheus() {
        let metrics = InMemoryMetrics::new();
        metrics.record_calls("azure", "azure_monitor", 1, 0.0);
        metrics.record_decision("azure", "azure_monitor", Decision::WouldDeny);

        let text = metrics.render_prometheus();
        assert!(text.contains("# TYPE zombie_scan_api_calls_total counter"));
        assert!(text.contains(
            "zombie_scan_api_calls_total{provider=\"azure\",api=\"azure_monitor\"} 1"
        ));
        assert!(text.contains("decision=\"would_deny\"} 1"));
    }
}
