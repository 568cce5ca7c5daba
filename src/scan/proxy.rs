//! Guarded Telemetry Client
//!
//! Wraps a remote telemetry client and routes a configured set of expensive
//! operations through the [`BudgetGovernor`]. When the governor denies a
//! call the proxy answers with an empty payload shaped like the real API
//! response, so plugins coded against the real response need no
//! denial-specific branches. Every other operation passes straight through.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::governor::{BudgetGovernor, ConsumeRequest};
use super::types::CloudProvider;

/// Dynamic remote telemetry client
#[async_trait]
pub trait TelemetryClient: Send + Sync {
    /// Invoke `operation` with JSON parameters, returning the JSON response
    async fn call(&self, operation: &str, params: Value) -> Result<Value>;
}

#[async_trait]
impl<T: TelemetryClient + ?Sized> TelemetryClient for Arc<T> {
    async fn call(&self, operation: &str, params: Value) -> Result<Value> {
        (**self).call(operation, params).await
    }
}

/// Budget API id and neutral responses for a provider's metrics service
pub fn default_guarded_operations(provider: CloudProvider) -> (&'static str, Vec<(&'static str, Value)>) {
    match provider {
        CloudProvider::Aws => (
            "cloudwatch",
            vec![
                (
                    "GetMetricStatistics",
                    json!({ "Label": "", "Datapoints": [] }),
                ),
                (
                    "GetMetricData",
                    json!({ "MetricDataResults": [], "Messages": [] }),
                ),
            ],
        ),
        CloudProvider::Azure => (
            "azure_monitor",
            vec![(
                "metrics.list",
                json!({ "cost": 0, "timespan": "", "interval": "", "value": [] }),
            )],
        ),
        CloudProvider::Gcp => (
            "gcp_monitoring",
            vec![(
                "projects.timeSeries.list",
                json!({ "timeSeries": [], "nextPageToken": "" }),
            )],
        ),
    }
}

/// Telemetry client that spends governor budget on expensive operations
pub struct GuardedClientProxy<C> {
    inner: C,
    api_id: String,
    governor: Arc<BudgetGovernor>,
    /// Expensive operation name -> response returned on denial
    guarded: HashMap<String, Value>,
}

impl<C> GuardedClientProxy<C> {
    /// Wrap `inner`; no operation is guarded until [`Self::guard`] is called
    pub fn new(inner: C, api_id: impl Into<String>, governor: Arc<BudgetGovernor>) -> Self {
        Self {
            inner,
            api_id: api_id.into(),
            governor,
            guarded: HashMap::new(),
        }
    }

    /// Wrap `inner` guarding the provider's standard metric operations
    pub fn for_provider(inner: C, provider: CloudProvider, governor: Arc<BudgetGovernor>) -> Self {
        let (api_id, operations) = default_guarded_operations(provider);
        operations
            .into_iter()
            .fold(Self::new(inner, api_id, governor), |proxy, (op, empty)| {
                proxy.guard(op, empty)
            })
    }

    /// Mark `operation` as expensive; `empty_response` is returned on denial
    pub fn guard(mut self, operation: impl Into<String>, empty_response: Value) -> Self {
        self.guarded.insert(operation.into(), empty_response);
        self
    }

    pub fn api_id(&self) -> &str {
        &self.api_id
    }

    pub fn is_guarded(&self, operation: &str) -> bool {
        self.guarded.contains_key(operation)
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Run a typed SDK call under the governor.
    ///
    /// `call` is never polled when the budget is exhausted; `fallback`
    /// builds the neutral response instead.
    pub async fn guarded<T, Fut>(
        &self,
        operation: &str,
        fallback: impl FnOnce() -> T,
        call: impl FnOnce(&C) -> Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        if !self.admit(operation) {
            return Ok(fallback());
        }
        call(&self.inner).await
    }

    fn admit(&self, operation: &str) -> bool {
        let admitted = self
            .governor
            .consume_with(ConsumeRequest::new(&self.api_id).operation(operation));
        if !admitted {
            debug!(
                api = %self.api_id,
                operation = %operation,
                "Returning empty response for denied call"
            );
        }
        admitted
    }
}

#[async_trait]
impl<C: TelemetryClient> TelemetryClient for GuardedClientProxy<C> {
    async fn call(&self, operation: &str, params: Value) -> Result<Value> {
        if let Some(empty) = self.guarded.get(operation) {
            if !self.admit(operation) {
                return Ok(empty.clone());
            }
        }
        self.inner.call(operation, params).await
    }
}
