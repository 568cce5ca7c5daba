//! Provider Scan Orchestrator
//!
//! Runs every allowed detection plugin of one provider concurrently against
//! one cloud connection and merges their findings into a category-keyed map.
//!
//! Each plugin runs as its own tokio task under its own [`ScanContext`].
//! Errors, panics and (optionally) deadline overruns are contained at the
//! task boundary: the failing category contributes an empty list and the
//! rest of the scan carries on.

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::context::{with_scan_context, ScanContext};
use super::governor::BudgetGovernor;
use super::proxy::{GuardedClientProxy, TelemetryClient};
use super::registry::{PluginHandle, PluginRegistry};
use super::types::{
    CloudProvider, Credentials, Finding, Inventory, PluginOutcome, ScanError, ScanReport,
    ScanRequest, ScanResults,
};

/// Context label used while the inventory pass runs
const INVENTORY_PLUGIN: &str = "inventory";

/// Canonical category keys a provider scan will run.
///
/// Plugins registered under any other key (experimental or half-migrated
/// detectors) are skipped.
pub fn canonical_categories(provider: CloudProvider) -> &'static [&'static str] {
    match provider {
        CloudProvider::Aws => &[
            "unattached_ebs_volumes",
            "old_ebs_snapshots",
            "idle_ec2_instances",
            "stopped_ec2_instances",
            "unused_elastic_ips",
            "idle_nat_gateways",
            "idle_load_balancers",
            "idle_rds_instances",
            "idle_elasticache_clusters",
            "unused_ecr_images",
            "idle_lambda_functions",
            "empty_s3_buckets",
        ],
        CloudProvider::Azure => &[
            "unattached_managed_disks",
            "old_disk_snapshots",
            "idle_virtual_machines",
            "deallocated_virtual_machines",
            "unused_public_ips",
            "idle_load_balancers",
            "idle_application_gateways",
            "idle_sql_databases",
            "empty_app_service_plans",
            "idle_nat_gateways",
        ],
        CloudProvider::Gcp => &[
            "unattached_persistent_disks",
            "old_disk_snapshots",
            "idle_compute_instances",
            "stopped_compute_instances",
            "unused_static_ips",
            "idle_cloud_sql_instances",
            "idle_load_balancers",
            "idle_cloud_nat_gateways",
            "unused_machine_images",
            "idle_gke_node_pools",
        ],
    }
}

/// Bulk resource discovery run once before plugin fan-out
#[async_trait]
pub trait InventoryDiscovery: Send + Sync {
    async fn discover(&self, request: &ScanRequest) -> Result<Inventory>;
}

/// The cloud connection a scan runs against
#[derive(Debug, Clone)]
pub struct ScanTarget {
    pub tenant_id: String,
    pub connection_id: String,
    pub region: String,
    pub credentials: Option<Credentials>,
}

impl ScanTarget {
    pub fn new(
        tenant_id: impl Into<String>,
        connection_id: impl Into<String>,
        region: impl Into<String>,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            connection_id: connection_id.into(),
            region: region.into(),
            credentials,
        }
    }
}

/// Concurrent scan of one provider connection
pub struct ScanOrchestrator {
    provider: CloudProvider,
    target: ScanTarget,
    plugins: Vec<PluginHandle>,
    inventory: Option<Arc<dyn InventoryDiscovery>>,
    telemetry: Option<Arc<dyn TelemetryClient>>,
    plugin_config: HashMap<String, Value>,
    cost_feed: Option<Arc<Vec<Value>>>,
    usage_records: Option<Arc<Vec<Value>>>,
    plugin_timeout: Option<Duration>,
}

impl ScanOrchestrator {
    /// Orchestrator over the provider's canonical categories
    pub fn new(provider: CloudProvider, registry: &PluginRegistry, target: ScanTarget) -> Self {
        Self::with_allowed_categories(
            provider,
            registry,
            target,
            canonical_categories(provider).iter().copied(),
        )
    }

    /// Orchestrator over an explicit category allow-list
    pub fn with_allowed_categories<I, S>(
        provider: CloudProvider,
        registry: &PluginRegistry,
        target: ScanTarget,
        allowed: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed: HashSet<String> = allowed
            .into_iter()
            .map(|category| category.as_ref().to_string())
            .collect();

        let plugins: Vec<PluginHandle> = registry
            .plugins_for_provider(provider.as_str())
            .iter()
            .filter(|plugin| {
                let keep = allowed.contains(plugin.category_key());
                if !keep {
                    debug!(
                        provider = %provider,
                        category = %plugin.category_key(),
                        "Skipping plugin outside the category allow-list"
                    );
                }
                keep
            })
            .cloned()
            .collect();

        Self {
            provider,
            target,
            plugins,
            inventory: None,
            telemetry: None,
            plugin_config: HashMap::new(),
            cost_feed: None,
            usage_records: None,
            plugin_timeout: None,
        }
    }

    /// Run a bulk inventory pass before fan-out
    pub fn with_inventory_discovery(mut self, discovery: Arc<dyn InventoryDiscovery>) -> Self {
        self.inventory = Some(discovery);
        self
    }

    /// Hand plugins an already prepared telemetry client
    pub fn with_telemetry(mut self, client: Arc<dyn TelemetryClient>) -> Self {
        self.telemetry = Some(client);
        self
    }

    /// Wrap a raw telemetry client in the provider's budget guard
    pub fn with_guarded_telemetry<C>(self, client: C, governor: Arc<BudgetGovernor>) -> Self
    where
        C: TelemetryClient + 'static,
    {
        let proxy = GuardedClientProxy::for_provider(client, self.provider, governor);
        self.with_telemetry(Arc::new(proxy))
    }

    /// Settings passed to the plugin for `category`
    pub fn with_plugin_config(mut self, category: impl Into<String>, config: Value) -> Self {
        self.plugin_config.insert(category.into(), config);
        self
    }

    pub fn with_cost_feed(mut self, rows: Vec<Value>) -> Self {
        self.cost_feed = Some(Arc::new(rows));
        self
    }

    pub fn with_usage_records(mut self, rows: Vec<Value>) -> Self {
        self.usage_records = Some(Arc::new(rows));
        self
    }

    /// Abandon any plugin still running after `timeout`
    pub fn with_plugin_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.plugin_timeout = timeout;
        self
    }

    pub fn provider(&self) -> CloudProvider {
        self.provider
    }

    /// Category keys that will run, in registration order
    pub fn categories(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.category_key()).collect()
    }

    /// Run every plugin and return the merged findings
    pub async fn scan_all(&self) -> ScanResults {
        self.scan_all_detailed(|_, _| {}).await.results
    }

    /// Like [`Self::scan_all`], calling `on_category_complete` as soon as
    /// each plugin finishes
    pub async fn scan_all_with_progress<F>(&self, on_category_complete: F) -> ScanResults
    where
        F: FnMut(&str, &[Finding]),
    {
        self.scan_all_detailed(on_category_complete).await.results
    }

    /// Full scan with per-plugin outcomes
    pub async fn scan_all_detailed<F>(&self, on_category_complete: F) -> ScanReport
    where
        F: FnMut(&str, &[Finding]),
    {
        let scan_id = Uuid::new_v4();
        let span = info_span!(
            "provider_scan",
            %scan_id,
            provider = %self.provider,
            tenant = %self.target.tenant_id,
            connection = %self.target.connection_id,
            region = %self.target.region,
        );

        self.run(scan_id, on_category_complete).instrument(span).await
    }

    async fn run<F>(&self, scan_id: Uuid, mut on_category_complete: F) -> ScanReport
    where
        F: FnMut(&str, &[Finding]),
    {
        let start = Instant::now();
        let mut results = ScanResults::new();
        let mut outcomes = BTreeMap::new();

        if let Err(e) = self.check_preconditions() {
            error!(error = %e, "Provider scan aborted");
            return self.report(scan_id, results, outcomes, start);
        }

        info!(plugins = self.plugins.len(), "Starting provider scan");

        let base_context = ScanContext::new(
            &self.target.tenant_id,
            self.provider.as_str(),
            &self.target.connection_id,
            &self.target.region,
            "",
        );

        let mut request = self.base_request();
        request.inventory = self.discover_inventory(&request, &base_context).await;

        let mut tasks = JoinSet::new();
        for plugin in &self.plugins {
            let category = plugin.category_key().to_string();
            let context = base_context.for_plugin(&category);
            let mut plugin_request = request.clone();
            plugin_request.config = self.plugin_config.get(&category).cloned();

            let plugin = plugin.clone();
            let timeout = self.plugin_timeout;
            tasks.spawn(
                async move {
                    let outcome = run_plugin(plugin, plugin_request, context, timeout).await;
                    (category, outcome)
                }
                .in_current_span(),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            let (category, findings) = match joined {
                Ok((category, Ok(findings))) => {
                    debug!(category = %category, findings = findings.len(), "Plugin finished");
                    record_outcome(
                        &mut outcomes,
                        &category,
                        PluginOutcome::Succeeded {
                            findings: findings.len(),
                        },
                    );
                    (category, findings)
                }
                Ok((category, Err(e))) => {
                    warn!(category = %category, error = %e, "Plugin failed, continuing with empty results");
                    record_outcome(&mut outcomes, &category, e.outcome());
                    (category, Vec::new())
                }
                Err(e) => {
                    error!(error = %e, "Plugin task lost");
                    continue;
                }
            };

            on_category_complete(&category, &findings);
            results.entry(category).or_default().extend(findings);
        }

        for plugin in &self.plugins {
            let category = plugin.category_key();
            if !outcomes.contains_key(category) {
                let e = ScanError::MalformedPluginResult {
                    category: category.to_string(),
                };
                warn!(category = %category, error = %e, "Plugin produced no result");
                outcomes.insert(category.to_string(), e.outcome());
                results.entry(category.to_string()).or_default();
            }
        }

        let report = self.report(scan_id, results, outcomes, start);
        info!(
            categories = report.results.len(),
            findings = report.total_findings(),
            failed = report.failed_categories().len(),
            duration_ms = report.duration_ms,
            "Provider scan complete"
        );
        report
    }

    fn check_preconditions(&self) -> Result<(), ScanError> {
        let credentials = self.target.credentials.as_ref().ok_or_else(|| {
            ScanError::CredentialUnavailable(format!(
                "no credentials for connection {}",
                self.target.connection_id
            ))
        })?;

        if credentials.account().is_none() {
            return Err(ScanError::CredentialUnavailable(format!(
                "missing {} for connection {}",
                self.provider.account_label(),
                self.target.connection_id
            )));
        }

        Ok(())
    }

    fn base_request(&self) -> ScanRequest {
        ScanRequest {
            region: self.target.region.clone(),
            credentials: self.target.credentials.clone(),
            config: None,
            inventory: None,
            cost_feed: self.cost_feed.clone(),
            usage_records: self.usage_records.clone(),
            telemetry: self.telemetry.clone(),
        }
    }

    async fn discover_inventory(
        &self,
        request: &ScanRequest,
        base_context: &ScanContext,
    ) -> Option<Arc<Inventory>> {
        let discovery = self.inventory.as_ref()?;

        let context = base_context.for_plugin(INVENTORY_PLUGIN);
        match with_scan_context(context, discovery.discover(request)).await {
            Ok(inventory) => {
                info!(resources = inventory.len(), "Inventory discovery complete");
                Some(Arc::new(inventory))
            }
            Err(e) => {
                warn!(error = %e, "Inventory discovery failed, plugins will discover on their own");
                None
            }
        }
    }

    fn report(
        &self,
        scan_id: Uuid,
        results: ScanResults,
        outcomes: BTreeMap<String, PluginOutcome>,
        start: Instant,
    ) -> ScanReport {
        ScanReport {
            scan_id,
            provider: self.provider.to_string(),
            tenant_id: self.target.tenant_id.clone(),
            results,
            outcomes,
            duration_ms: start.elapsed().as_millis() as u64,
            completed_at: chrono::Utc::now(),
        }
    }
}

/// Run one plugin inside its scan context, converting every failure mode
/// into a [`ScanError`].
async fn run_plugin(
    plugin: PluginHandle,
    request: ScanRequest,
    context: ScanContext,
    timeout: Option<Duration>,
) -> Result<Vec<Finding>, ScanError> {
    let category = context.plugin.clone();
    let scan = with_scan_context(context, async move { plugin.scan(&request).await });
    let scan = AssertUnwindSafe(scan).catch_unwind();

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, scan).await {
            Ok(result) => result,
            Err(_) => {
                return Err(ScanError::PluginTimeout {
                    category,
                    timeout: limit,
                })
            }
        },
        None => scan.await,
    };

    match result {
        Ok(Ok(findings)) => Ok(findings),
        Ok(Err(e)) => Err(ScanError::PluginExecution {
            category,
            message: format!("{e:#}"),
        }),
        Err(payload) => Err(ScanError::PluginPanicked {
            category,
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Plugins sharing a category key report into one outcome; a failure is
/// never hidden by a later success.
fn record_outcome(
    outcomes: &mut BTreeMap<String, PluginOutcome>,
    category: &str,
    outcome: PluginOutcome,
) {
    let merged = match outcomes.remove(category) {
        Some(previous) => previous.merge(outcome),
        None => outcome,
    };
    outcomes.insert(category.to_string(), merged);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::config::GovernorConfig;
    use crate::scan::context::current_scan_context;
    use crate::scan::metrics::InMemoryMetrics;
    use crate::scan::registry::{PluginRegistryBuilder, ScanPlugin};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn finding(resource_id: &str) -> Finding {
        json!({
            "resource_id": resource_id,
            "resource_type": "volume",
            "monthly_cost": 4.0,
            "recommendation": "Delete",
            "action": "delete",
            "confidence_score": 0.9
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    enum Behavior {
        Findings(Vec<&'static str>),
        Fail,
        Panic,
        Sleep(Duration, Vec<&'static str>),
        EchoContext,
        CountInventory,
        QueryMetrics,
    }

    struct TestPlugin {
        key: &'static str,
        behavior: Behavior,
        runs: Arc<AtomicUsize>,
    }

    impl TestPlugin {
        fn new(key: &'static str, behavior: Behavior) -> Self {
            Self {
                key,
                behavior,
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ScanPlugin for TestPlugin {
        fn category_key(&self) -> &str {
            self.key
        }

        async fn scan(&self, request: &ScanRequest) -> Result<Vec<Finding>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Findings(ids) => Ok(ids.iter().map(|id| finding(id)).collect()),
                Behavior::Fail => anyhow::bail!("DescribeVolumes throttled"),
                Behavior::Panic => panic!("plugin bug"),
                Behavior::Sleep(delay, ids) => {
                    tokio::time::sleep(*delay).await;
                    Ok(ids.iter().map(|id| finding(id)).collect())
                }
                Behavior::EchoContext => {
                    let ctx = current_scan_context().expect("scan context");
                    let mut f = finding("ctx");
                    f.insert("tenant".into(), json!(ctx.tenant_id));
                    f.insert("plugin".into(), json!(ctx.plugin));
                    f.insert("region".into(), json!(request.region));
                    f.insert("config".into(), request.config.clone().unwrap_or(Value::Null));
                    Ok(vec![f])
                }
                Behavior::CountInventory => {
                    let count = request.inventory.as_ref().map(|i| i.len()).unwrap_or(0);
                    let mut f = finding("inventory");
                    f.insert("seen".into(), json!(count));
                    Ok(vec![f])
                }
                Behavior::QueryMetrics => {
                    let telemetry = request.telemetry.as_ref().expect("telemetry");
                    let response = telemetry
                        .call("GetMetricData", json!({"MetricName": "VolumeReadOps"}))
                        .await?;
                    let results = response["MetricDataResults"]
                        .as_array()
                        .map(Vec::len)
                        .unwrap_or(0);
                    let mut f = finding(self.key);
                    f.insert("datapoints".into(), json!(results));
                    Ok(vec![f])
                }
            }
        }
    }

    fn registry(plugins: Vec<TestPlugin>) -> PluginRegistry {
        let mut builder = PluginRegistryBuilder::new();
        builder
            .load_plugins_for_provider("aws", |r| {
                for plugin in plugins {
                    r.register(plugin);
                }
            })
            .unwrap();
        builder.build()
    }

    fn target() -> ScanTarget {
        ScanTarget::new(
            "t1",
            "conn-1",
            "us-east-1",
            Some(Credentials::token("123456789012", "token")),
        )
    }

    fn orchestrator(registry: &PluginRegistry, allowed: &[&str]) -> ScanOrchestrator {
        ScanOrchestrator::with_allowed_categories(
            CloudProvider::Aws,
            registry,
            target(),
            allowed.iter().copied(),
        )
    }

    #[tokio::test]
    async fn test_failing_plugin_is_isolated() {
        let registry = registry(vec![
            TestPlugin::new("a", Behavior::Findings(vec!["vol-1", "vol-2"])),
            TestPlugin::new("b", Behavior::Fail),
            TestPlugin::new("c", Behavior::Findings(vec!["eip-1"])),
        ]);

        let report = orchestrator(&registry, &["a", "b", "c"])
            .scan_all_detailed(|_, _| {})
            .await;

        assert_eq!(
            report.results.keys().collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(report.results["a"].len(), 2);
        assert!(report.results["b"].is_empty());
        assert_eq!(report.results["c"][0]["resource_id"], "eip-1");
        assert_eq!(report.failed_categories(), vec!["b"]);
        assert!(matches!(report.outcomes["b"], PluginOutcome::Failed { ref error } if error.contains("throttled")));
    }

    #[tokio::test]
    async fn test_shared_category_keeps_failure() {
        let registry = registry(vec![
            TestPlugin::new("a", Behavior::Fail),
            TestPlugin::new("a", Behavior::Sleep(Duration::from_millis(30), vec!["vol-1"])),
            TestPlugin::new("b", Behavior::Findings(vec!["eip-1"])),
            TestPlugin::new("b", Behavior::Findings(vec!["eip-2", "eip-3"])),
        ]);

        let report = orchestrator(&registry, &["a", "b"])
            .scan_all_detailed(|_, _| {})
            .await;

        assert_eq!(report.results["a"].len(), 1);
        assert_eq!(report.results["b"].len(), 3);
        assert_eq!(report.failed_categories(), vec!["a"]);
        assert!(matches!(report.outcomes["a"], PluginOutcome::Failed { ref error } if error.contains("throttled")));
        assert_eq!(report.outcomes["b"], PluginOutcome::Succeeded { findings: 3 });
    }

    #[tokio::test]
    async fn test_panicking_plugin_is_isolated() {
        let registry = registry(vec![
            TestPlugin::new("a", Behavior::Panic),
            TestPlugin::new("b", Behavior::Findings(vec!["vol-9"])),
        ]);

        let report = orchestrator(&registry, &["a", "b"])
            .scan_all_detailed(|_, _| {})
            .await;

        assert!(report.results["a"].is_empty());
        assert_eq!(report.results["b"].len(), 1);
        assert!(matches!(report.outcomes["a"], PluginOutcome::Failed { ref error } if error.contains("plugin bug")));
    }

    #[tokio::test]
    async fn test_completion_order_does_not_change_results() {
        let fast = Duration::from_millis(1);
        let slow = Duration::from_millis(40);

        let first = registry(vec![
            TestPlugin::new("a", Behavior::Sleep(slow, vec!["vol-1"])),
            TestPlugin::new("b", Behavior::Sleep(fast, vec!["eip-1", "eip-2"])),
            TestPlugin::new("c", Behavior::Fail),
        ]);
        let second = registry(vec![
            TestPlugin::new("a", Behavior::Sleep(fast, vec!["vol-1"])),
            TestPlugin::new("b", Behavior::Sleep(slow, vec!["eip-1", "eip-2"])),
            TestPlugin::new("c", Behavior::Fail),
        ]);

        let mut first_order = Vec::new();
        let first_results = orchestrator(&first, &["a", "b", "c"])
            .scan_all_with_progress(|category, _| first_order.push(category.to_string()))
            .await;
        let mut second_order = Vec::new();
        let second_results = orchestrator(&second, &["a", "b", "c"])
            .scan_all_with_progress(|category, _| second_order.push(category.to_string()))
            .await;

        assert_eq!(first_results, second_results);
        assert_eq!(first_order.last().map(String::as_str), Some("a"));
        assert_eq!(second_order.last().map(String::as_str), Some("b"));
    }

    #[tokio::test]
    async fn test_progress_streams_partial_results() {
        let registry = registry(vec![
            TestPlugin::new("slow", Behavior::Sleep(Duration::from_millis(50), vec!["db-1"])),
            TestPlugin::new("fast", Behavior::Findings(vec!["ip-1"])),
        ]);

        let seen = Mutex::new(Vec::new());
        let results = orchestrator(&registry, &["slow", "fast"])
            .scan_all_with_progress(|category, findings| {
                seen.lock().push((category.to_string(), findings.len()));
            })
            .await;

        assert_eq!(
            seen.into_inner(),
            vec![("fast".to_string(), 1), ("slow".to_string(), 1)]
        );
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_credentials_short_circuit() {
        let plugin = TestPlugin::new("a", Behavior::Findings(vec!["vol-1"]));
        let runs = plugin.runs.clone();
        let registry = registry(vec![plugin]);

        let no_credentials = ScanOrchestrator::with_allowed_categories(
            CloudProvider::Aws,
            &registry,
            ScanTarget::new("t1", "conn-1", "us-east-1", None),
            ["a"],
        );
        assert!(no_credentials.scan_all().await.is_empty());

        let mut creds = Credentials::token("x", "token");
        creds.account_id = None;
        let no_account = ScanOrchestrator::with_allowed_categories(
            CloudProvider::Aws,
            &registry,
            ScanTarget::new("t1", "conn-1", "us-east-1", Some(creds)),
            ["a"],
        );
        assert!(no_account.scan_all().await.is_empty());

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_allow_list_filters_plugins() {
        let experimental = TestPlugin::new("experimental", Behavior::Findings(vec!["x"]));
        let runs = experimental.runs.clone();
        let registry = registry(vec![
            TestPlugin::new("unattached_ebs_volumes", Behavior::Findings(vec!["vol-1"])),
            experimental,
        ]);

        let orchestrator = ScanOrchestrator::new(CloudProvider::Aws, &registry, target());
        assert_eq!(orchestrator.categories(), vec!["unattached_ebs_volumes"]);

        let results = orchestrator.scan_all().await;
        assert_eq!(results.keys().collect::<Vec<_>>(), vec!["unattached_ebs_volumes"]);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_each_plugin_sees_its_own_context_and_config() {
        let registry = registry(vec![
            TestPlugin::new("a", Behavior::EchoContext),
            TestPlugin::new("b", Behavior::EchoContext),
        ]);

        let results = orchestrator(&registry, &["a", "b"])
            .with_plugin_config("a", json!({"cpu_threshold": 5}))
            .scan_all()
            .await;

        assert_eq!(results["a"][0]["plugin"], "a");
        assert_eq!(results["b"][0]["plugin"], "b");
        assert_eq!(results["a"][0]["tenant"], "t1");
        assert_eq!(results["a"][0]["region"], "us-east-1");
        assert_eq!(results["a"][0]["config"]["cpu_threshold"], 5);
        assert_eq!(results["b"][0]["config"], Value::Null);
        assert!(current_scan_context().is_none());
    }

    struct StaticInventory(Result<usize, &'static str>);

    #[async_trait]
    impl InventoryDiscovery for StaticInventory {
        async fn discover(&self, _request: &ScanRequest) -> Result<Inventory> {
            assert_eq!(current_scan_context().unwrap().plugin, INVENTORY_PLUGIN);
            match self.0 {
                Ok(count) => {
                    let mut inventory = Inventory::default();
                    inventory.resources.insert(
                        "AWS::EC2::Volume".to_string(),
                        (0..count).map(|i| json!({"id": i})).collect(),
                    );
                    Ok(inventory)
                }
                Err(message) => anyhow::bail!(message),
            }
        }
    }

    #[tokio::test]
    async fn test_inventory_is_shared_with_plugins() {
        let registry = registry(vec![
            TestPlugin::new("a", Behavior::CountInventory),
            TestPlugin::new("b", Behavior::CountInventory),
        ]);

        let results = orchestrator(&registry, &["a", "b"])
            .with_inventory_discovery(Arc::new(StaticInventory(Ok(3))))
            .scan_all()
            .await;

        assert_eq!(results["a"][0]["seen"], 3);
        assert_eq!(results["b"][0]["seen"], 3);
    }

    #[tokio::test]
    async fn test_inventory_failure_does_not_abort_scan() {
        let registry = registry(vec![TestPlugin::new("a", Behavior::CountInventory)]);

        let results = orchestrator(&registry, &["a"])
            .with_inventory_discovery(Arc::new(StaticInventory(Err("resource explorer down"))))
            .scan_all()
            .await;

        assert_eq!(results["a"][0]["seen"], 0);
    }

    #[tokio::test]
    async fn test_hanging_plugin_times_out() {
        let registry = registry(vec![
            TestPlugin::new("hang", Behavior::Sleep(Duration::from_secs(30), vec!["never"])),
            TestPlugin::new("ok", Behavior::Findings(vec!["vol-1"])),
        ]);

        let started = Instant::now();
        let report = orchestrator(&registry, &["hang", "ok"])
            .with_plugin_timeout(Some(Duration::from_millis(50)))
            .scan_all_detailed(|_, _| {})
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(report.results["hang"].is_empty());
        assert_eq!(report.outcomes["hang"], PluginOutcome::TimedOut { after_ms: 50 });
        assert_eq!(report.results["ok"].len(), 1);
    }

    struct FakeCloudWatch {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TelemetryClient for FakeCloudWatch {
        async fn call(&self, _operation: &str, _params: Value) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"MetricDataResults": [{"Id": "m1", "Values": [0.0]}], "Messages": []}))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_guarded_telemetry_respects_budget_across_plugins() {
        let registry = registry(vec![
            TestPlugin::new("a", Behavior::QueryMetrics),
            TestPlugin::new("b", Behavior::QueryMetrics),
            TestPlugin::new("c", Behavior::QueryMetrics),
        ]);

        let metrics = Arc::new(InMemoryMetrics::new());
        let governor = Arc::new(BudgetGovernor::new(
            GovernorConfig::default().with_budget("cloudwatch", 1),
            metrics.clone(),
        ));
        let client = Arc::new(FakeCloudWatch {
            calls: AtomicUsize::new(0),
        });

        let report = orchestrator(&registry, &["a", "b", "c"])
            .with_guarded_telemetry(client.clone(), governor.clone())
            .scan_all_detailed(|_, _| {})
            .await;

        assert!(report.failed_categories().is_empty());
        let datapoints: usize = report
            .results
            .values()
            .map(|findings| findings[0]["datapoints"].as_u64().unwrap() as usize)
            .sum();
        assert_eq!(datapoints, 1);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(governor.usage("t1", "cloudwatch").calls_used, 1);
        assert_eq!(metrics.calls_total("aws", "cloudwatch"), 1);
    }

    #[test]
    fn test_canonical_categories_are_unique() {
        for provider in [CloudProvider::Aws, CloudProvider::Azure, CloudProvider::Gcp] {
            let categories = canonical_categories(provider);
            let unique: HashSet<_> = categories.iter().collect();
            assert_eq!(unique.len(), categories.len(), "{provider}");
        }
    }
}
