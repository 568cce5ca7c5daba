//! Budget-Governed Zombie Resource Scan
//!
//! Scans cloud connections across AWS, Azure and GCP for billed-but-idle
//! resources using provider-specific detection plugins.
//!
//! ## Architecture
//!
//! - **Scan Context**: task-local tenant/provider/connection/region/plugin identity
//! - **Budget Governor**: per-day, per-tenant admission control for expensive
//!   telemetry APIs
//! - **Guarded Client**: telemetry proxy that spends governor budget before
//!   expensive calls and answers denials with empty, response-shaped payloads
//! - **Plugin Registry**: provider -> ordered plugins, built once at startup
//! - **Orchestrator**: concurrent per-provider fan-out with per-plugin
//!   failure isolation
//!
//! ## Example Usage
//!
//! ```ignore
//! use lornu_zombie_scan::scan::*;
//!
//! let mut builder = PluginRegistry::builder();
//! builder.load_plugins_for_provider("aws", |r| {
//!     r.register(UnattachedVolumes::default());
//! })?;
//! let registry = builder.build();
//!
//! let governor = Arc::new(BudgetGovernor::new(config, Arc::new(InMemoryMetrics::new())));
//! let results = ScanOrchestrator::new(CloudProvider::Aws, &registry, target)
//!     .with_guarded_telemetry(cloudwatch, governor)
//!     .scan_all()
//!     .await;
//! ```

pub mod config;
pub mod context;
pub mod governor;
pub mod metrics;
pub mod orchestrator;
pub mod proxy;
pub mod registry;
mod types;

pub use config::{GovernorConfig, ScanSettings};
pub use context::{current_scan_context, sync_scope, with_scan_context, ScanContext};
pub use governor::{
    Admission, BudgetGovernor, BudgetKey, Clock, ConsumeRequest, LedgerEntry, SystemClock,
    UNKNOWN_PROVIDER, UNKNOWN_TENANT,
};
pub use metrics::{Decision, InMemoryMetrics, MetricsRecorder};
pub use orchestrator::{canonical_categories, InventoryDiscovery, ScanOrchestrator, ScanTarget};
pub use proxy::{default_guarded_operations, GuardedClientProxy, TelemetryClient};
pub use registry::{PluginHandle, PluginRegistry, PluginRegistryBuilder, ProviderRegistrar, ScanPlugin};
pub use types::*;
