//! Zombie Scan Types
//!
//! Core types shared by the governor, the guarded proxy and the orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::proxy::TelemetryClient;

/// A single detection result produced by a plugin.
///
/// The scan core never inspects or rewrites findings; downstream consumers
/// expect keys such as `resource_id`, `resource_type`, `monthly_cost`,
/// `recommendation`, `action` and `confidence_score`.
pub type Finding = serde_json::Map<String, serde_json::Value>;

/// Aggregated findings keyed by category.
pub type ScanResults = BTreeMap<String, Vec<Finding>>;

/// Cloud provider identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Azure,
    Gcp,
}

impl CloudProvider {
    /// Registry key for this provider
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "aws",
            CloudProvider::Azure => "azure",
            CloudProvider::Gcp => "gcp",
        }
    }

    /// Name of the account identifier a scan cannot run without
    pub fn account_label(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "account_id",
            CloudProvider::Azure => "subscription_id",
            CloudProvider::Gcp => "project_id",
        }
    }
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CloudProvider {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" => Ok(CloudProvider::Aws),
            "azure" => Ok(CloudProvider::Azure),
            "gcp" => Ok(CloudProvider::Gcp),
            other => Err(ScanError::Config(format!("unknown provider: {other}"))),
        }
    }
}

/// Credential material handed to plugins
#[derive(Clone)]
pub enum CredentialValue {
    Token(String),
    AwsKeys {
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    },
}

// Secrets never reach the logs.
impl std::fmt::Debug for CredentialValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialValue::Token(_) => f.write_str("Token(***)"),
            CredentialValue::AwsKeys { access_key_id, .. } => f
                .debug_struct("AwsKeys")
                .field("access_key_id", access_key_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Credentials for one cloud connection
#[derive(Debug, Clone)]
pub struct Credentials {
    /// AWS account, Azure subscription or GCP project
    pub account_id: Option<String>,
    pub value: CredentialValue,
}

impl Credentials {
    pub fn token(account_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            account_id: Some(account_id.into()),
            value: CredentialValue::Token(token.into()),
        }
    }

    pub fn aws_keys(
        account_id: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        Self {
            account_id: Some(account_id.into()),
            value: CredentialValue::AwsKeys {
                access_key_id: access_key_id.into(),
                secret_access_key: secret_access_key.into(),
                session_token: None,
            },
        }
    }

    /// Account identifier, if present and non-blank
    pub fn account(&self) -> Option<&str> {
        self.account_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Resource universe discovered once before plugin fan-out
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    /// Resources keyed by resource type
    pub resources: BTreeMap<String, Vec<serde_json::Value>>,
}

impl Inventory {
    pub fn resources_of(&self, resource_type: &str) -> &[serde_json::Value] {
        self.resources
            .get(resource_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.resources.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a plugin may consume for one scan.
///
/// Each field is optional so a plugin reads only what it needs.
#[derive(Clone, Default)]
pub struct ScanRequest {
    pub region: String,
    pub credentials: Option<Credentials>,
    /// Plugin-specific thresholds and settings
    pub config: Option<serde_json::Value>,
    pub inventory: Option<Arc<Inventory>>,
    /// Billing export rows for cost-aware plugins
    pub cost_feed: Option<Arc<Vec<serde_json::Value>>>,
    pub usage_records: Option<Arc<Vec<serde_json::Value>>>,
    /// Telemetry client, normally a guarded proxy
    pub telemetry: Option<Arc<dyn TelemetryClient>>,
}

impl std::fmt::Debug for ScanRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanRequest")
            .field("region", &self.region)
            .field("credentials", &self.credentials)
            .field("config", &self.config)
            .field("inventory", &self.inventory.as_ref().map(|i| i.len()))
            .field("cost_feed", &self.cost_feed.as_ref().map(|c| c.len()))
            .field("usage_records", &self.usage_records.as_ref().map(|u| u.len()))
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}

/// Terminal state of one plugin execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PluginOutcome {
    Succeeded { findings: usize },
    Failed { error: String },
    TimedOut { after_ms: u64 },
}

impl PluginOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PluginOutcome::Succeeded { .. })
    }

    /// Combine two outcomes reported under the same category key.
    /// Successes add up; the first failure wins over any success.
    pub fn merge(self, other: PluginOutcome) -> PluginOutcome {
        match (self, other) {
            (PluginOutcome::Succeeded { findings: a }, PluginOutcome::Succeeded { findings: b }) => {
                PluginOutcome::Succeeded { findings: a + b }
            }
            (PluginOutcome::Succeeded { .. }, failure) => failure,
            (failure, _) => failure,
        }
    }
}

/// Result of one provider scan with per-plugin detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub scan_id: uuid::Uuid,
    pub provider: String,
    pub tenant_id: String,
    pub results: ScanResults,
    pub outcomes: BTreeMap<String, PluginOutcome>,
    pub duration_ms: u64,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

impl ScanReport {
    pub fn total_findings(&self) -> usize {
        self.results.values().map(Vec::len).sum()
    }

    pub fn failed_categories(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(category, _)| category.as_str())
            .collect()
    }
}

/// Errors raised inside the scan core
#[derive(Debug, Error)]
pub enum ScanError {
    /// A plugin returned an error
    #[error("Plugin {category} failed: {message}")]
    PluginExecution { category: String, message: String },

    /// A plugin panicked while scanning
    #[error("Plugin {category} panicked: {message}")]
    PluginPanicked { category: String, message: String },

    /// A plugin task was lost before reporting a result
    #[error("Plugin {category} produced no result")]
    MalformedPluginResult { category: String },

    /// A plugin exceeded its deadline
    #[error("Plugin {category} timed out after {timeout:?}")]
    PluginTimeout { category: String, timeout: Duration },

    /// Provider-level precondition failure
    #[error("Credentials unavailable: {0}")]
    CredentialUnavailable(String),

    /// Registry bootstrap misuse
    #[error("Registry error: {0}")]
    Registry(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ScanError {
    /// Outcome recorded for a failed plugin
    pub fn outcome(&self) -> PluginOutcome {
        match self {
            ScanError::PluginTimeout { timeout, .. } => PluginOutcome::TimedOut {
                after_ms: timeout.as_millis() as u64,
            },
            other => PluginOutcome::Failed {
                error: other.to_string(),
            },
        }
    }
}
