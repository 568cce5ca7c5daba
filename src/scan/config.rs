//! Scan Governor Configuration
//!
//! Budgets and cost estimates come from a JSON file and/or command-line
//! flags (each flag can also be set through the environment). Flags win
//! over the file on a per-API basis.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::types::ScanError;

/// Effective governor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// When false every call is admitted (metrics are still recorded)
    pub enabled: bool,
    /// When false over-budget calls are admitted and reported as `would_deny`
    pub enforce: bool,
    /// Daily call budget per API; 0 or absent means unlimited
    pub daily_budgets: HashMap<String, u64>,
    /// Estimated USD cost of one call per API
    pub cost_per_call_usd: HashMap<String, f64>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enforce: true,
            daily_budgets: HashMap::new(),
            cost_per_call_usd: HashMap::new(),
        }
    }
}

impl GovernorConfig {
    /// Parse a JSON document
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).context("Invalid governor config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read governor config: {:?}", path))?;
        Self::from_json_str(&raw)
    }

    /// Set the daily budget for one API
    pub fn with_budget(mut self, api: impl Into<String>, budget: u64) -> Self {
        self.daily_budgets.insert(api.into(), budget);
        self
    }

    /// Set the per-call cost estimate for one API
    pub fn with_cost_per_call(mut self, api: impl Into<String>, usd: f64) -> Self {
        self.cost_per_call_usd.insert(api.into(), usd);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn observe_only(mut self) -> Self {
        self.enforce = false;
        self
    }

    /// Daily budget for `api`; 0 means unlimited
    pub fn budget_for(&self, api: &str) -> u64 {
        self.daily_budgets.get(api).copied().unwrap_or(0)
    }

    pub fn cost_per_call(&self, api: &str) -> Option<f64> {
        self.cost_per_call_usd.get(api).copied()
    }

    fn validate(&self) -> Result<(), ScanError> {
        for (api, cost) in &self.cost_per_call_usd {
            if !cost.is_finite() || *cost < 0.0 {
                return Err(ScanError::Config(format!(
                    "cost per call for {api} must be a non-negative number, got {cost}"
                )));
            }
        }
        Ok(())
    }
}

/// Scan settings
#[derive(Parser, Debug, Clone)]
#[command(name = "zombie-scan", version, about)]
pub struct ScanSettings {
    /// Enable the API budget governor [default: true, or the config file value]
    #[arg(long, env = "SCAN_GOVERNOR_ENABLED", action = ArgAction::Set)]
    pub governor_enabled: Option<bool>,

    /// Deny over-budget calls, false = observe only [default: true, or the config file value]
    #[arg(long, env = "SCAN_GOVERNOR_ENFORCE", action = ArgAction::Set)]
    pub governor_enforce: Option<bool>,

    /// Daily call budgets, e.g. "cloudwatch=5000,azure_monitor=2000"
    #[arg(long = "api-budget", env = "SCAN_API_BUDGETS", value_delimiter = ',', value_parser = parse_budget)]
    pub api_budgets: Vec<(String, u64)>,

    /// Estimated cost per call in USD, e.g. "cloudwatch=0.00001"
    #[arg(long = "api-cost", env = "SCAN_API_COSTS", value_delimiter = ',', value_parser = parse_cost)]
    pub api_costs: Vec<(String, f64)>,

    /// Per-plugin deadline in seconds
    #[arg(long, env = "SCAN_PLUGIN_TIMEOUT_SECS")]
    pub plugin_timeout_secs: Option<u64>,

    /// JSON governor config file
    #[arg(long = "config", env = "SCAN_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,
}

impl ScanSettings {
    /// Merge the config file (if any) with explicit flags
    pub fn governor_config(&self) -> Result<GovernorConfig> {
        let mut config = match &self.config_file {
            Some(path) => GovernorConfig::from_file(path)?,
            None => GovernorConfig::default(),
        };

        if let Some(enabled) = self.governor_enabled {
            config.enabled = enabled;
        }
        if let Some(enforce) = self.governor_enforce {
            config.enforce = enforce;
        }

        for (api, budget) in &self.api_budgets {
            config.daily_budgets.insert(api.clone(), *budget);
        }
        for (api, cost) in &self.api_costs {
            config.cost_per_call_usd.insert(api.clone(), *cost);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn plugin_timeout(&self) -> Option<Duration> {
        self.plugin_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

fn split_pair(raw: &str) -> Result<(String, &str), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected api=value, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing api name in {raw:?}"));
    }
    Ok((key.to_string(), value.trim()))
}

fn parse_budget(raw: &str) -> Result<(String, u64), String> {
    let (api, value) = split_pair(raw)?;
    let budget = value
        .parse::<u64>()
        .map_err(|e| format!("invalid budget for {api}: {e}"))?;
    Ok((api, budget))
}

fn parse_cost(raw: &str) -> Result<(String, f64), String> {
    let (api, value) = split_pair(raw)?;
    let cost = value
        .parse::<f64>()
        .map_err(|e| format!("invalid cost for {api}: {e}"))?;
    if !cost.is_finite() || cost < 0.0 {
        return Err(format!("cost for {api} must be non-negative"));
    }
    Ok((api, cost))
}
