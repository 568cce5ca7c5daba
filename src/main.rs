//! Zombie Scan - settings check
//!
//! Resolves flags, environment and config file into the effective governor
//! configuration and prints it together with the categories each provider
//! scan will run. Exits non-zero on invalid settings.

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lornu_zombie_scan::scan::{canonical_categories, CloudProvider, ScanSettings};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .json()
        .init();

    let settings = ScanSettings::parse();
    let config = settings.governor_config()?;

    info!(
        enabled = config.enabled,
        enforce = config.enforce,
        budgets = config.daily_budgets.len(),
        plugin_timeout_secs = ?settings.plugin_timeout().map(|t| t.as_secs()),
        "Resolved scan settings"
    );

    let categories: serde_json::Map<String, serde_json::Value> =
        [CloudProvider::Aws, CloudProvider::Azure, CloudProvider::Gcp]
            .into_iter()
            .map(|provider| (provider.to_string(), json!(canonical_categories(provider))))
            .collect();

    let plan = json!({
        "governor": config,
        "plugin_timeout_secs": settings.plugin_timeout().map(|t| t.as_secs()),
        "categories": categories,
    });

    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}
