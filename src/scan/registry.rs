//! Scanner Plugin Registry
//!
//! Maps a provider key to the ordered list of detection plugins for that
//! provider. The registry is assembled once at startup through
//! [`PluginRegistryBuilder`] and frozen by [`PluginRegistryBuilder::build`];
//! the frozen [`PluginRegistry`] has no mutation API and is shared behind an
//! `Arc` for the lifetime of the process.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use super::types::{Finding, ScanError, ScanRequest};

/// A detection routine for one resource category on one provider
#[async_trait]
pub trait ScanPlugin: Send + Sync {
    /// Stable category key used to aggregate findings
    fn category_key(&self) -> &str;

    /// Scan for idle resources
    async fn scan(&self, request: &ScanRequest) -> Result<Vec<Finding>>;
}

/// Shared plugin handle
pub type PluginHandle = Arc<dyn ScanPlugin>;

fn normalize_provider(provider: &str) -> String {
    provider.trim().to_ascii_lowercase()
}

/// Registers plugins for one provider during bootstrap
pub struct ProviderRegistrar<'a> {
    provider: String,
    plugins: &'a mut Vec<PluginHandle>,
}

impl ProviderRegistrar<'_> {
    /// Register `plugin`, returning the same instance
    pub fn register<P: ScanPlugin + 'static>(&mut self, plugin: P) -> Arc<P> {
        self.register_arc(Arc::new(plugin))
    }

    /// Register an already shared plugin, returning it unchanged
    pub fn register_arc<P: ScanPlugin + 'static>(&mut self, plugin: Arc<P>) -> Arc<P> {
        if self
            .plugins
            .iter()
            .any(|existing| existing.category_key() == plugin.category_key())
        {
            warn!(
                provider = %self.provider,
                category = %plugin.category_key(),
                "Plugin category registered twice"
            );
        }
        self.plugins.push(plugin.clone() as PluginHandle);
        plugin
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }
}

/// Startup-time registry assembly
#[derive(Default)]
pub struct PluginRegistryBuilder {
    plugins: BTreeMap<String, Vec<PluginHandle>>,
    loaded: HashSet<String>,
}

impl PluginRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one plugin under `provider`, returning the same instance
    pub fn register<P: ScanPlugin + 'static>(&mut self, provider: &str, plugin: P) -> Arc<P> {
        let provider = normalize_provider(provider);
        let plugins = self.plugins.entry(provider.clone()).or_default();
        ProviderRegistrar { provider, plugins }.register(plugin)
    }

    /// Explicit bootstrap step: run `loader` to register every plugin of
    /// `provider`. Loading the same provider twice is an error.
    pub fn load_plugins_for_provider<F>(&mut self, provider: &str, loader: F) -> Result<&mut Self, ScanError>
    where
        F: FnOnce(&mut ProviderRegistrar<'_>),
    {
        let provider = normalize_provider(provider);
        if !self.loaded.insert(provider.clone()) {
            return Err(ScanError::Registry(format!(
                "plugins for provider {provider} already loaded"
            )));
        }

        let plugins = self.plugins.entry(provider.clone()).or_default();
        let before = plugins.len();
        let mut registrar = ProviderRegistrar {
            provider: provider.clone(),
            plugins,
        };
        loader(&mut registrar);

        info!(
            provider = %provider,
            plugins = registrar.plugins.len() - before,
            "Loaded scan plugins"
        );
        Ok(self)
    }

    /// Freeze the registry
    pub fn build(self) -> PluginRegistry {
        PluginRegistry {
            plugins: self.plugins,
        }
    }
}

/// Read-only provider → plugins map
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Vec<PluginHandle>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let summary: BTreeMap<&str, Vec<&str>> = self
            .plugins
            .iter()
            .map(|(provider, plugins)| {
                (
                    provider.as_str(),
                    plugins.iter().map(|p| p.category_key()).collect(),
                )
            })
            .collect();
        f.debug_struct("PluginRegistry").field("plugins", &summary).finish()
    }
}

impl PluginRegistry {
    pub fn builder() -> PluginRegistryBuilder {
        PluginRegistryBuilder::new()
    }

    /// Plugins for `provider` in registration order
    pub fn plugins_for_provider(&self, provider: &str) -> &[PluginHandle] {
        self.plugins
            .get(&normalize_provider(provider))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    /// Total number of registered plugins
    pub fn len(&self) -> usize {
        self.plugins.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedPlugin(&'static str);

    #[async_trait]
    impl ScanPlugin for NamedPlugin {
        fn category_key(&self) -> &str {
            self.0
        }

        async fn scan(&self, _request: &ScanRequest) -> Result<Vec<Finding>> {
            Ok(Vec::new())
        }
    }

    fn keys(plugins: &[PluginHandle]) -> Vec<&str> {
        plugins.iter().map(|p| p.category_key()).collect()
    }

    #[test]
    fn test_registration_order_and_case_normalization() {
        let mut builder = PluginRegistry::builder();
        builder
            .load_plugins_for_provider("AWS", |r| {
                r.register(NamedPlugin("unattached_volumes"));
                r.register(NamedPlugin("idle_nat_gateways"));
                r.register(NamedPlugin("stopped_instances"));
            })
            .unwrap();
        let registry = builder.build();

        assert_eq!(
            keys(registry.plugins_for_provider(" aws ")),
            vec!["unattached_volumes", "idle_nat_gateways", "stopped_instances"]
        );
        assert_eq!(registry.providers().collect::<Vec<_>>(), vec!["aws"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_register_returns_same_instance() {
        let mut builder = PluginRegistry::builder();
        let plugin = builder.register("gcp", NamedPlugin("idle_static_ips"));
        let registry = builder.build();

        let stored = &registry.plugins_for_provider("gcp")[0];
        assert!(std::ptr::eq(
            Arc::as_ptr(stored) as *const u8,
            Arc::as_ptr(&plugin) as *const u8
        ));
    }

    #[test]
    fn test_double_registration_is_kept() {
        let mut builder = PluginRegistry::builder();
        builder.register("azure", NamedPlugin("idle_disks"));
        builder.register("azure", NamedPlugin("idle_disks"));

        assert_eq!(builder.build().plugins_for_provider("azure").len(), 2);
    }

    #[test]
    fn test_provider_loaded_once() {
        let mut builder = PluginRegistry::builder();
        builder.load_plugins_for_provider("aws", |_| {}).unwrap();

        let err = builder.load_plugins_for_provider("Aws", |_| {}).err().unwrap();
        assert!(matches!(err, ScanError::Registry(_)));
    }

    #[test]
    fn test_unknown_provider_is_empty() {
        let registry = PluginRegistry::builder().build();
        assert!(registry.plugins_for_provider("oracle").is_empty());
        assert!(registry.is_empty());
    }
}
