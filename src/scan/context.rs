//! Ambient Scan Identity
//!
//! Carries the tenant/provider/connection/region/plugin identity of the
//! current scan through arbitrarily deep call chains (plugin code, SDK
//! wrappers, the guarded proxy) without threading it through every call.
//!
//! The value lives in tokio task-local storage, so concurrently running
//! scans never observe each other's identity. Tasks spawned from inside a
//! scope do not inherit it; the orchestrator sets it explicitly for each
//! plugin task.

use serde::{Deserialize, Serialize};
use std::future::Future;

tokio::task_local! {
    static SCAN_CONTEXT: ScanContext;
}

/// Identity of one scan call chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanContext {
    pub tenant_id: String,
    pub provider: String,
    pub connection_id: String,
    pub region: String,
    pub plugin: String,
}

impl ScanContext {
    pub fn new(
        tenant_id: impl Into<String>,
        provider: impl Into<String>,
        connection_id: impl Into<String>,
        region: impl Into<String>,
        plugin: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            provider: provider.into(),
            connection_id: connection_id.into(),
            region: region.into(),
            plugin: plugin.into(),
        }
    }

    /// Same identity, different plugin
    pub fn for_plugin(&self, plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            ..self.clone()
        }
    }
}

/// Run `body` with `context` visible to every nested call in this task.
///
/// The previous context (or its absence) is restored when `body` completes,
/// panics, or is dropped.
pub async fn with_scan_context<F>(context: ScanContext, body: F) -> F::Output
where
    F: Future,
{
    SCAN_CONTEXT.scope(context, body).await
}

/// Synchronous counterpart of [`with_scan_context`].
pub fn sync_scope<R>(context: ScanContext, body: impl FnOnce() -> R) -> R {
    SCAN_CONTEXT.sync_scope(context, body)
}

/// Context of the enclosing scan, if any.
pub fn current_scan_context() -> Option<ScanContext> {
    SCAN_CONTEXT.try_with(ScanContext::clone).ok()
}
