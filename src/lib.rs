//! Lornu AI Zombie Scan Library
//!
//! Budget-governed, multi-provider orchestration of idle resource detectors.

pub mod scan;

pub use scan::{BudgetGovernor, GuardedClientProxy, PluginRegistry, ScanContext, ScanOrchestrator};
