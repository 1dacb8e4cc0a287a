//! Shared test utilities for core module tests
//!
//! Provides common fixtures to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::config::{AppConfig, HostConfig, ProxyConfig};
use crate::core::chain::{ChainId, RuleSpec};
use crate::core::memory::MemoryRuleTable;
use crate::core::orchestrator::Orchestrator;
use crate::core::plan::Step;
use crate::core::rules::SYSTEMD_RESOLVE_GROUP;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("TPFW_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("TPFW_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Default proxy: TPROXY 7893, DNS 1053, fake-IP 198.18.0.0/16.
pub fn test_proxy() -> ProxyConfig {
    ProxyConfig::default()
}

/// Default host with two hijack targets, already validated (CIDR-normalised).
pub fn test_host() -> HostConfig {
    let mut config = AppConfig::default();
    config.host.hijack_dns = vec!["114.114.114.114".into(), "8.8.8.8".into()];
    config
        .validate()
        .expect("test host config is valid")
        .host
}

/// Orchestrator over `mem`; `resolve_group` decides whether systemd-resolve exists.
pub fn orchestrator(
    mem: &MemoryRuleTable,
    resolve_group: bool,
) -> Orchestrator<&MemoryRuleTable, impl Fn(&str) -> bool> {
    Orchestrator::with_group_probe(
        mem,
        test_proxy(),
        test_host(),
        move |name: &str| resolve_group && name == SYSTEMD_RESOLVE_GROUP,
    )
}

/// Rules appended to `chain` by `steps`, in step order.
pub fn appended(steps: &[Step], chain: ChainId) -> Vec<RuleSpec> {
    steps
        .iter()
        .filter_map(|step| match step {
            Step::Append { chain: c, rule } if *c == chain => Some(rule.clone()),
            _ => None,
        })
        .collect()
}
