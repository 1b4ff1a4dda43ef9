//! ---
//! ota_section: "03-update-orchestration"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Prometheus instrumentation for the update manager."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{IntCounter, Opts, Registry};

/// Shared registry type used across the agent.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Counters maintained by the update manager.
#[derive(Debug, Clone)]
pub struct ManagerMetrics {
    checks: IntCounter,
    updates_found: IntCounter,
    installs_started: IntCounter,
    install_failures: IntCounter,
}

impl ManagerMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self, prometheus::Error> {
        let checks = IntCounter::with_opts(Opts::new(
            "otad_update_checks_total",
            "Update resolutions attempted",
        ))?;
        let updates_found = IntCounter::with_opts(Opts::new(
            "otad_updates_found_total",
            "Update resolutions that produced an installable update",
        ))?;
        let installs_started = IntCounter::with_opts(Opts::new(
            "otad_installs_started_total",
            "Bundle installations handed to the update backend",
        ))?;
        let install_failures = IntCounter::with_opts(Opts::new(
            "otad_install_failures_total",
            "Bundle installations the update backend reported as failed",
        ))?;
        registry.register(Box::new(checks.clone()))?;
        registry.register(Box::new(updates_found.clone()))?;
        registry.register(Box::new(installs_started.clone()))?;
        registry.register(Box::new(install_failures.clone()))?;
        Ok(Self {
            checks,
            updates_found,
            installs_started,
            install_failures,
        })
    }

    pub fn inc_check(&self) {
        self.checks.inc();
    }

    pub fn inc_update_found(&self) {
        self.updates_found.inc();
    }

    pub fn inc_install_started(&self) {
        self.installs_started.inc();
    }

    pub fn inc_install_failure(&self) {
        self.install_failures.inc();
    }
}
