//! Typed configuration consumed by the controller at boot.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_MIN_JOB_AGE_BACKOFF_SECS: u64 = 30;
pub const DEFAULT_POOL_TICK_SECS: u64 = 30;
pub const DEFAULT_RECONCILE_INTERVAL_MINS: u64 = 10;
pub const DEFAULT_MAX_CONCURRENT_PROVIDER_OPS: usize = 100;
pub const DEFAULT_CREATE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FORGE_CALL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_LONG_POLL_SECS: u64 = 50;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 20;

fn d_min_job_age() -> u64 {
    DEFAULT_MIN_JOB_AGE_BACKOFF_SECS
}
fn d_pool_tick() -> u64 {
    DEFAULT_POOL_TICK_SECS
}
fn d_reconcile() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_MINS
}
fn d_max_ops() -> usize {
    DEFAULT_MAX_CONCURRENT_PROVIDER_OPS
}
fn d_create_timeout() -> u64 {
    DEFAULT_CREATE_TIMEOUT_SECS
}
fn d_query_timeout() -> u64 {
    DEFAULT_QUERY_TIMEOUT_SECS
}
fn d_shutdown_grace() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

// ---------------------------------------------------------------------------
// Controller section
// ---------------------------------------------------------------------------

/// Controller-facing URLs and scheduling knobs. The URL set is mutable at
/// runtime through the controller context; these are the boot values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Where instances fetch registration material.
    pub metadata_url: String,
    /// Where instances POST status updates.
    pub callback_url: String,
    /// Webhook target installed at the forge.
    pub webhook_url: String,
    #[serde(default)]
    pub agent_url: Option<String>,
    #[serde(default)]
    pub garm_tools_url: Option<String>,
    /// Jobs younger than this are left for an existing idle runner.
    #[serde(default = "d_min_job_age")]
    pub minimum_job_age_backoff_secs: u64,
}

// ---------------------------------------------------------------------------
// Provider section
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// Subprocess provider speaking interface v0.1.0.
    External,
}

/// One configured IaaS provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub provider_type: ProviderType,
    pub description: String,
    /// Provider executable, invoked once per operation.
    pub exec_path: PathBuf,
    /// Opaque provider config handed over via `GARM_PROVIDER_CONFIG_FILE`.
    pub config_file: PathBuf,
    /// Extra environment for the subprocess.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Skip JIT config even when the forge supports it.
    #[serde(default)]
    pub disable_jit_config: bool,
    #[serde(default = "d_create_timeout")]
    pub create_timeout_secs: u64,
    #[serde(default = "d_query_timeout")]
    pub query_timeout_secs: u64,
}

impl ProviderConfig {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Daemon / scheduling sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the intake surface, e.g. `127.0.0.1:9997`.
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:9997".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default = "d_pool_tick")]
    pub pool_tick_secs: u64,
    #[serde(default = "d_reconcile")]
    pub reconcile_interval_mins: u64,
    #[serde(default = "d_max_ops")]
    pub max_concurrent_provider_ops: usize,
    #[serde(default = "d_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            pool_tick_secs: DEFAULT_POOL_TICK_SECS,
            reconcile_interval_mins: DEFAULT_RECONCILE_INTERVAL_MINS,
            max_concurrent_provider_ops: DEFAULT_MAX_CONCURRENT_PROVIDER_OPS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

// ---------------------------------------------------------------------------
// GarmConfig
// ---------------------------------------------------------------------------

/// The full controller configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GarmConfig {
    pub controller: ControllerConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl GarmConfig {
    pub fn validate(&self) -> Result<()> {
        for url in [
            &self.controller.metadata_url,
            &self.controller.callback_url,
            &self.controller.webhook_url,
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("controller URL is not absolute: {url}");
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for p in &self.providers {
            if !seen.insert(p.name.as_str()) {
                bail!("duplicate provider name: {}", p.name);
            }
            if p.name.is_empty() {
                bail!("provider name must not be empty");
            }
        }
        if self.scheduling.max_concurrent_provider_ops == 0 {
            bail!("max_concurrent_provider_ops must be at least 1");
        }
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn minimum_job_age_backoff(&self) -> Duration {
        Duration::from_secs(self.controller.minimum_job_age_backoff_secs)
    }

    pub fn pool_tick(&self) -> Duration {
        Duration::from_secs(self.scheduling.pool_tick_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.scheduling.reconcile_interval_mins * 60)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.scheduling.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> GarmConfig {
        serde_json::from_value(serde_json::json!({
            "controller": {
                "metadata_url": "https://garm.example/api/v1/metadata",
                "callback_url": "https://garm.example/api/v1/callbacks",
                "webhook_url": "https://garm.example/webhooks"
            }
        }))
        .unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = minimal();
        assert_eq!(
            cfg.controller.minimum_job_age_backoff_secs,
            DEFAULT_MIN_JOB_AGE_BACKOFF_SECS
        );
        assert_eq!(cfg.scheduling.pool_tick_secs, DEFAULT_POOL_TICK_SECS);
        assert_eq!(
            cfg.scheduling.max_concurrent_provider_ops,
            DEFAULT_MAX_CONCURRENT_PROVIDER_OPS
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn relative_controller_url_is_rejected() {
        let mut cfg = minimal();
        cfg.controller.webhook_url = "garm.example/webhooks".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_provider_names_rejected() {
        let mut cfg = minimal();
        let p = ProviderConfig {
            name: "lxd".into(),
            provider_type: ProviderType::External,
            description: String::new(),
            exec_path: "/usr/bin/true".into(),
            config_file: "/etc/garm/lxd.toml".into(),
            environment: BTreeMap::new(),
            disable_jit_config: false,
            create_timeout_secs: DEFAULT_CREATE_TIMEOUT_SECS,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
        };
        cfg.providers = vec![p.clone(), p];
        assert!(cfg.validate().is_err());
    }
}
