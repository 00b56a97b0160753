//! Wire contract with external provider executables (interface v0.1.0).
//!
//! These shapes cross a process boundary: `BootstrapInstance` is fed to the
//! provider on stdin for `CreateInstance`, `ProviderInstance` (or an array
//! of them) comes back on stdout. Field names are part of the ABI — change
//! them and every third-party provider binary breaks.

use serde::{Deserialize, Serialize};

use crate::{Address, OsArch, OsType};

// ---------------------------------------------------------------------------
// Tools manifest
// ---------------------------------------------------------------------------

/// One downloadable runner-agent build, as reported by the forge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerApplication {
    pub os: String,
    pub architecture: String,
    pub download_url: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256_checksum: Option<String>,
    /// Short-lived token for authenticated downloads (GHES).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_download_token: Option<String>,
}

// ---------------------------------------------------------------------------
// BootstrapInstance
// ---------------------------------------------------------------------------

/// Everything a provider needs to create one runner instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapInstance {
    pub name: String,
    pub tools: Vec<RunnerApplication>,
    /// Forge URL the runner registers against.
    #[serde(rename = "repo_url")]
    pub forge_url: String,
    /// Where the instance POSTs status updates.
    #[serde(rename = "callback-url")]
    pub callback_url: String,
    /// Where the instance fetches registration material.
    #[serde(rename = "metadata-url")]
    pub metadata_url: String,
    /// Short-lived bearer for the two URLs above.
    #[serde(rename = "instance-token")]
    pub instance_token: String,
    #[serde(rename = "ssh-keys", default)]
    pub ssh_keys: Vec<String>,
    /// Opaque provider-specific JSON from the pool's `extra_specs`.
    #[serde(rename = "extra-specs", default)]
    pub extra_specs: serde_json::Value,
    pub labels: Vec<String>,
    #[serde(rename = "pool-id")]
    pub pool_id: String,
    pub flavor: String,
    pub image: String,
    pub os_type: OsType,
    #[serde(rename = "arch")]
    pub os_arch: OsArch,
    #[serde(rename = "github-runner-group", default)]
    pub runner_group: String,
    #[serde(rename = "ca-cert-bundle", default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_bundle: Option<Vec<u8>>,
    /// When set, the runner uses the JIT files from the metadata endpoint
    /// instead of a registration token.
    #[serde(rename = "jit-configuration-enabled", default)]
    pub jit_config_enabled: bool,
}

// ---------------------------------------------------------------------------
// ProviderInstance
// ---------------------------------------------------------------------------

/// Provider-reported instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderInstanceStatus {
    Running,
    Stopped,
    Error,
    PendingCreate,
    PendingDelete,
    Unknown,
}

/// The provider's answer for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInstance {
    /// Provider-side identifier (server UUID, container name, ...).
    pub provider_id: String,
    pub name: String,
    pub os_type: OsType,
    #[serde(rename = "os_arch")]
    pub os_arch: OsArch,
    #[serde(default)]
    pub addresses: Vec<Address>,
    pub status: ProviderInstanceStatus,
    /// Diagnostic detail when `status == Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_fault: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AddressType;

    #[test]
    fn bootstrap_serializes_abi_field_names() {
        let b = BootstrapInstance {
            name: "garm-abc".into(),
            tools: vec![],
            forge_url: "https://github.com/acme/svc".into(),
            callback_url: "https://garm/api/v1/callbacks".into(),
            metadata_url: "https://garm/api/v1/metadata".into(),
            instance_token: "tok".into(),
            ssh_keys: vec![],
            extra_specs: serde_json::json!({"net": "br0"}),
            labels: vec!["self-hosted".into()],
            pool_id: "p1".into(),
            flavor: "default".into(),
            image: "ubuntu".into(),
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            runner_group: String::new(),
            ca_cert_bundle: None,
            jit_config_enabled: true,
        };
        let v = serde_json::to_value(&b).unwrap();
        assert!(v.get("callback-url").is_some());
        assert!(v.get("metadata-url").is_some());
        assert!(v.get("instance-token").is_some());
        assert!(v.get("pool-id").is_some());
        assert!(v.get("jit-configuration-enabled").is_some());
        assert_eq!(v["repo_url"], "https://github.com/acme/svc");
    }

    #[test]
    fn provider_instance_round_trips() {
        let p = ProviderInstance {
            provider_id: "srv-1".into(),
            name: "garm-abc".into(),
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            addresses: vec![Address {
                address: "10.0.0.4".into(),
                kind: AddressType::Private,
            }],
            status: ProviderInstanceStatus::Running,
            provider_fault: None,
        };
        let s = serde_json::to_string(&p).unwrap();
        let back: ProviderInstance = serde_json::from_str(&s).unwrap();
        assert_eq!(p, back);
    }
}
