//! Exercises the v0.1.0 subprocess ABI against a real shell-script provider.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use garm_config::{ProviderConfig, ProviderType};
use garm_provider::{ExternalProvider, Provider, ProviderError};
use garm_schemas::{BootstrapInstance, OsArch, OsType, ProviderInstanceStatus};
use uuid::Uuid;

const PROVIDER_SCRIPT: &str = r#"#!/bin/sh
case "$GARM_COMMAND" in
  CreateInstance)
    # Consume the bootstrap payload; echo identity back from the env.
    payload=$(cat)
    name=$(printf '%s' "$payload" | sed -n 's/.*"name":"\([^"]*\)".*/\1/p')
    printf '{"provider_id":"srv-%s","name":"%s","os_type":"linux","os_arch":"amd64","addresses":[{"address":"10.0.0.9","kind":"private"}],"status":"running"}' "$name" "$name"
    ;;
  GetInstance)
    printf '{"provider_id":"srv-%s","name":"%s","os_type":"linux","os_arch":"amd64","addresses":[],"status":"running"}' "$GARM_INSTANCE_ID" "$GARM_INSTANCE_ID"
    ;;
  DeleteInstance)
    echo "no such instance: $GARM_INSTANCE_ID" >&2
    exit 30
    ;;
  ListInstances)
    printf '[]'
    ;;
  StartInstance|StopInstance|RemoveAllInstances)
    ;;
  *)
    echo "unknown command $GARM_COMMAND" >&2
    exit 1
    ;;
esac
"#;

const SLOW_SCRIPT: &str = "#!/bin/sh\nsleep 30\n";

const FAILING_SCRIPT: &str = r#"#!/bin/sh
echo "quota exceeded" >&2
exit 7
"#;

fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn provider_for(script: PathBuf, dir: &tempfile::TempDir) -> ExternalProvider {
    let cfg = ProviderConfig {
        name: "script".into(),
        provider_type: ProviderType::External,
        description: String::new(),
        exec_path: script,
        config_file: dir.path().join("provider.toml"),
        environment: BTreeMap::new(),
        disable_jit_config: false,
        create_timeout_secs: 10,
        query_timeout_secs: 1,
    };
    ExternalProvider::from_config(&cfg, Uuid::new_v4())
}

fn bootstrap(name: &str) -> BootstrapInstance {
    BootstrapInstance {
        name: name.into(),
        tools: vec![],
        forge_url: "https://github.com/acme/svc".into(),
        callback_url: "https://garm/api/v1/callbacks".into(),
        metadata_url: "https://garm/api/v1/metadata".into(),
        instance_token: "secret".into(),
        ssh_keys: vec![],
        extra_specs: serde_json::json!({}),
        labels: vec!["self-hosted".into()],
        pool_id: Uuid::new_v4().to_string(),
        flavor: "default".into(),
        image: "ubuntu:22.04".into(),
        os_type: OsType::Linux,
        os_arch: OsArch::Amd64,
        runner_group: String::new(),
        ca_cert_bundle: None,
        jit_config_enabled: true,
    }
}

#[tokio::test]
async fn create_round_trips_identity_through_the_abi() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "provider.sh", PROVIDER_SCRIPT);
    let provider = provider_for(script, &dir);

    let result = provider.create_instance(&bootstrap("garm-e2e-1")).await.unwrap();
    assert_eq!(result.name, "garm-e2e-1");
    assert_eq!(result.provider_id, "srv-garm-e2e-1");
    assert_eq!(result.status, ProviderInstanceStatus::Running);
    assert_eq!(result.addresses.len(), 1);
}

#[tokio::test]
async fn get_passes_instance_id_env() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "provider.sh", PROVIDER_SCRIPT);
    let provider = provider_for(script, &dir);

    let result = provider.get_instance("garm-lookup").await.unwrap();
    assert_eq!(result.name, "garm-lookup");
}

#[tokio::test]
async fn exit_code_30_maps_to_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "provider.sh", PROVIDER_SCRIPT);
    let provider = provider_for(script, &dir);

    let err = provider.delete_instance("garm-gone").await.unwrap_err();
    assert!(err.is_not_found(), "got {err}");
}

#[tokio::test]
async fn other_exit_codes_are_fatal_with_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "failing.sh", FAILING_SCRIPT);
    let provider = provider_for(script, &dir);

    let err = provider.get_instance("x").await.unwrap_err();
    match err {
        ProviderError::Fatal(msg) => assert!(msg.contains("quota exceeded"), "got {msg}"),
        other => panic!("expected fatal, got {other}"),
    }
}

#[tokio::test]
async fn timeout_kills_the_subprocess() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "slow.sh", SLOW_SCRIPT);
    let provider = provider_for(script, &dir);

    let start = std::time::Instant::now();
    let err = provider.get_instance("x").await.unwrap_err();
    assert!(matches!(err, ProviderError::Timeout { .. }), "got {err}");
    // query_timeout_secs = 1; well under the script's 30s sleep.
    assert!(start.elapsed().as_secs() < 10);
}

#[tokio::test]
async fn list_returns_empty_array() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "provider.sh", PROVIDER_SCRIPT);
    let provider = provider_for(script, &dir);

    let result = provider.list_instances(Uuid::new_v4()).await.unwrap();
    assert!(result.is_empty());
}
