//! The single choke-point for provider operations.
//!
//! Serialization contract:
//! - all operations on one instance name run through one mutex, so a create
//!   and a delete for the same instance can never interleave;
//! - different instances proceed concurrently, bounded by a process-wide
//!   semaphore (the provider subprocess pool);
//! - `delete_instance` maps provider *not found* to success — deletes are
//!   idempotent at this boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use garm_schemas::{BootstrapInstance, ProviderInstance};
use tokio::sync::Semaphore;
use tracing::warn;
use uuid::Uuid;

use crate::{Provider, ProviderError};

// ---------------------------------------------------------------------------
// Operation counters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct OpStats {
    ok: u64,
    err: u64,
}

/// Snapshot of one provider/operation counter pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationCount {
    pub provider: String,
    pub operation: &'static str,
    pub ok: u64,
    pub err: u64,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    providers: HashMap<String, Arc<dyn Provider>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    permits: Arc<Semaphore>,
    counters: Mutex<HashMap<(String, &'static str), OpStats>>,
}

impl Dispatcher {
    pub fn new(providers: Vec<Arc<dyn Provider>>, max_concurrent_ops: usize) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        Self {
            providers,
            locks: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent_ops.max(1))),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::Config(format!("no provider named {name}")))
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    fn instance_lock(&self, instance_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(instance_name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry for an instance that no longer exists anywhere.
    pub fn forget_instance(&self, instance_name: &str) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance_name);
    }

    fn record(&self, provider: &str, operation: &'static str, ok: bool) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let stats = counters
            .entry((provider.to_string(), operation))
            .or_default();
        if ok {
            stats.ok += 1;
        } else {
            stats.err += 1;
        }
    }

    pub fn op_counts(&self) -> Vec<OperationCount> {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = counters
            .iter()
            .map(|((provider, operation), stats)| OperationCount {
                provider: provider.clone(),
                operation,
                ok: stats.ok,
                err: stats.err,
            })
            .collect();
        out.sort_by(|a, b| (&a.provider, a.operation).cmp(&(&b.provider, b.operation)));
        out
    }

    // -- operations ---------------------------------------------------------

    /// Create one instance. The caller must be the sole creator of this
    /// instance name — duplicate creates produce duplicate provider
    /// resources.
    pub async fn create_instance(
        &self,
        provider_name: &str,
        bootstrap: &BootstrapInstance,
    ) -> Result<ProviderInstance, ProviderError> {
        let provider = self.provider(provider_name)?;
        let lock = self.instance_lock(&bootstrap.name);
        let _serial = lock.lock().await;
        let _permit = self.permits.acquire().await.map_err(|_| {
            ProviderError::Transient("provider worker pool is shut down".to_string())
        })?;
        let result = provider.create_instance(bootstrap).await;
        self.record(provider_name, "CreateInstance", result.is_ok());
        result
    }

    /// Delete an instance; *not found* at the provider is success.
    pub async fn delete_instance(
        &self,
        provider_name: &str,
        instance_name: &str,
    ) -> Result<(), ProviderError> {
        let provider = self.provider(provider_name)?;
        let lock = self.instance_lock(instance_name);
        let _serial = lock.lock().await;
        let _permit = self.permits.acquire().await.map_err(|_| {
            ProviderError::Transient("provider worker pool is shut down".to_string())
        })?;
        let result = match provider.delete_instance(instance_name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(instance = instance_name, "delete: instance already gone");
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.record(provider_name, "DeleteInstance", result.is_ok());
        result
    }

    pub async fn get_instance(
        &self,
        provider_name: &str,
        instance_name: &str,
    ) -> Result<ProviderInstance, ProviderError> {
        let provider = self.provider(provider_name)?;
        let lock = self.instance_lock(instance_name);
        let _serial = lock.lock().await;
        let _permit = self.permits.acquire().await.map_err(|_| {
            ProviderError::Transient("provider worker pool is shut down".to_string())
        })?;
        let result = provider.get_instance(instance_name).await;
        self.record(provider_name, "GetInstance", result.is_ok());
        result
    }

    pub async fn list_instances(
        &self,
        provider_name: &str,
        pool_id: Uuid,
    ) -> Result<Vec<ProviderInstance>, ProviderError> {
        let provider = self.provider(provider_name)?;
        let _permit = self.permits.acquire().await.map_err(|_| {
            ProviderError::Transient("provider worker pool is shut down".to_string())
        })?;
        let result = provider.list_instances(pool_id).await;
        self.record(provider_name, "ListInstances", result.is_ok());
        result
    }

    pub async fn remove_all_instances(
        &self,
        provider_name: &str,
        pool_id: Uuid,
    ) -> Result<(), ProviderError> {
        let provider = self.provider(provider_name)?;
        let _permit = self.permits.acquire().await.map_err(|_| {
            ProviderError::Transient("provider worker pool is shut down".to_string())
        })?;
        let result = provider.remove_all_instances(pool_id).await;
        self.record(provider_name, "RemoveAllInstances", result.is_ok());
        result
    }

    pub async fn start_instance(
        &self,
        provider_name: &str,
        instance_name: &str,
    ) -> Result<(), ProviderError> {
        let provider = self.provider(provider_name)?;
        let lock = self.instance_lock(instance_name);
        let _serial = lock.lock().await;
        let result = provider.start_instance(instance_name).await;
        self.record(provider_name, "StartInstance", result.is_ok());
        result
    }

    pub async fn stop_instance(
        &self,
        provider_name: &str,
        instance_name: &str,
    ) -> Result<(), ProviderError> {
        let provider = self.provider(provider_name)?;
        let lock = self.instance_lock(instance_name);
        let _serial = lock.lock().await;
        let result = provider.stop_instance(instance_name).await;
        self.record(provider_name, "StopInstance", result.is_ok());
        result
    }

    pub fn jit_disabled(&self, provider_name: &str) -> bool {
        self.providers
            .get(provider_name)
            .map(|p| p.disable_jit_config())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use garm_schemas::{OsArch, OsType, ProviderInstanceStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SlowProvider {
        in_flight: AtomicUsize,
        max_observed: AtomicUsize,
        fail_delete_not_found: bool,
    }

    impl SlowProvider {
        fn new(fail_delete_not_found: bool) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_observed: AtomicUsize::new(0),
                fail_delete_not_found,
            }
        }
    }

    #[async_trait]
    impl Provider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn create_instance(
            &self,
            bootstrap: &BootstrapInstance,
        ) -> Result<ProviderInstance, ProviderError> {
            // Track concurrency across the sleep so interleaved calls for
            // the same instance would be observable.
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ProviderInstance {
                provider_id: format!("prov-{}", bootstrap.name),
                name: bootstrap.name.clone(),
                os_type: OsType::Linux,
                os_arch: OsArch::Amd64,
                addresses: vec![],
                status: ProviderInstanceStatus::Running,
                provider_fault: None,
            })
        }

        async fn get_instance(
            &self,
            instance_name: &str,
        ) -> Result<ProviderInstance, ProviderError> {
            Err(ProviderError::NotFound(instance_name.to_string()))
        }

        async fn delete_instance(&self, instance_name: &str) -> Result<(), ProviderError> {
            if self.fail_delete_not_found {
                Err(ProviderError::NotFound(instance_name.to_string()))
            } else {
                Ok(())
            }
        }

        async fn list_instances(
            &self,
            _pool_id: Uuid,
        ) -> Result<Vec<ProviderInstance>, ProviderError> {
            Ok(vec![])
        }

        async fn remove_all_instances(&self, _pool_id: Uuid) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn start_instance(&self, _instance_name: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn stop_instance(&self, _instance_name: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn bootstrap(name: &str) -> BootstrapInstance {
        BootstrapInstance {
            name: name.into(),
            tools: vec![],
            forge_url: "https://github.com/acme/svc".into(),
            callback_url: "https://garm/api/v1/callbacks".into(),
            metadata_url: "https://garm/api/v1/metadata".into(),
            instance_token: "t".into(),
            ssh_keys: vec![],
            extra_specs: serde_json::json!({}),
            labels: vec![],
            pool_id: Uuid::new_v4().to_string(),
            flavor: "default".into(),
            image: "ubuntu".into(),
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            runner_group: String::new(),
            ca_cert_bundle: None,
            jit_config_enabled: false,
        }
    }

    #[tokio::test]
    async fn delete_not_found_is_success() {
        let d = Dispatcher::new(vec![Arc::new(SlowProvider::new(true)) as Arc<dyn Provider>], 4);
        d.delete_instance("slow", "gone").await.unwrap();
        let counts = d.op_counts();
        let delete = counts
            .iter()
            .find(|c| c.operation == "DeleteInstance")
            .unwrap();
        assert_eq!(delete.ok, 1);
        assert_eq!(delete.err, 0);
    }

    #[tokio::test]
    async fn unknown_provider_is_config_error() {
        let d = Dispatcher::new(vec![], 4);
        let err = d.delete_instance("nope", "x").await.unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }

    #[tokio::test]
    async fn same_instance_ops_are_serialized() {
        let provider = Arc::new(SlowProvider::new(false));
        let d = Arc::new(Dispatcher::new(
            vec![Arc::clone(&provider) as Arc<dyn Provider>],
            16,
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let d = Arc::clone(&d);
            handles.push(tokio::spawn(async move {
                d.create_instance("slow", &bootstrap("same-name")).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        // The per-instance mutex keeps the tracked section at one.
        assert_eq!(provider.max_observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn counters_accumulate() {
        let d = Dispatcher::new(vec![Arc::new(SlowProvider::new(false)) as Arc<dyn Provider>], 4);
        d.create_instance("slow", &bootstrap("a")).await.unwrap();
        d.create_instance("slow", &bootstrap("b")).await.unwrap();
        let counts = d.op_counts();
        let create = counts
            .iter()
            .find(|c| c.operation == "CreateInstance")
            .unwrap();
        assert_eq!(create.ok, 2);
    }
}
