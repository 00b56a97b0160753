//! Deterministic in-memory provider.
//!
//! Design decisions (kept intentionally simple/deterministic):
//! - `provider_id` is exactly `"mock-" + instance name`;
//! - addresses are assigned sequentially from 10.1.1.0/24;
//! - failures are scripted: `fail_next_creates(n)` makes the next `n`
//!   creates exit with a fatal provider error;
//! - no randomness, no timestamps.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use garm_provider::{Provider, ProviderError};
use garm_schemas::{
    Address, AddressType, BootstrapInstance, ProviderInstance, ProviderInstanceStatus,
};
use uuid::Uuid;

#[derive(Default)]
struct MockState {
    /// name -> (owning pool id, instance, bootstrap it was created from)
    instances: BTreeMap<String, (String, ProviderInstance)>,
    bootstraps: BTreeMap<String, BootstrapInstance>,
    fail_next_creates: u32,
    create_calls: u32,
    delete_calls: u32,
    next_ip: u8,
}

pub struct MockProvider {
    name: String,
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Script the next `n` creates to fail fatally.
    pub fn fail_next_creates(&self, n: u32) {
        self.state.lock().unwrap().fail_next_creates = n;
    }

    pub fn create_calls(&self) -> u32 {
        self.state.lock().unwrap().create_calls
    }

    pub fn delete_calls(&self) -> u32 {
        self.state.lock().unwrap().delete_calls
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    pub fn has_instance(&self, name: &str) -> bool {
        self.state.lock().unwrap().instances.contains_key(name)
    }

    /// The bootstrap descriptor a given instance was created from.
    pub fn bootstrap_for(&self, name: &str) -> Option<BootstrapInstance> {
        self.state.lock().unwrap().bootstraps.get(name).cloned()
    }

    /// Plant an instance the store knows nothing about (a crashed create).
    pub fn inject_orphan(&self, pool_id: Uuid, name: &str) {
        let mut state = self.state.lock().unwrap();
        let instance = ProviderInstance {
            provider_id: format!("mock-{name}"),
            name: name.to_string(),
            os_type: garm_schemas::OsType::Linux,
            os_arch: garm_schemas::OsArch::Amd64,
            addresses: vec![],
            status: ProviderInstanceStatus::Running,
            provider_fault: None,
        };
        state
            .instances
            .insert(name.to_string(), (pool_id.to_string(), instance));
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_instance(
        &self,
        bootstrap: &BootstrapInstance,
    ) -> Result<ProviderInstance, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        if state.fail_next_creates > 0 {
            state.fail_next_creates -= 1;
            return Err(ProviderError::Fatal("mock: scripted create failure".into()));
        }
        state.next_ip = state.next_ip.wrapping_add(1);
        let instance = ProviderInstance {
            provider_id: format!("mock-{}", bootstrap.name),
            name: bootstrap.name.clone(),
            os_type: bootstrap.os_type,
            os_arch: bootstrap.os_arch,
            addresses: vec![Address {
                address: format!("10.1.1.{}", state.next_ip),
                kind: AddressType::Private,
            }],
            status: ProviderInstanceStatus::Running,
            provider_fault: None,
        };
        state.instances.insert(
            bootstrap.name.clone(),
            (bootstrap.pool_id.clone(), instance.clone()),
        );
        state
            .bootstraps
            .insert(bootstrap.name.clone(), bootstrap.clone());
        Ok(instance)
    }

    async fn get_instance(&self, instance_name: &str) -> Result<ProviderInstance, ProviderError> {
        self.state
            .lock()
            .unwrap()
            .instances
            .get(instance_name)
            .map(|(_, i)| i.clone())
            .ok_or_else(|| ProviderError::NotFound(instance_name.to_string()))
    }

    async fn delete_instance(&self, instance_name: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.delete_calls += 1;
        match state.instances.remove(instance_name) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound(instance_name.to_string())),
        }
    }

    async fn list_instances(&self, pool_id: Uuid) -> Result<Vec<ProviderInstance>, ProviderError> {
        let key = pool_id.to_string();
        Ok(self
            .state
            .lock()
            .unwrap()
            .instances
            .values()
            .filter(|(pool, _)| *pool == key)
            .map(|(_, i)| i.clone())
            .collect())
    }

    async fn remove_all_instances(&self, pool_id: Uuid) -> Result<(), ProviderError> {
        let key = pool_id.to_string();
        self.state
            .lock()
            .unwrap()
            .instances
            .retain(|_, (pool, _)| *pool != key);
        Ok(())
    }

    async fn start_instance(&self, _instance_name: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn stop_instance(&self, _instance_name: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}
