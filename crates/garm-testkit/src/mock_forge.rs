//! Deterministic mock forge.
//!
//! One shared [`ForgeState`] models the forge side: registered runners, the
//! currently valid credential token, and scripted failures. Clients capture
//! the token they were built with, so rotating `valid_token` makes stale
//! clients fail with an auth error until the factory rebuilds them — the
//! same observable behavior as a revoked PAT.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use garm_forge::{
    ForgeClient, ForgeClientProvider, ForgeError, ForgeRunner, HookInfo, RegistrationToken,
};
use garm_schemas::{ForgeCredentials, ForgeEntity, RunnerApplication, WorkflowJob};
use uuid::Uuid;

#[derive(Default, Debug)]
pub struct ForgeState {
    /// agent id -> runner record
    pub runners: BTreeMap<i64, ForgeRunner>,
    next_agent_id: i64,
    pub removed_runners: Vec<i64>,
    /// The token the forge currently accepts.
    pub valid_token: String,
    /// Fail the next N calls transiently (any client).
    pub fail_transient: u32,
    pub registration_tokens_issued: u32,
    pub hooks: Vec<HookInfo>,
    /// Jobs the forge reports as queued (webhook-recovery path).
    pub queued_jobs: Vec<WorkflowJob>,
}

impl ForgeState {
    pub fn new(valid_token: impl Into<String>) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            valid_token: valid_token.into(),
            ..Self::default()
        }))
    }

    /// Register a runner directly (models a human-configured or orphaned
    /// runner).
    pub fn add_runner(&mut self, name: &str, labels: Vec<String>) -> i64 {
        self.next_agent_id += 1;
        let id = self.next_agent_id;
        self.runners.insert(
            id,
            ForgeRunner {
                id,
                name: name.to_string(),
                os: Some("linux".into()),
                status: "online".into(),
                busy: false,
                labels,
            },
        );
        id
    }
}

#[derive(Debug)]
pub struct MockForgeClient {
    entity: ForgeEntity,
    /// Token captured at build time; stale after rotation.
    token: String,
    state: Arc<Mutex<ForgeState>>,
}

impl MockForgeClient {
    fn check(&self) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_transient > 0 {
            state.fail_transient -= 1;
            return Err(ForgeError::Transient("mock: scripted 502".into()));
        }
        if state.valid_token != self.token {
            return Err(ForgeError::Auth("mock: 401 bad credentials".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ForgeClient for MockForgeClient {
    fn entity(&self) -> &ForgeEntity {
        &self.entity
    }

    fn forge_url(&self) -> String {
        format!("https://mock.forge/{}", self.entity.forge_path())
    }

    async fn get_registration_token(&self) -> Result<RegistrationToken, ForgeError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.registration_tokens_issued += 1;
        Ok(RegistrationToken {
            token: format!("reg-token-{}", state.registration_tokens_issued),
            expires_at: None,
        })
    }

    async fn get_jit_config(
        &self,
        runner_name: &str,
        labels: &[String],
        _runner_group: &str,
    ) -> Result<(BTreeMap<String, String>, ForgeRunner), ForgeError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let id = state.add_runner(runner_name, labels.to_vec());
        let runner = state.runners[&id].clone();
        let mut files = BTreeMap::new();
        files.insert(
            "runner".to_string(),
            base64::engine::general_purpose::STANDARD.encode(format!("jit-config-{runner_name}")),
        );
        Ok((files, runner))
    }

    async fn list_runner_applications(&self) -> Result<Vec<RunnerApplication>, ForgeError> {
        self.check()?;
        Ok(vec![RunnerApplication {
            os: "linux".into(),
            architecture: "x64".into(),
            download_url: "https://mock.forge/runner.tgz".into(),
            filename: "runner.tgz".into(),
            sha256_checksum: Some("deadbeef".into()),
            temp_download_token: None,
        }])
    }

    async fn list_runners(&self) -> Result<Vec<ForgeRunner>, ForgeError> {
        self.check()?;
        Ok(self.state.lock().unwrap().runners.values().cloned().collect())
    }

    async fn list_queued_jobs(&self) -> Result<Vec<WorkflowJob>, ForgeError> {
        self.check()?;
        Ok(self.state.lock().unwrap().queued_jobs.clone())
    }

    async fn remove_runner(&self, agent_id: i64) -> Result<(), ForgeError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        match state.runners.remove(&agent_id) {
            Some(_) => {
                state.removed_runners.push(agent_id);
                Ok(())
            }
            None => Err(ForgeError::NotFound(format!("runner {agent_id}"))),
        }
    }

    async fn install_webhook(&self, url: &str, _secret: &str) -> Result<HookInfo, ForgeError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let hook = HookInfo {
            id: state.hooks.len() as i64 + 1,
            url: url.to_string(),
            active: true,
            events: vec!["workflow_job".into()],
        };
        state.hooks.push(hook.clone());
        Ok(hook)
    }

    async fn uninstall_webhook(&self, hook_id: i64) -> Result<(), ForgeError> {
        self.check()?;
        self.state.lock().unwrap().hooks.retain(|h| h.id != hook_id);
        Ok(())
    }

    async fn get_webhook(&self, target_url: &str) -> Result<Option<HookInfo>, ForgeError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .hooks
            .iter()
            .find(|h| h.url == target_url)
            .cloned())
    }

    async fn ping(&self) -> Result<(), ForgeError> {
        self.check()
    }
}

/// Factory with the same cache/invalidate contract as the HTTP one.
pub struct MockForgeFactory {
    pub state: Arc<Mutex<ForgeState>>,
    built: Mutex<HashMap<(Uuid, String), Arc<dyn ForgeClient>>>,
    pub build_count: AtomicUsize,
}

impl MockForgeFactory {
    pub fn new(state: Arc<Mutex<ForgeState>>) -> Arc<Self> {
        Arc::new(Self {
            state,
            built: Mutex::new(HashMap::new()),
            build_count: AtomicUsize::new(0),
        })
    }

    pub fn builds(&self) -> usize {
        self.build_count.load(Ordering::SeqCst)
    }
}

impl ForgeClientProvider for MockForgeFactory {
    fn client_for(
        &self,
        entity: &ForgeEntity,
        creds: &ForgeCredentials,
    ) -> Result<Arc<dyn ForgeClient>, ForgeError> {
        let key = (entity.id, creds.name.clone());
        if let Some(hit) = self.built.lock().unwrap().get(&key) {
            return Ok(Arc::clone(hit));
        }
        let token = creds
            .pat
            .as_ref()
            .map(|p| p.token.clone())
            .unwrap_or_default();
        let client: Arc<dyn ForgeClient> = Arc::new(MockForgeClient {
            entity: entity.clone(),
            token,
            state: Arc::clone(&self.state),
        });
        self.build_count.fetch_add(1, Ordering::SeqCst);
        self.built.lock().unwrap().insert(key, Arc::clone(&client));
        Ok(client)
    }

    fn invalidate_credentials(&self, credentials_name: &str) {
        self.built
            .lock()
            .unwrap()
            .retain(|(_, name), _| name != credentials_name);
    }
}
