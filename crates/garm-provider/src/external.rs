//! External provider: shells out to a third-party executable per operation.
//!
//! The ABI (interface v0.1.0) is environment + stdio:
//! - `GARM_COMMAND` names the operation; `GARM_CONTROLLER_ID`,
//!   `GARM_INSTANCE_ID` / `GARM_POOL_ID`, `GARM_PROVIDER_CONFIG_FILE` and
//!   `GARM_INTERFACE_VERSION` identify the call.
//! - `CreateInstance` receives a JSON `BootstrapInstance` on stdin.
//! - stdout carries the JSON result; stderr is the diagnostic on failure.
//! - exit 0 = success, exit 30 = *not found*, anything else = provider error.
//!
//! Provider binaries are out-of-repo third parties; every field name and
//! exit code here is load-bearing.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use garm_config::ProviderConfig;
use garm_schemas::{BootstrapInstance, ProviderInstance};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use crate::{Provider, ProviderError};

pub const INTERFACE_VERSION: &str = "v0.1.0";
/// Reserved exit code: the instance does not exist at the provider.
pub const EXIT_CODE_NOT_FOUND: i32 = 30;

const ENV_COMMAND: &str = "GARM_COMMAND";
const ENV_CONTROLLER_ID: &str = "GARM_CONTROLLER_ID";
const ENV_INSTANCE_ID: &str = "GARM_INSTANCE_ID";
const ENV_POOL_ID: &str = "GARM_POOL_ID";
const ENV_CONFIG_FILE: &str = "GARM_PROVIDER_CONFIG_FILE";
const ENV_INTERFACE_VERSION: &str = "GARM_INTERFACE_VERSION";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderCommand {
    CreateInstance,
    DeleteInstance,
    GetInstance,
    ListInstances,
    RemoveAllInstances,
    StartInstance,
    StopInstance,
}

impl ProviderCommand {
    fn as_str(self) -> &'static str {
        match self {
            ProviderCommand::CreateInstance => "CreateInstance",
            ProviderCommand::DeleteInstance => "DeleteInstance",
            ProviderCommand::GetInstance => "GetInstance",
            ProviderCommand::ListInstances => "ListInstances",
            ProviderCommand::RemoveAllInstances => "RemoveAllInstances",
            ProviderCommand::StartInstance => "StartInstance",
            ProviderCommand::StopInstance => "StopInstance",
        }
    }
}

enum CommandTarget {
    Instance(String),
    Pool(Uuid),
}

pub struct ExternalProvider {
    name: String,
    exec_path: PathBuf,
    config_file: PathBuf,
    environment: BTreeMap<String, String>,
    controller_id: Uuid,
    disable_jit: bool,
    create_timeout: Duration,
    query_timeout: Duration,
}

impl ExternalProvider {
    pub fn from_config(cfg: &ProviderConfig, controller_id: Uuid) -> Self {
        Self {
            name: cfg.name.clone(),
            exec_path: cfg.exec_path.clone(),
            config_file: cfg.config_file.clone(),
            environment: cfg.environment.clone(),
            controller_id,
            disable_jit: cfg.disable_jit_config,
            create_timeout: cfg.create_timeout(),
            query_timeout: cfg.query_timeout(),
        }
    }

    async fn exec(
        &self,
        command: ProviderCommand,
        target: CommandTarget,
        stdin_payload: Option<Vec<u8>>,
        deadline: Duration,
    ) -> Result<Vec<u8>, ProviderError> {
        let mut cmd = Command::new(&self.exec_path);
        cmd.envs(&self.environment)
            .env(ENV_COMMAND, command.as_str())
            .env(ENV_CONTROLLER_ID, self.controller_id.to_string())
            .env(ENV_CONFIG_FILE, &self.config_file)
            .env(ENV_INTERFACE_VERSION, INTERFACE_VERSION)
            .stdin(if stdin_payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The kill is our timeout backstop: dropping the wait future
            // must not leak the subprocess.
            .kill_on_drop(true);

        match target {
            CommandTarget::Instance(name) => {
                cmd.env(ENV_INSTANCE_ID, name);
            }
            CommandTarget::Pool(pool_id) => {
                cmd.env(ENV_POOL_ID, pool_id.to_string());
            }
        }

        debug!(
            provider = %self.name,
            command = command.as_str(),
            "invoking external provider"
        );

        let mut child = cmd.spawn().map_err(|e| {
            ProviderError::Transient(format!(
                "spawn {}: {e}",
                self.exec_path.display()
            ))
        })?;

        if let Some(payload) = stdin_payload {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(&payload)
                    .await
                    .map_err(|e| ProviderError::Transient(format!("write provider stdin: {e}")))?;
                // stdin drops here, closing the pipe.
            }
        }

        let output = match timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProviderError::Transient(format!("wait for provider: {e}")));
            }
            Err(_) => {
                return Err(ProviderError::Timeout {
                    operation: command.as_str().to_string(),
                    secs: deadline.as_secs(),
                });
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => Ok(output.stdout),
            Some(EXIT_CODE_NOT_FOUND) => Err(ProviderError::NotFound(if stderr.is_empty() {
                command.as_str().to_string()
            } else {
                stderr
            })),
            Some(code) => Err(ProviderError::Fatal(format!(
                "{} exited with code {code}: {stderr}",
                command.as_str()
            ))),
            // Killed by signal.
            None => Err(ProviderError::Transient(format!(
                "{} terminated by signal: {stderr}",
                command.as_str()
            ))),
        }
    }
}

#[async_trait]
impl Provider for ExternalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn disable_jit_config(&self) -> bool {
        self.disable_jit
    }

    async fn create_instance(
        &self,
        bootstrap: &BootstrapInstance,
    ) -> Result<ProviderInstance, ProviderError> {
        let payload = serde_json::to_vec(bootstrap)
            .map_err(|e| ProviderError::Decode(format!("encode bootstrap: {e}")))?;
        let stdout = self
            .exec(
                ProviderCommand::CreateInstance,
                CommandTarget::Instance(bootstrap.name.clone()),
                Some(payload),
                self.create_timeout,
            )
            .await?;
        serde_json::from_slice(&stdout)
            .map_err(|e| ProviderError::Decode(format!("decode CreateInstance result: {e}")))
    }

    async fn get_instance(&self, instance_name: &str) -> Result<ProviderInstance, ProviderError> {
        let stdout = self
            .exec(
                ProviderCommand::GetInstance,
                CommandTarget::Instance(instance_name.to_string()),
                None,
                self.query_timeout,
            )
            .await?;
        serde_json::from_slice(&stdout)
            .map_err(|e| ProviderError::Decode(format!("decode GetInstance result: {e}")))
    }

    async fn delete_instance(&self, instance_name: &str) -> Result<(), ProviderError> {
        self.exec(
            ProviderCommand::DeleteInstance,
            CommandTarget::Instance(instance_name.to_string()),
            None,
            self.create_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn list_instances(&self, pool_id: Uuid) -> Result<Vec<ProviderInstance>, ProviderError> {
        let stdout = self
            .exec(
                ProviderCommand::ListInstances,
                CommandTarget::Pool(pool_id),
                None,
                self.query_timeout,
            )
            .await?;
        serde_json::from_slice(&stdout)
            .map_err(|e| ProviderError::Decode(format!("decode ListInstances result: {e}")))
    }

    async fn remove_all_instances(&self, pool_id: Uuid) -> Result<(), ProviderError> {
        self.exec(
            ProviderCommand::RemoveAllInstances,
            CommandTarget::Pool(pool_id),
            None,
            self.create_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn start_instance(&self, instance_name: &str) -> Result<(), ProviderError> {
        self.exec(
            ProviderCommand::StartInstance,
            CommandTarget::Instance(instance_name.to_string()),
            None,
            self.query_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn stop_instance(&self, instance_name: &str) -> Result<(), ProviderError> {
        self.exec(
            ProviderCommand::StopInstance,
            CommandTarget::Instance(instance_name.to_string()),
            None,
            self.query_timeout,
        )
        .await
        .map(|_| ())
    }
}
