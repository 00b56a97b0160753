//! Gitea REST implementation of [`ForgeClient`].
//!
//! Gitea's Actions API mirrors GitHub's for the operations the orchestrator
//! needs, with two differences: there is no JIT registration, and runner
//! labels come back as plain strings.

use std::collections::BTreeMap;

use async_trait::async_trait;
use garm_schemas::{EntityKind, ForgeEntity, RunnerApplication};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::auth::ClientAuth;
use crate::{ForgeClient, ForgeError, ForgeRunner, HookInfo, RegistrationToken};

#[derive(Debug, Deserialize)]
struct GiteaRunner {
    id: i64,
    name: String,
    status: String,
    #[serde(default)]
    busy: bool,
    #[serde(default)]
    labels: Vec<String>,
}

impl From<GiteaRunner> for ForgeRunner {
    fn from(r: GiteaRunner) -> Self {
        ForgeRunner {
            id: r.id,
            name: r.name,
            os: None,
            status: r.status,
            busy: r.busy,
            labels: r.labels,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GiteaHook {
    id: i64,
    active: bool,
    #[serde(default)]
    events: Vec<String>,
    config: std::collections::HashMap<String, String>,
}

#[derive(Debug)]
pub struct GiteaClient {
    http: reqwest::Client,
    entity: ForgeEntity,
    base_url: String,
    api_base_url: String,
    auth: ClientAuth,
}

impl GiteaClient {
    pub(crate) fn new(
        http: reqwest::Client,
        entity: ForgeEntity,
        base_url: String,
        api_base_url: String,
        auth: ClientAuth,
    ) -> Self {
        Self {
            http,
            entity,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn scope(&self) -> Result<String, ForgeError> {
        match (self.entity.kind, &self.entity.name) {
            (EntityKind::Repository, Some(name)) => {
                Ok(format!("repos/{}/{}", self.entity.owner, name))
            }
            (EntityKind::Organization, _) => Ok(format!("orgs/{}", self.entity.owner)),
            _ => Err(ForgeError::Validation(
                "gitea supports repository and organization entities only".to_string(),
            )),
        }
    }

    fn actions_path(&self, suffix: &str) -> Result<String, ForgeError> {
        Ok(format!(
            "{}/{}/actions/{}",
            self.api_base_url,
            self.scope()?,
            suffix
        ))
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, ForgeError> {
        let bearer = self.auth.bearer(&self.http, &self.api_base_url).await?;
        let mut req = self
            .http
            .request(method, url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("token {bearer}"),
            )
            .header(reqwest::header::USER_AGENT, "garm");
        if let Some(b) = &body {
            req = req.json(b);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NO_CONTENT {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ForgeError::from_status(status.as_u16(), body))
    }
}

#[async_trait]
impl ForgeClient for GiteaClient {
    fn entity(&self) -> &ForgeEntity {
        &self.entity
    }

    fn forge_url(&self) -> String {
        format!("{}/{}", self.base_url, self.entity.forge_path())
    }

    async fn get_registration_token(&self) -> Result<RegistrationToken, ForgeError> {
        let url = self.actions_path("runners/registration-token")?;
        let resp = self.request(Method::GET, &url, None).await?;
        resp.json()
            .await
            .map_err(|e| ForgeError::Decode(format!("registration token: {e}")))
    }

    async fn get_jit_config(
        &self,
        _runner_name: &str,
        _labels: &[String],
        _runner_group: &str,
    ) -> Result<(BTreeMap<String, String>, ForgeRunner), ForgeError> {
        Err(ForgeError::Validation(
            "gitea does not support JIT runner configuration".to_string(),
        ))
    }

    async fn list_runner_applications(&self) -> Result<Vec<RunnerApplication>, ForgeError> {
        // Gitea serves act_runner from its own releases; synthesize the
        // manifest the bootstrap expects.
        let url = format!("{}/version", self.api_base_url);
        self.request(Method::GET, &url, None).await?;
        Ok(vec![
            RunnerApplication {
                os: "linux".into(),
                architecture: "x64".into(),
                download_url: format!("{}/act_runner/latest/act_runner-linux-amd64", self.base_url),
                filename: "act_runner-linux-amd64".into(),
                sha256_checksum: None,
                temp_download_token: None,
            },
            RunnerApplication {
                os: "linux".into(),
                architecture: "arm64".into(),
                download_url: format!("{}/act_runner/latest/act_runner-linux-arm64", self.base_url),
                filename: "act_runner-linux-arm64".into(),
                sha256_checksum: None,
                temp_download_token: None,
            },
        ])
    }

    async fn list_runners(&self) -> Result<Vec<ForgeRunner>, ForgeError> {
        let url = self.actions_path("runners")?;
        let resp = self.request(Method::GET, &url, None).await?;
        let runners: Vec<GiteaRunner> = resp
            .json()
            .await
            .map_err(|e| ForgeError::Decode(format!("runner list: {e}")))?;
        Ok(runners.into_iter().map(Into::into).collect())
    }

    async fn list_queued_jobs(&self) -> Result<Vec<garm_schemas::WorkflowJob>, ForgeError> {
        // Gitea has no queued-job listing; recovery relies on webhooks.
        Ok(vec![])
    }

    async fn remove_runner(&self, agent_id: i64) -> Result<(), ForgeError> {
        let url = self.actions_path(&format!("runners/{agent_id}"))?;
        self.request(Method::DELETE, &url, None).await.map(|_| ())
    }

    async fn install_webhook(&self, url: &str, secret: &str) -> Result<HookInfo, ForgeError> {
        let hooks = format!("{}/{}/hooks", self.api_base_url, self.scope()?);
        let body = json!({
            "type": "gitea",
            "active": true,
            "events": ["workflow_job"],
            "config": {
                "url": url,
                "content_type": "json",
                "secret": secret,
            }
        });
        let resp = self.request(Method::POST, &hooks, Some(body)).await?;
        let hook: GiteaHook = resp
            .json()
            .await
            .map_err(|e| ForgeError::Decode(format!("hook: {e}")))?;
        Ok(HookInfo {
            id: hook.id,
            url: hook
                .config
                .get("url")
                .cloned()
                .unwrap_or_else(|| url.to_string()),
            active: hook.active,
            events: hook.events,
        })
    }

    async fn uninstall_webhook(&self, hook_id: i64) -> Result<(), ForgeError> {
        let url = format!("{}/{}/hooks/{hook_id}", self.api_base_url, self.scope()?);
        self.request(Method::DELETE, &url, None).await.map(|_| ())
    }

    async fn get_webhook(&self, target_url: &str) -> Result<Option<HookInfo>, ForgeError> {
        let url = format!("{}/{}/hooks", self.api_base_url, self.scope()?);
        let resp = self.request(Method::GET, &url, None).await?;
        let hooks: Vec<GiteaHook> = resp
            .json()
            .await
            .map_err(|e| ForgeError::Decode(format!("hook list: {e}")))?;
        Ok(hooks
            .into_iter()
            .find(|h| h.config.get("url").map(String::as_str) == Some(target_url))
            .map(|h| HookInfo {
                id: h.id,
                url: target_url.to_string(),
                active: h.active,
                events: h.events,
            }))
    }

    async fn ping(&self) -> Result<(), ForgeError> {
        self.list_runners().await.map(|_| ())
    }
}
