//! GitHub REST implementation of [`ForgeClient`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use garm_schemas::{EntityKind, ForgeEntity, RunnerApplication};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::auth::ClientAuth;
use crate::{ForgeClient, ForgeError, ForgeRunner, HookInfo, RegistrationToken};

/// Filename key under which the JIT blob is served from the metadata
/// endpoint.
pub(crate) const JIT_CONFIG_FILE: &str = "runner";

// -- wire shapes -------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GhRunnerLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhRunner {
    id: i64,
    name: String,
    #[serde(default)]
    os: Option<String>,
    status: String,
    #[serde(default)]
    busy: bool,
    #[serde(default)]
    labels: Vec<GhRunnerLabel>,
}

impl From<GhRunner> for ForgeRunner {
    fn from(r: GhRunner) -> Self {
        ForgeRunner {
            id: r.id,
            name: r.name,
            os: r.os,
            status: r.status,
            busy: r.busy,
            labels: r.labels.into_iter().map(|l| l.name).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhRunnerList {
    runners: Vec<GhRunner>,
}

#[derive(Debug, Deserialize)]
struct GhJitConfig {
    runner: GhRunner,
    encoded_jit_config: String,
}

#[derive(Debug, Deserialize)]
struct GhRun {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct GhRunList {
    #[serde(default)]
    workflow_runs: Vec<GhRun>,
}

#[derive(Debug, Deserialize)]
struct GhJobList {
    #[serde(default)]
    jobs: Vec<garm_schemas::WorkflowJob>,
}

#[derive(Debug, Deserialize)]
struct GhHookConfig {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhHook {
    id: i64,
    active: bool,
    #[serde(default)]
    events: Vec<String>,
    config: GhHookConfig,
}

// -- client ------------------------------------------------------------------

#[derive(Debug)]
pub struct GithubClient {
    http: reqwest::Client,
    entity: ForgeEntity,
    base_url: String,
    api_base_url: String,
    auth: ClientAuth,
}

impl GithubClient {
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

    /// Actions path scoped to this entity kind.
    fn actions_path(&self, suffix: &str) -> String {
        let scope = match (self.entity.kind, &self.entity.name) {
            (EntityKind::Repository, Some(name)) => {
                format!("repos/{}/{}", self.entity.owner, name)
            }
            (EntityKind::Repository, None) => format!("repos/{}", self.entity.owner),
            (EntityKind::Organization, _) => format!("orgs/{}", self.entity.owner),
            (EntityKind::Enterprise, _) => format!("enterprises/{}", self.entity.owner),
        };
        format!("{}/{}/actions/{}", self.api_base_url, scope, suffix)
    }

    fn hooks_path(&self) -> Result<String, ForgeError> {
        match (self.entity.kind, &self.entity.name) {
            (EntityKind::Repository, Some(name)) => Ok(format!(
                "{}/repos/{}/{}/hooks",
                self.api_base_url, self.entity.owner, name
            )),
            (EntityKind::Organization, _) => Ok(format!(
                "{}/orgs/{}/hooks",
                self.api_base_url, self.entity.owner
            )),
            _ => Err(ForgeError::Validation(
                "webhook management is not supported for this entity kind".to_string(),
            )),
        }
    }

    /// Send one request with the current bearer. On 401 with App auth the
    /// cached installation token is dropped and the request retried once.
    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, ForgeError> {
        for attempt in 0..2 {
            let bearer = self.auth.bearer(&self.http, &self.api_base_url).await?;
            let mut req = self
                .http
                .request(method.clone(), url)
                .bearer_auth(bearer)
                .header(reqwest::header::ACCEPT, "application/vnd.github+json")
                .header(reqwest::header::USER_AGENT, "garm");
            if let Some(b) = &body {
                req = req.json(b);
            }
            let resp = req.send().await?;
            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                if self.auth.invalidate().await {
                    debug!(url, "401 with app auth, re-minting installation token");
                    continue;
                }
            }
            if status.is_success() {
                return Ok(resp);
            }
            let body = resp.text().await.unwrap_or_default();
            return Err(ForgeError::from_status(status.as_u16(), body));
        }
        unreachable!("auth retry loop always returns")
    }
}

#[async_trait]
impl ForgeClient for GithubClient {
    fn entity(&self) -> &ForgeEntity {
        &self.entity
    }

    fn forge_url(&self) -> String {
        format!("{}/{}", self.base_url, self.entity.forge_path())
    }

    async fn get_registration_token(&self) -> Result<RegistrationToken, ForgeError> {
        let url = self.actions_path("runners/registration-token");
        let resp = self.request(Method::POST, &url, None).await?;
        resp.json()
            .await
            .map_err(|e| ForgeError::Decode(format!("registration token: {e}")))
    }

    async fn get_jit_config(
        &self,
        runner_name: &str,
        labels: &[String],
        runner_group: &str,
    ) -> Result<(BTreeMap<String, String>, ForgeRunner), ForgeError> {
        let url = self.actions_path("runners/generate-jitconfig");
        // Runner group 1 is the default group on every GitHub install.
        let body = json!({
            "name": runner_name,
            "labels": labels,
            "runner_group_id": if runner_group.is_empty() { json!(1) } else { json!(runner_group) },
            "work_folder": "_work",
        });
        let resp = self.request(Method::POST, &url, Some(body)).await?;
        let jit: GhJitConfig = resp
            .json()
            .await
            .map_err(|e| ForgeError::Decode(format!("jit config: {e}")))?;
        let mut files = BTreeMap::new();
        files.insert(JIT_CONFIG_FILE.to_string(), jit.encoded_jit_config);
        Ok((files, jit.runner.into()))
    }

    async fn list_runner_applications(&self) -> Result<Vec<RunnerApplication>, ForgeError> {
        let url = self.actions_path("runners/downloads");
        let resp = self.request(Method::GET, &url, None).await?;
        resp.json()
            .await
            .map_err(|e| ForgeError::Decode(format!("runner applications: {e}")))
    }

    async fn list_runners(&self) -> Result<Vec<ForgeRunner>, ForgeError> {
        let url = format!("{}?per_page=100", self.actions_path("runners"));
        let resp = self.request(Method::GET, &url, None).await?;
        let list: GhRunnerList = resp
            .json()
            .await
            .map_err(|e| ForgeError::Decode(format!("runner list: {e}")))?;
        Ok(list.runners.into_iter().map(Into::into).collect())
    }

    async fn list_queued_jobs(&self) -> Result<Vec<garm_schemas::WorkflowJob>, ForgeError> {
        // Only repositories expose a run/job listing; wider scopes rely on
        // webhooks alone.
        if self.entity.kind != EntityKind::Repository {
            return Ok(vec![]);
        }
        let runs_url = format!("{}?status=queued&per_page=100", self.actions_path("runs"));
        let resp = self.request(Method::GET, &runs_url, None).await?;
        let runs: GhRunList = resp
            .json()
            .await
            .map_err(|e| ForgeError::Decode(format!("run list: {e}")))?;

        let mut queued = Vec::new();
        for run in runs.workflow_runs {
            let jobs_url = self.actions_path(&format!("runs/{}/jobs", run.id));
            let resp = self.request(Method::GET, &jobs_url, None).await?;
            let jobs: GhJobList = resp
                .json()
                .await
                .map_err(|e| ForgeError::Decode(format!("job list: {e}")))?;
            queued.extend(jobs.jobs.into_iter().filter(|j| j.status == "queued"));
        }
        Ok(queued)
    }

    async fn remove_runner(&self, agent_id: i64) -> Result<(), ForgeError> {
        let url = self.actions_path(&format!("runners/{agent_id}"));
        self.request(Method::DELETE, &url, None).await.map(|_| ())
    }

    async fn install_webhook(&self, url: &str, secret: &str) -> Result<HookInfo, ForgeError> {
        let hooks = self.hooks_path()?;
        let body = json!({
            "name": "web",
            "active": true,
            "events": ["workflow_job"],
            "config": {
                "url": url,
                "content_type": "json",
                "secret": secret,
                "insecure_ssl": "0",
            }
        });
        let resp = self.request(Method::POST, &hooks, Some(body)).await?;
        let hook: GhHook = resp
            .json()
            .await
            .map_err(|e| ForgeError::Decode(format!("hook: {e}")))?;
        Ok(HookInfo {
            id: hook.id,
            url: hook.config.url.unwrap_or_else(|| url.to_string()),
            active: hook.active,
            events: hook.events,
        })
    }

    async fn uninstall_webhook(&self, hook_id: i64) -> Result<(), ForgeError> {
        let hooks = self.hooks_path()?;
        let url = format!("{hooks}/{hook_id}");
        self.request(Method::DELETE, &url, None).await.map(|_| ())
    }

    async fn get_webhook(&self, target_url: &str) -> Result<Option<HookInfo>, ForgeError> {
        let hooks = self.hooks_path()?;
        let resp = self.request(Method::GET, &hooks, None).await?;
        let hooks: Vec<GhHook> = resp
            .json()
            .await
            .map_err(|e| ForgeError::Decode(format!("hook list: {e}")))?;
        Ok(hooks
            .into_iter()
            .find(|h| h.config.url.as_deref() == Some(target_url))
            .map(|h| HookInfo {
                id: h.id,
                url: target_url.to_string(),
                active: h.active,
                events: h.events,
            }))
    }

    async fn ping(&self) -> Result<(), ForgeError> {
        // Listing runners is the cheapest call that exercises the Actions
        // scopes the orchestrator needs.
        self.list_runners().await.map(|_| ())
    }
}
