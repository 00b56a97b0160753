//! The runner-scale-set session protocol.
//!
//! Object-safe trait plus the HTTP implementation. Sessions are exclusive:
//! the service answers 409 when another holder owns the scale set, and 401
//! once a session token has expired — both mean *re-acquire and retry*.

use std::time::Duration;

use async_trait::async_trait;
use garm_forge::ForgeError;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// An acquired long-poll session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleSetSession {
    pub session_id: String,
    /// Queue endpoint the messages are polled from.
    pub message_queue_url: String,
    /// Bearer for the message queue; distinct from the API credentials.
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScaleSetStatistics {
    #[serde(default)]
    pub total_available_jobs: u32,
    #[serde(default)]
    pub total_assigned_jobs: u32,
    #[serde(default)]
    pub total_running_jobs: u32,
    #[serde(default)]
    pub total_registered_runners: u32,
}

/// One job reference inside a session message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleSetJob {
    pub runner_request_id: i64,
    #[serde(default)]
    pub runner_name: Option<String>,
    #[serde(default)]
    pub agent_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScaleSetMessageBody {
    #[serde(default)]
    pub statistics: ScaleSetStatistics,
    #[serde(default)]
    pub jobs_available: Vec<ScaleSetJob>,
    #[serde(default)]
    pub jobs_started: Vec<ScaleSetJob>,
    #[serde(default)]
    pub jobs_completed: Vec<ScaleSetJob>,
}

/// One message from the session queue. Acknowledged by `message_id`;
/// unacknowledged messages are redelivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleSetMessage {
    pub message_id: i64,
    pub message_type: String,
    pub body: ScaleSetMessageBody,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ScaleSetApi: Send + Sync {
    async fn create_session(&self, scale_set_id: i64) -> Result<ScaleSetSession, ForgeError>;

    /// Long-poll for the next message after `last_message_id`. `Ok(None)` on
    /// a quiet timeout.
    async fn get_message(
        &self,
        session: &ScaleSetSession,
        last_message_id: i64,
        wait: Duration,
    ) -> Result<Option<ScaleSetMessage>, ForgeError>;

    async fn ack_message(
        &self,
        session: &ScaleSetSession,
        message_id: i64,
    ) -> Result<(), ForgeError>;

    /// Claim jobs by request id; returns the ids actually acquired (another
    /// scaler may have raced us for some).
    async fn acquire_jobs(
        &self,
        session: &ScaleSetSession,
        scale_set_id: i64,
        request_ids: &[i64],
    ) -> Result<Vec<i64>, ForgeError>;

    /// Polite release on shutdown.
    async fn delete_session(&self, session: &ScaleSetSession) -> Result<(), ForgeError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AcquireResponse {
    #[serde(default)]
    acquired: Vec<i64>,
}

pub struct HttpScaleSetApi {
    http: reqwest::Client,
    api_base_url: String,
    /// Actions-service admin bearer for session management.
    bearer: String,
}

impl HttpScaleSetApi {
    pub fn new(http: reqwest::Client, api_base_url: String, bearer: String) -> Self {
        Self {
            http,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            bearer,
        }
    }

    /// Build from stored credentials. Session management authenticates with
    /// the PAT; GitHub App credentials cannot hold a scale set session.
    pub fn from_credentials(
        creds: &garm_schemas::ForgeCredentials,
    ) -> Result<Self, ForgeError> {
        let pat = creds.pat.as_ref().ok_or_else(|| {
            ForgeError::Validation(format!(
                "credentials {} have no PAT; scale set sessions require one",
                creds.name
            ))
        })?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(70))
            .build()
            .map_err(|e| ForgeError::Validation(format!("build http client: {e}")))?;
        Ok(Self::new(
            http,
            creds.endpoint.api_base_url.clone(),
            pat.token.clone(),
        ))
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        bearer: &str,
        body: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, ForgeError> {
        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(bearer)
            .header(reqwest::header::USER_AGENT, "garm");
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        if let Some(b) = &body {
            req = req.json(b);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(ForgeError::from_status(status.as_u16(), text))
    }
}

#[async_trait]
impl ScaleSetApi for HttpScaleSetApi {
    async fn create_session(&self, scale_set_id: i64) -> Result<ScaleSetSession, ForgeError> {
        let url = format!(
            "{}/actions/runner-scale-sets/{scale_set_id}/sessions",
            self.api_base_url
        );
        debug!(scale_set = scale_set_id, "acquiring scale set session");
        let resp = self
            .send(Method::POST, &url, &self.bearer, None, None)
            .await?;
        resp.json()
            .await
            .map_err(|e| ForgeError::Decode(format!("session: {e}")))
    }

    async fn get_message(
        &self,
        session: &ScaleSetSession,
        last_message_id: i64,
        wait: Duration,
    ) -> Result<Option<ScaleSetMessage>, ForgeError> {
        let url = format!(
            "{}?lastMessageId={last_message_id}",
            session.message_queue_url
        );
        // The service holds the request up to `wait`; pad the client-side
        // deadline so the server decides the timeout.
        let resp = self
            .send(
                Method::GET,
                &url,
                &session.token,
                None,
                Some(wait + Duration::from_secs(10)),
            )
            .await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        resp.json()
            .await
            .map(Some)
            .map_err(|e| ForgeError::Decode(format!("scale set message: {e}")))
    }

    async fn ack_message(
        &self,
        session: &ScaleSetSession,
        message_id: i64,
    ) -> Result<(), ForgeError> {
        let url = format!("{}/{message_id}", session.message_queue_url);
        self.send(Method::DELETE, &url, &session.token, None, None)
            .await
            .map(|_| ())
    }

    async fn acquire_jobs(
        &self,
        session: &ScaleSetSession,
        scale_set_id: i64,
        request_ids: &[i64],
    ) -> Result<Vec<i64>, ForgeError> {
        let url = format!(
            "{}/actions/runner-scale-sets/{scale_set_id}/acquirejobs",
            self.api_base_url
        );
        let resp = self
            .send(
                Method::POST,
                &url,
                &session.token,
                Some(serde_json::json!({ "requestIds": request_ids })),
                None,
            )
            .await?;
        let acquired: AcquireResponse = resp
            .json()
            .await
            .map_err(|e| ForgeError::Decode(format!("acquire jobs: {e}")))?;
        Ok(acquired.acquired)
    }

    async fn delete_session(&self, session: &ScaleSetSession) -> Result<(), ForgeError> {
        let url = format!(
            "{}/actions/runner-scale-sets/sessions/{}",
            self.api_base_url, session.session_id
        );
        match self
            .send(Method::DELETE, &url, &self.bearer, None, None)
            .await
        {
            Ok(_) => Ok(()),
            // Session already expired server-side; nothing to release.
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
