//! Bearer material: static PATs and GitHub App installation tokens.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::ForgeError;

/// Installation tokens live about an hour; refresh this far before expiry.
const TOKEN_SAFETY_MARGIN_MINS: i64 = 5;
/// App JWTs may be valid for at most 10 minutes; stay under that.
const APP_JWT_LIFETIME_SECS: i64 = 9 * 60;

#[derive(Debug, Serialize)]
struct AppJwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Lazily refreshed installation-token cache for one GitHub App install.
#[derive(Debug)]
pub struct AppTokenCache {
    app_id: i64,
    installation_id: i64,
    private_key_pem: String,
    cached: Mutex<Option<CachedToken>>,
}

impl AppTokenCache {
    pub fn new(app_id: i64, installation_id: i64, private_key_pem: String) -> Self {
        Self {
            app_id,
            installation_id,
            private_key_pem,
            cached: Mutex::new(None),
        }
    }

    fn mint_jwt(&self) -> Result<String, ForgeError> {
        let now = Utc::now().timestamp();
        let claims = AppJwtClaims {
            // Clock-skew allowance.
            iat: now - 60,
            exp: now + APP_JWT_LIFETIME_SECS,
            iss: self.app_id.to_string(),
        };
        let key = EncodingKey::from_rsa_pem(self.private_key_pem.as_bytes())
            .map_err(|e| ForgeError::Validation(format!("app private key invalid: {e}")))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| ForgeError::Validation(format!("sign app jwt: {e}")))
    }

    /// Current installation token, minting a fresh one when the cached copy
    /// is missing or inside the safety margin. Serialized behind a mutex so
    /// concurrent callers do not mint twice.
    pub async fn bearer(
        &self,
        http: &reqwest::Client,
        api_base_url: &str,
    ) -> Result<String, ForgeError> {
        let mut cached = self.cached.lock().await;
        if let Some(tok) = cached.as_ref() {
            if tok.expires_at - Utc::now() > Duration::minutes(TOKEN_SAFETY_MARGIN_MINS) {
                return Ok(tok.token.clone());
            }
        }

        let jwt = self.mint_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            api_base_url.trim_end_matches('/'),
            self.installation_id
        );
        debug!(installation = self.installation_id, "refreshing app installation token");
        let resp = http
            .post(&url)
            .bearer_auth(jwt)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ForgeError::from_status(status.as_u16(), body));
        }
        let token: InstallationTokenResponse = resp
            .json()
            .await
            .map_err(|e| ForgeError::Decode(format!("installation token response: {e}")))?;
        let bearer = token.token.clone();
        *cached = Some(CachedToken {
            token: token.token,
            expires_at: token.expires_at,
        });
        Ok(bearer)
    }

    /// Drop the cached token; the next call mints a fresh one. Used on 401.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

/// Bearer source for one client: static PAT or App installation tokens.
#[derive(Debug)]
pub(crate) enum ClientAuth {
    Pat(String),
    App(AppTokenCache),
}

impl ClientAuth {
    pub(crate) async fn bearer(
        &self,
        http: &reqwest::Client,
        api_base_url: &str,
    ) -> Result<String, ForgeError> {
        match self {
            ClientAuth::Pat(token) => Ok(token.clone()),
            ClientAuth::App(cache) => cache.bearer(http, api_base_url).await,
        }
    }

    /// PATs cannot rotate themselves; only App tokens are refreshable.
    pub(crate) async fn invalidate(&self) -> bool {
        match self {
            ClientAuth::Pat(_) => false,
            ClientAuth::App(cache) => {
                cache.invalidate().await;
                true
            }
        }
    }
}
