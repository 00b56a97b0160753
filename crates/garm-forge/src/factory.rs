//! Client factory: one cached [`ForgeClient`] per `(entity, credentials)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use garm_schemas::{AuthKind, ForgeCredentials, ForgeEntity, ForgeKind};
use tracing::debug;
use uuid::Uuid;

use crate::auth::{AppTokenCache, ClientAuth};
use crate::{ForgeClient, ForgeError, GiteaClient, GithubClient};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Produces per-entity forge clients. Object-safe so test harnesses can
/// substitute mock factories.
pub trait ForgeClientProvider: Send + Sync {
    /// Build (or return the cached) client for this entity + credentials.
    fn client_for(
        &self,
        entity: &ForgeEntity,
        creds: &ForgeCredentials,
    ) -> Result<Arc<dyn ForgeClient>, ForgeError>;

    /// Drop cached clients built from the named credentials. In-flight calls
    /// finish on the old client; new calls get a rebuilt one.
    fn invalidate_credentials(&self, credentials_name: &str);
}

pub struct HttpForgeFactory {
    call_timeout: Duration,
    cache: Mutex<HashMap<(Uuid, String), Arc<dyn ForgeClient>>>,
}

impl Default for HttpForgeFactory {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_TIMEOUT)
    }
}

impl HttpForgeFactory {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            call_timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn build_http(&self, creds: &ForgeCredentials) -> Result<reqwest::Client, ForgeError> {
        let mut builder = reqwest::Client::builder().timeout(self.call_timeout);
        if let Some(bundle) = &creds.endpoint.ca_cert_bundle {
            let cert = reqwest::Certificate::from_pem(bundle).map_err(|e| {
                ForgeError::Validation(format!(
                    "endpoint {} CA bundle invalid: {e}",
                    creds.endpoint.name
                ))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        builder
            .build()
            .map_err(|e| ForgeError::Validation(format!("build http client: {e}")))
    }

    fn build_auth(creds: &ForgeCredentials) -> Result<ClientAuth, ForgeError> {
        match creds.auth_kind {
            AuthKind::Pat => {
                let pat = creds.pat.as_ref().ok_or_else(|| {
                    ForgeError::Validation(format!("credentials {} have no PAT", creds.name))
                })?;
                Ok(ClientAuth::Pat(pat.token.clone()))
            }
            AuthKind::App => {
                let app = creds.app.as_ref().ok_or_else(|| {
                    ForgeError::Validation(format!(
                        "credentials {} have no app material",
                        creds.name
                    ))
                })?;
                Ok(ClientAuth::App(AppTokenCache::new(
                    app.app_id,
                    app.installation_id,
                    app.private_key_pem.clone(),
                )))
            }
        }
    }
}

impl ForgeClientProvider for HttpForgeFactory {
    fn client_for(
        &self,
        entity: &ForgeEntity,
        creds: &ForgeCredentials,
    ) -> Result<Arc<dyn ForgeClient>, ForgeError> {
        let key = (entity.id, creds.name.clone());
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(Arc::clone(hit));
        }

        if creds.endpoint.name != entity.endpoint_name {
            return Err(ForgeError::Validation(format!(
                "credentials {} belong to endpoint {}, entity {} is on {}",
                creds.name,
                creds.endpoint.name,
                entity.forge_path(),
                entity.endpoint_name
            )));
        }

        let http = self.build_http(creds)?;
        let auth = Self::build_auth(creds)?;
        let client: Arc<dyn ForgeClient> = match creds.endpoint.kind {
            ForgeKind::Github => Arc::new(GithubClient::new(
                http,
                entity.clone(),
                creds.endpoint.base_url.clone(),
                creds.endpoint.api_base_url.clone(),
                auth,
            )),
            ForgeKind::Gitea => Arc::new(GiteaClient::new(
                http,
                entity.clone(),
                creds.endpoint.base_url.clone(),
                creds.endpoint.api_base_url.clone(),
                auth,
            )),
        };

        debug!(
            entity = %entity.forge_path(),
            credentials = %creds.name,
            "built forge client"
        );
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::clone(&client));
        Ok(client)
    }

    fn invalidate_credentials(&self, credentials_name: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(_, name), _| name != credentials_name);
    }
}
