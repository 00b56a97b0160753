//! Controller-wide context handed to every manager.
//!
//! The controller UUID, controller URLs and job-age backoff behave as
//! process-wide singletons; they travel as an explicit `Arc<ControllerContext>`
//! rather than ambient globals so tests can run many controllers side by
//! side.

use std::sync::RwLock;
use std::time::Duration;

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerUrls {
    /// Where instances fetch registration material.
    pub metadata_url: String,
    /// Where instances POST status updates.
    pub callback_url: String,
    /// Webhook target installed at the forge.
    pub webhook_url: String,
    pub agent_url: Option<String>,
    pub tools_url: Option<String>,
}

pub struct ControllerContext {
    controller_id: Uuid,
    urls: RwLock<ControllerUrls>,
    minimum_job_age_backoff: Duration,
}

impl ControllerContext {
    pub fn new(
        controller_id: Uuid,
        urls: ControllerUrls,
        minimum_job_age_backoff: Duration,
    ) -> Self {
        Self {
            controller_id,
            urls: RwLock::new(urls),
            minimum_job_age_backoff,
        }
    }

    pub fn controller_id(&self) -> Uuid {
        self.controller_id
    }

    pub fn urls(&self) -> ControllerUrls {
        self.urls.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Runtime URL update; takes effect for the next instance create.
    pub fn set_urls(&self, urls: ControllerUrls) {
        *self.urls.write().unwrap_or_else(|e| e.into_inner()) = urls;
    }

    /// Jobs younger than this are left for an existing idle runner.
    pub fn minimum_job_age_backoff(&self) -> Duration {
        self.minimum_job_age_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls() -> ControllerUrls {
        ControllerUrls {
            metadata_url: "https://garm/api/v1/metadata".into(),
            callback_url: "https://garm/api/v1/callbacks".into(),
            webhook_url: "https://garm/webhooks".into(),
            agent_url: None,
            tools_url: None,
        }
    }

    #[test]
    fn url_update_is_visible() {
        let ctx = ControllerContext::new(Uuid::new_v4(), urls(), Duration::from_secs(30));
        let mut u = ctx.urls();
        u.webhook_url = "https://elsewhere/webhooks".into();
        ctx.set_urls(u);
        assert_eq!(ctx.urls().webhook_url, "https://elsewhere/webhooks");
        assert_eq!(ctx.minimum_job_age_backoff(), Duration::from_secs(30));
    }
}
