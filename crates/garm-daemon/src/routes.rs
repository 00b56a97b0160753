//! Intake surface: forge webhooks, instance callbacks, metadata endpoints.
//!
//! Webhook deliveries are HMAC-SHA256 signed with the owning entity's
//! secret; invalid signatures are rejected with 401 before any state is
//! touched. Instance callbacks authenticate with the per-instance bearer
//! minted at create time.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use garm_pool::apply_runner_status;
use garm_schemas::{
    EventLevel, Instance, InstanceStatus, PoolManagerStatus, RunnerStatus, StatusMessage,
    WorkflowJobEvent,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks", post(handle_webhook))
        .route("/api/v1/callbacks/status", post(handle_callback_status))
        .route(
            "/api/v1/metadata/runner/registration-token",
            get(handle_registration_token),
        )
        .route(
            "/api/v1/metadata/runner/jit-config/:file",
            get(handle_jit_config),
        )
        .route("/api/v1/metadata/tools", get(handle_tools))
        .route("/healthz", get(handle_health))
        .route("/v1/status", get(handle_status))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

fn signature_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-hub-signature-256")
        .or_else(|| headers.get("x-gitea-signature"))
        .and_then(|v| v.to_str().ok())
}

fn event_kind(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-github-event")
        .or_else(|| headers.get("x-gitea-event"))
        .and_then(|v| v.to_str().ok())
}

/// Constant-time HMAC-SHA256 check of the raw body against the entity
/// secret.
fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let hex_digest = header.strip_prefix("sha256=").unwrap_or(header);
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let kind = event_kind(&headers).unwrap_or("");
    if kind == "ping" {
        return StatusCode::OK.into_response();
    }
    if kind != "workflow_job" {
        debug!(kind, "ignoring webhook event");
        return StatusCode::OK.into_response();
    }

    let event: WorkflowJobEvent = match serde_json::from_slice(&body) {
        Ok(ev) => ev,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid payload: {e}")).into_response()
        }
    };

    // Most specific owner wins: a repo-scoped entity shadows the org one.
    let entity = event
        .entity_paths()
        .into_iter()
        .find_map(|path| state.store.find_entity_by_path(&path).ok());
    let Some(entity) = entity else {
        return (StatusCode::NOT_FOUND, "no entity for this delivery").into_response();
    };

    // Signature validation is mandatory; a delivery without one is invalid.
    let Some(signature) = signature_header(&headers) else {
        return (StatusCode::UNAUTHORIZED, "missing signature").into_response();
    };
    if !verify_signature(&entity.webhook_secret, &body, signature) {
        warn!(entity = %entity.forge_path(), "webhook signature mismatch");
        return (StatusCode::UNAUTHORIZED, "signature mismatch").into_response();
    }

    let managers = state.managers.read().await;
    match managers.get(&entity.id) {
        Some(handle) if handle.deliver_job(event) => StatusCode::OK.into_response(),
        _ => {
            warn!(entity = %entity.forge_path(), "no running pool manager for delivery");
            (StatusCode::SERVICE_UNAVAILABLE, "pool manager not running").into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Instance callbacks / metadata
// ---------------------------------------------------------------------------

fn bearer_instance(state: &AppState, headers: &HeaderMap) -> Result<Instance, Response> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing bearer").into_response())?;
    state
        .store
        .get_instance_by_token(token)
        .map_err(|_| (StatusCode::UNAUTHORIZED, "unknown instance token").into_response())
}

#[derive(Debug, Deserialize)]
struct CallbackStatusBody {
    /// "installing" | "idle" | "failed" — the runner-side phase.
    status: RunnerStatus,
    #[serde(default)]
    message: Option<String>,
}

async fn handle_callback_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(update): Json<CallbackStatusBody>,
) -> Response {
    let instance = match bearer_instance(&state, &headers) {
        Ok(i) => i,
        Err(resp) => return resp,
    };

    let folded = apply_runner_status(instance.runner_status, update.status);
    if folded != instance.runner_status {
        let _ = state
            .store
            .set_instance_runner_status(&instance.name, folded);
    }
    if let Some(message) = update.message {
        let _ = state.store.add_status_message(
            &instance.name,
            StatusMessage {
                created_at: chrono::Utc::now(),
                level: if update.status == RunnerStatus::Failed {
                    EventLevel::Error
                } else {
                    EventLevel::Info
                },
                message,
            },
        );
    }
    if let Ok(updated) = state.store.get_instance(&instance.name) {
        state.bus.publish(garm_events::ChangeEvent::new(
            garm_events::Operation::Update,
            garm_events::EventPayload::Instance(updated),
        ));
    }
    StatusCode::OK.into_response()
}

async fn handle_registration_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let instance = match bearer_instance(&state, &headers) {
        Ok(i) => i,
        Err(resp) => return resp,
    };

    // Single use, only while the runner is still setting up, and only for
    // the classic (non-JIT) registration flow.
    if instance.jit_config.is_some() {
        return (StatusCode::CONFLICT, "instance uses JIT configuration").into_response();
    }
    if instance.token_fetched {
        return (StatusCode::GONE, "registration token already fetched").into_response();
    }
    if !matches!(
        instance.runner_status,
        RunnerStatus::Pending | RunnerStatus::Installing
    ) {
        return (StatusCode::FORBIDDEN, "runner is past setup").into_response();
    }

    let Ok(entity) = state.cache.get_entity(instance.entity_id) else {
        return (StatusCode::NOT_FOUND, "entity gone").into_response();
    };
    let Ok(creds) = state.cache.get_credentials(&entity.credentials_name) else {
        return (StatusCode::SERVICE_UNAVAILABLE, "credentials unavailable").into_response();
    };
    let client = match state.forge_factory.client_for(&entity, &creds) {
        Ok(c) => c,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };
    match client.get_registration_token().await {
        Ok(token) => {
            let _ = state.store.mark_token_fetched(&instance.name);
            token.token.into_response()
        }
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}

async fn handle_jit_config(
    State(state): State<Arc<AppState>>,
    Path(file): Path<String>,
    headers: HeaderMap,
) -> Response {
    let instance = match bearer_instance(&state, &headers) {
        Ok(i) => i,
        Err(resp) => return resp,
    };
    let Some(files) = &instance.jit_config else {
        return (StatusCode::NOT_FOUND, "instance has no JIT material").into_response();
    };
    match files.get(&file) {
        Some(content) => content.clone().into_response(),
        None => (StatusCode::NOT_FOUND, format!("no JIT file {file}")).into_response(),
    }
}

async fn handle_tools(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let instance = match bearer_instance(&state, &headers) {
        Ok(i) => i,
        Err(resp) => return resp,
    };
    match state.cache.get_tools(instance.entity_id) {
        Some(tools) => Json(tools).into_response(),
        None => (StatusCode::NOT_FOUND, "tools manifest not cached yet").into_response(),
    }
}

// ---------------------------------------------------------------------------
// Health / status
// ---------------------------------------------------------------------------

async fn handle_health() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
struct EntityStatus {
    id: String,
    path: String,
    status: PoolManagerStatus,
    live_instances: usize,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    service: &'static str,
    version: &'static str,
    controller_id: String,
    entities: Vec<EntityStatus>,
    provider_ops: Vec<ProviderOp>,
}

#[derive(Debug, Serialize)]
struct ProviderOp {
    provider: String,
    operation: &'static str,
    ok: u64,
    err: u64,
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let entities = state
        .store
        .list_entities()
        .into_iter()
        .map(|e| EntityStatus {
            id: e.id.to_string(),
            path: e.forge_path(),
            status: e.pool_manager_status.clone(),
            live_instances: state
                .store
                .list_entity_instances(e.id)
                .iter()
                .filter(|i| i.status != InstanceStatus::Deleted)
                .count(),
        })
        .collect();
    let provider_ops = state
        .dispatcher
        .op_counts()
        .into_iter()
        .map(|c| ProviderOp {
            provider: c.provider,
            operation: c.operation,
            ok: c.ok,
            err: c.err,
        })
        .collect();
    Json(StatusResponse {
        service: state.build.service,
        version: state.build.version,
        controller_id: state.ctx.controller_id().to_string(),
        entities,
        provider_ops,
    })
}
