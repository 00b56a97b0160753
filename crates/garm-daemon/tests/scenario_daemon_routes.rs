//! In-process router tests: webhook signature gate, instance callbacks,
//! metadata endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use garm_daemon::routes::build_router;
use garm_daemon::state::{AppState, BuildInfo};
use garm_schemas::{InstanceStatus, RunnerStatus};
use garm_store::Store;
use garm_testkit::TestBed;
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use sha2::Sha256;
use tower::ServiceExt;

fn app_state(bed: &TestBed) -> Arc<AppState> {
    Arc::new(AppState {
        store: Arc::clone(&bed.store) as Arc<dyn Store>,
        cache: Arc::clone(&bed.cache),
        bus: bed.bus.clone(),
        ctx: Arc::clone(&bed.ctx),
        dispatcher: Arc::clone(&bed.dispatcher),
        forge_factory: Arc::clone(&bed.forge_factory) as _,
        managers: Default::default(),
        coordinators: Default::default(),
        build: BuildInfo::default(),
    })
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn queued_payload() -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "action": "queued",
        "workflow_job": {
            "id": 42, "run_id": 420, "name": "build", "status": "queued",
            "labels": ["self-hosted", "linux"]
        },
        "repository": {
            "name": "svc", "full_name": "acme/svc",
            "owner": { "login": "acme" }
        }
    }))
    .unwrap()
}

fn webhook_request(body: Vec<u8>, signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks")
        .header("content-type", "application/json")
        .header("x-github-event", "workflow_job");
    if let Some(sig) = signature {
        builder = builder.header("x-hub-signature-256", sig);
    }
    builder.body(Body::from(body)).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn healthz_answers_ok() {
    let bed = TestBed::new();
    let app = build_router(app_state(&bed));
    let resp = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"OK");
}

#[tokio::test(flavor = "multi_thread")]
async fn webhook_without_entity_is_404() {
    let bed = TestBed::new();
    let app = build_router(app_state(&bed));
    let body = queued_payload();
    let sig = sign("whatever", &body);
    let resp = app
        .oneshot(webhook_request(body, Some(&sig)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn webhook_with_bad_signature_is_401() {
    let bed = TestBed::new();
    let _entity = bed.seed_repo_entity("acme", "svc");
    let app = build_router(app_state(&bed));

    let body = queued_payload();
    let bad = sign("wrong-secret", &body);
    let resp = app.oneshot(webhook_request(body, Some(&bad))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread")]
async fn webhook_without_signature_is_401() {
    let bed = TestBed::new();
    let _entity = bed.seed_repo_entity("acme", "svc");
    let app = build_router(app_state(&bed));

    let resp = app
        .oneshot(webhook_request(queued_payload(), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread")]
async fn signed_webhook_reaches_the_pool_manager() {
    let bed = TestBed::new();
    let entity = bed.seed_repo_entity("acme", "svc");
    let pool = bed.seed_pool(&entity, 0, 2, &["self-hosted", "linux"]);

    let state = app_state(&bed);
    let manager = bed.start_manager(entity.id);
    state.managers.write().await.insert(entity.id, manager);
    let app = build_router(Arc::clone(&state));

    let body = queued_payload();
    let sig = sign("hunter2", &body);
    let resp = app.oneshot(webhook_request(body, Some(&sig))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // The delivery turned into a scale-up.
    bed.wait_until("job created an instance", Duration::from_secs(5), || {
        bed.live_count(pool.id) == 1
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn signed_webhook_without_manager_is_503() {
    let bed = TestBed::new();
    let _entity = bed.seed_repo_entity("acme", "svc");
    let app = build_router(app_state(&bed));

    let body = queued_payload();
    let sig = sign("hunter2", &body);
    let resp = app.oneshot(webhook_request(body, Some(&sig))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_event_is_accepted_unsigned() {
    let bed = TestBed::new();
    let app = build_router(app_state(&bed));
    let resp = app
        .oneshot(
            Request::post("/webhooks")
                .header("x-github-event", "ping")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

// ---------------------------------------------------------------------------
// Instance callbacks / metadata
// ---------------------------------------------------------------------------

async fn provisioned_instance(bed: &TestBed) -> garm_schemas::Instance {
    let entity = bed.seed_repo_entity("acme", "svc");
    let pool = bed.seed_pool(&entity, 1, 2, &["self-hosted"]);
    let manager = bed.start_manager(entity.id);
    bed.wait_until("instance running", Duration::from_secs(5), || {
        bed.running_count(pool.id) == 1
    })
    .await;
    manager.shutdown().await;
    bed.store
        .list_pool_instances(pool.id)
        .into_iter()
        .next()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn callback_updates_runner_status() {
    let bed = TestBed::new();
    let instance = provisioned_instance(&bed).await;
    let app = build_router(app_state(&bed));

    let resp = app
        .oneshot(
            Request::post("/api/v1/callbacks/status")
                .header("authorization", format!("Bearer {}", instance.callback_token))
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"status": "idle", "message": "runner ready"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let updated = bed.store.get_instance(&instance.name).unwrap();
    assert_eq!(updated.runner_status, RunnerStatus::Idle);
    assert!(updated
        .status_messages
        .iter()
        .any(|m| m.message == "runner ready"));
}

#[tokio::test(flavor = "multi_thread")]
async fn callback_with_bad_token_is_401() {
    let bed = TestBed::new();
    let _instance = provisioned_instance(&bed).await;
    let app = build_router(app_state(&bed));

    let resp = app
        .oneshot(
            Request::post("/api/v1/callbacks/status")
                .header("authorization", "Bearer nope")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"status":"idle"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread")]
async fn jit_instance_cannot_fetch_registration_token() {
    let bed = TestBed::new();
    let instance = provisioned_instance(&bed).await;
    assert!(instance.jit_config.is_some());
    let app = build_router(app_state(&bed));

    let resp = app
        .oneshot(
            Request::get("/api/v1/metadata/runner/registration-token")
                .header("authorization", format!("Bearer {}", instance.callback_token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test(flavor = "multi_thread")]
async fn registration_token_is_single_use() {
    let bed = TestBed::new();
    let instance = provisioned_instance(&bed).await;
    // Strip the JIT material to exercise the classic token flow.
    {
        use garm_schemas::{Instance, InstanceParent, OsArch, OsType};
        use uuid::Uuid;
        let record = Instance {
            id: Uuid::new_v4(),
            name: "garm-classic".into(),
            provider_id: None,
            parent: instance.parent,
            entity_id: instance.entity_id,
            provider_name: "mock".into(),
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            status: InstanceStatus::Running,
            runner_status: RunnerStatus::Installing,
            addresses: vec![],
            agent_id: None,
            jit_config: None,
            token_fetched: false,
            callback_token: "classic-token".into(),
            creation_attempts: 0,
            last_creation_error: None,
            status_messages: vec![],
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        bed.store.create_instance(record).unwrap();
    }
    let state = app_state(&bed);

    let request = || {
        Request::get("/api/v1/metadata/runner/registration-token")
            .header("authorization", "Bearer classic-token")
            .body(Body::empty())
            .unwrap()
    };

    let first = build_router(Arc::clone(&state))
        .oneshot(request())
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let body = first.into_body().collect().await.unwrap().to_bytes();
    assert!(std::str::from_utf8(&body).unwrap().starts_with("reg-token-"));

    let second = build_router(state).oneshot(request()).await.unwrap();
    assert_eq!(second.status(), StatusCode::GONE);
}

#[tokio::test(flavor = "multi_thread")]
async fn jit_config_file_is_served() {
    let bed = TestBed::new();
    let instance = provisioned_instance(&bed).await;
    let app = build_router(app_state(&bed));

    let resp = app
        .oneshot(
            Request::get("/api/v1/metadata/runner/jit-config/runner")
                .header("authorization", format!("Bearer {}", instance.callback_token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(
        &body[..],
        instance.jit_config.unwrap().get("runner").unwrap().as_bytes()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn status_reports_controller_and_entities() {
    let bed = TestBed::new();
    let _entity = bed.seed_repo_entity("acme", "svc");
    let app = build_router(app_state(&bed));

    let resp = app
        .oneshot(Request::get("/v1/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["controller_id"], bed.ctx.controller_id().to_string());
    assert_eq!(parsed["entities"][0]["path"], "acme/svc");
}
