//! Credential rotation: clients are rebuilt on the event, and a manager
//! degraded by auth failures recovers on the first successful forge call
//! after the rotation.

use std::time::Duration;

use garm_events::{EventPayload, Operation};
use garm_schemas::{PatCredentials, WorkflowJobAction};
use garm_store::Store;
use garm_testkit::{TestBed, TEST_PAT};

fn rotate_credentials(bed: &TestBed, new_token: &str) {
    let mut creds = bed.store.get_credentials("c1").unwrap();
    creds.pat = Some(PatCredentials {
        token: new_token.into(),
    });
    bed.store.update_credentials(creds.clone()).unwrap();
    bed.publish(Operation::Update, EventPayload::Credentials(creds));
}

#[tokio::test(flavor = "multi_thread")]
async fn rotation_rebuilds_clients() {
    let bed = TestBed::new();
    let entity = bed.seed_repo_entity("acme", "svc");
    let pool = bed.seed_pool(&entity, 1, 2, &["self-hosted"]);

    let manager = bed.start_manager(entity.id);
    bed.wait_until("one running", Duration::from_secs(5), || {
        bed.running_count(pool.id) == 1
    })
    .await;
    bed.simulate_pool_runners_idle(pool.id);
    let instance = bed
        .store
        .list_pool_instances(pool.id)
        .into_iter()
        .next()
        .unwrap();
    let agent_id = instance.agent_id.unwrap();
    let builds_before = bed.forge_factory.builds();

    // Rotate: forge accepts only the new PAT from now on.
    bed.forge_state.lock().unwrap().valid_token = "ghp_rotated".into();
    rotate_credentials(&bed, "ghp_rotated");

    // The next forge call (deregistration on job completion) succeeds with
    // the rebuilt client.
    assert!(manager.deliver_job(bed.job_event(
        WorkflowJobAction::Completed,
        1,
        &["self-hosted"],
        Some(&instance.name),
    )));
    bed.wait_until("instance deregistered and deleted", Duration::from_secs(5), || {
        bed.store.get_instance(&instance.name).is_err()
    })
    .await;

    assert!(bed
        .forge_state
        .lock()
        .unwrap()
        .removed_runners
        .contains(&agent_id));
    assert!(bed.forge_factory.builds() > builds_before, "client was rebuilt");

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_manager_recovers_after_rotation() {
    let bed = TestBed::new();
    let entity = bed.seed_repo_entity("acme", "svc");
    let pool = bed.seed_pool(&entity, 1, 2, &["self-hosted"]);

    let manager = bed.start_manager(entity.id);
    bed.wait_until("one running", Duration::from_secs(5), || {
        bed.running_count(pool.id) == 1
    })
    .await;
    bed.simulate_pool_runners_idle(pool.id);
    let instance = bed
        .store
        .list_pool_instances(pool.id)
        .into_iter()
        .next()
        .unwrap();

    // The PAT is revoked forge-side; GARM does not know yet.
    bed.forge_state.lock().unwrap().valid_token = "ghp_revoked_replacement".into();

    // The deregistration attempt hits 401 and degrades the manager.
    assert!(manager.deliver_job(bed.job_event(
        WorkflowJobAction::Completed,
        1,
        &["self-hosted"],
        Some(&instance.name),
    )));
    bed.wait_until("manager degrades to failed", Duration::from_secs(5), || {
        let e = bed.store.get_entity(entity.id).unwrap();
        !e.pool_manager_status.running && e.pool_manager_status.failure_reason.is_some()
    })
    .await;

    // Admin rotates the stored credentials to the new valid token. Policy:
    // the first successful forge call after the credentials event flips the
    // manager back to running.
    rotate_credentials(&bed, "ghp_revoked_replacement");
    bed.wait_until("manager recovers", Duration::from_secs(5), || {
        let e = bed.store.get_entity(entity.id).unwrap();
        e.pool_manager_status.running && e.pool_manager_status.failure_reason.is_none()
    })
    .await;

    // The stalled delete finishes once the manager is healthy again.
    bed.wait_until("stalled delete completes", Duration::from_secs(5), || {
        bed.store.get_instance(&instance.name).is_err()
    })
    .await;

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unrelated_token_still_works_before_rotation() {
    // Guard against accidental eager invalidation: without a rotation the
    // original PAT keeps working.
    let bed = TestBed::new();
    assert_eq!(bed.forge_state.lock().unwrap().valid_token, TEST_PAT);
}
