//! Instances stuck in `creating` past the pool bootstrap window are aged
//! out and replaced.

use std::time::Duration;

use chrono::Utc;
use garm_schemas::{
    EventLevel, Instance, InstanceParent, InstanceStatus, OsArch, OsType, RunnerStatus,
};
use garm_store::Store;
use garm_testkit::TestBed;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread")]
async fn stuck_creating_instance_is_aged_out() {
    let bed = TestBed::new();
    let entity = bed.seed_repo_entity("acme", "svc");
    let pool = bed.seed_pool(&entity, 0, 2, &["self-hosted"]);

    // A create that died mid-flight 45 minutes ago (bootstrap window: 20).
    let stuck = Instance {
        id: Uuid::new_v4(),
        name: "garm-stuck".into(),
        provider_id: None,
        parent: InstanceParent::Pool(pool.id),
        entity_id: entity.id,
        provider_name: "mock".into(),
        os_type: OsType::Linux,
        os_arch: OsArch::Amd64,
        status: InstanceStatus::Creating,
        runner_status: RunnerStatus::Pending,
        addresses: vec![],
        agent_id: None,
        jit_config: None,
        token_fetched: false,
        callback_token: "tok".into(),
        creation_attempts: 1,
        last_creation_error: None,
        status_messages: vec![],
        created_at: Utc::now() - chrono::Duration::minutes(45),
        updated_at: Utc::now() - chrono::Duration::minutes(45),
    };
    bed.store.create_instance(stuck).unwrap();

    let manager = bed.start_manager(entity.id);

    bed.wait_until("stuck instance removed", Duration::from_secs(5), || {
        bed.store.get_instance("garm-stuck").is_err()
    })
    .await;

    let events = bed.store.list_entity_events(entity.id);
    assert!(events
        .iter()
        .any(|e| e.level == EventLevel::Warning && e.message.contains("aged out")));

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_creating_instance_is_left_alone() {
    let bed = TestBed::new();
    let entity = bed.seed_repo_entity("acme", "svc");
    let pool = bed.seed_pool(&entity, 0, 2, &["self-hosted"]);

    let fresh = Instance {
        id: Uuid::new_v4(),
        name: "garm-booting".into(),
        provider_id: None,
        parent: InstanceParent::Pool(pool.id),
        entity_id: entity.id,
        provider_name: "mock".into(),
        os_type: OsType::Linux,
        os_arch: OsArch::Amd64,
        status: InstanceStatus::Creating,
        runner_status: RunnerStatus::Pending,
        addresses: vec![],
        agent_id: None,
        jit_config: None,
        token_fetched: false,
        callback_token: "tok2".into(),
        creation_attempts: 1,
        last_creation_error: None,
        status_messages: vec![],
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    bed.store.create_instance(fresh).unwrap();

    let manager = bed.start_manager(entity.id);
    bed.assert_holds("still creating", Duration::from_millis(400), || {
        bed.store
            .get_instance("garm-booting")
            .map(|i| i.status == InstanceStatus::Creating)
            .unwrap_or(false)
    })
    .await;

    manager.shutdown().await;
}
