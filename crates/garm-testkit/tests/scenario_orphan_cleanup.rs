//! Reconciler: provider orphans are deleted, controller-labelled forge
//! orphans are deregistered, foreign runners are left alone.

use std::time::Duration;

use chrono::Utc;
use garm_schemas::{labels, EventLevel, InstanceStatus};
use garm_store::Store;
use garm_testkit::TestBed;

#[tokio::test(flavor = "multi_thread")]
async fn provider_orphan_is_deleted() {
    let bed = TestBed::new();
    let entity = bed.seed_repo_entity("acme", "svc");
    let pool = bed.seed_pool(&entity, 0, 5, &["self-hosted"]);

    bed.provider.inject_orphan(pool.id, "garm-ghost");
    assert!(bed.provider.has_instance("garm-ghost"));

    bed.reconcile_now().await;

    assert!(!bed.provider.has_instance("garm-ghost"));
    let events = bed.store.list_entity_events(entity.id);
    assert!(events
        .iter()
        .any(|e| e.level == EventLevel::Warning && e.message.contains("garm-ghost")));
}

#[tokio::test(flavor = "multi_thread")]
async fn labelled_forge_orphan_is_deregistered_and_foreign_runner_kept() {
    let bed = TestBed::new();
    let entity = bed.seed_repo_entity("acme", "svc");
    let _pool = bed.seed_pool(&entity, 0, 5, &["self-hosted"]);

    let (orphan_id, foreign_id) = {
        let mut forge = bed.forge_state.lock().unwrap();
        let orphan = forge.add_runner(
            "garm-lost",
            vec![
                "self-hosted".into(),
                labels::controller_label(bed.ctx.controller_id()),
            ],
        );
        let foreign = forge.add_runner("human-runner", vec!["self-hosted".into()]);
        (orphan, foreign)
    };

    bed.reconcile_now().await;

    let forge = bed.forge_state.lock().unwrap();
    assert!(forge.removed_runners.contains(&orphan_id));
    assert!(forge.runners.contains_key(&foreign_id), "foreign runner untouched");
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_recorded_instance_is_scheduled_for_delete() {
    let bed = TestBed::new();
    let entity = bed.seed_repo_entity("acme", "svc");
    let pool = bed.seed_pool(&entity, 0, 5, &["self-hosted"]);

    // A record the provider never heard of, well past the bootstrap window.
    let mut instance = {
        use garm_schemas::{Instance, InstanceParent, OsArch, OsType, RunnerStatus};
        use uuid::Uuid;
        Instance {
            id: Uuid::new_v4(),
            name: "garm-vanished".into(),
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
        }
    };
    bed.store.create_instance(instance.clone()).unwrap();

    bed.reconcile_now().await;

    instance = bed.store.get_instance("garm-vanished").unwrap();
    assert_eq!(instance.status, InstanceStatus::PendingDelete);

    // A pool manager tick would now finish the delete; prove the record is
    // deletable end to end.
    let manager = bed.start_manager(entity.id);
    bed.wait_until("vanished record removed", Duration::from_secs(5), || {
        bed.store.get_instance("garm-vanished").is_err()
    })
    .await;
    manager.shutdown().await;
}
