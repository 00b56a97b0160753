//! Deleting an entity drives every instance to deletion; no orphans remain
//! at the provider or the forge.

use std::time::Duration;

use garm_events::{EventPayload, Operation};
use garm_store::Store;
use garm_testkit::TestBed;

#[tokio::test(flavor = "multi_thread")]
async fn entity_delete_drains_all_instances() {
    let bed = TestBed::new();
    let entity = bed.seed_repo_entity("acme", "svc");
    let pool = bed.seed_pool(&entity, 2, 3, &["self-hosted"]);

    let manager = bed.start_manager(entity.id);
    bed.wait_until("two running", Duration::from_secs(5), || {
        bed.running_count(pool.id) == 2
    })
    .await;
    let agent_ids: Vec<i64> = bed
        .store
        .list_pool_instances(pool.id)
        .iter()
        .filter_map(|i| i.agent_id)
        .collect();
    assert_eq!(agent_ids.len(), 2);

    // Admin deletes the entity; the store cascades config, the event tells
    // the manager to drain.
    let record = bed.store.get_entity(entity.id).unwrap();
    bed.store.delete_entity(entity.id).unwrap();
    bed.publish(Operation::Delete, EventPayload::Entity(record));

    bed.wait_until("all instances gone", Duration::from_secs(10), || {
        bed.store.list_entity_instances(entity.id).is_empty()
            && bed.provider.instance_count() == 0
    })
    .await;

    // Runners were deregistered at the forge on the way out.
    {
        let forge = bed.forge_state.lock().unwrap();
        for id in &agent_ids {
            assert!(forge.removed_runners.contains(id), "agent {id} deregistered");
        }
    }

    // The manager stops itself once drained.
    bed.wait_until("manager finished", Duration::from_secs(5), || {
        manager.is_finished()
    })
    .await;

    // Belt and braces: a reconciler pass finds nothing left to clean.
    bed.reconcile_now().await;
    assert_eq!(bed.provider.instance_count(), 0);
}
