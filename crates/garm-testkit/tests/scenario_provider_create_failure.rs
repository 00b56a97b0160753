//! Provider create failures: backoff, retry budget, pool failure reason,
//! and recovery after a configuration change.

use std::time::Duration;

use garm_events::{EventPayload, Operation};
use garm_store::Store;
use garm_testkit::TestBed;

#[tokio::test(flavor = "multi_thread")]
async fn create_failures_exhaust_budget_then_pool_records_failure() {
    let bed = TestBed::new();
    let entity = bed.seed_repo_entity("acme", "svc");
    let pool = bed.seed_pool(&entity, 1, 2, &["self-hosted"]);

    bed.provider.fail_next_creates(5);
    let manager = bed.start_manager(entity.id);

    bed.wait_until("pool records failure reason", Duration::from_secs(10), || {
        bed.store
            .get_pool(pool.id)
            .map(|p| p.failure_reason.is_some())
            .unwrap_or(false)
    })
    .await;

    // Exactly the retry budget was spent.
    assert_eq!(bed.provider.create_calls(), 5);

    // And retries have stopped.
    bed.assert_holds("no further create attempts", Duration::from_millis(500), || {
        bed.provider.create_calls() == 5
    })
    .await;

    // Provider trouble does not degrade the manager itself.
    let stored = bed.store.get_entity(entity.id).unwrap();
    assert!(stored.pool_manager_status.running);

    // Admin touches the pool config; the retry budget restarts against the
    // now-healthy provider.
    bed.store.set_pool_failure_reason(pool.id, None).unwrap();
    let updated = bed.store.get_pool(pool.id).unwrap();
    bed.publish(Operation::Update, EventPayload::Pool(updated));

    bed.wait_until("instance finally running", Duration::from_secs(10), || {
        bed.running_count(pool.id) == 1
    })
    .await;

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failure_recovers_within_budget() {
    let bed = TestBed::new();
    let entity = bed.seed_repo_entity("acme", "svc");
    let pool = bed.seed_pool(&entity, 1, 2, &["self-hosted"]);

    bed.provider.fail_next_creates(2);
    let manager = bed.start_manager(entity.id);

    bed.wait_until("recovers after two failures", Duration::from_secs(10), || {
        bed.running_count(pool.id) == 1
    })
    .await;
    assert_eq!(bed.provider.create_calls(), 3);
    assert!(bed.store.get_pool(pool.id).unwrap().failure_reason.is_none());

    manager.shutdown().await;
}
