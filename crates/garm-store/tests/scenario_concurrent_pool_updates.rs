//! Two concurrent updates of the same pool serialize: the final state is
//! one of the two sequential outcomes, never a blend.

use std::sync::Arc;

use chrono::Utc;
use garm_schemas::{
    AuthKind, EntityKind, ForgeCredentials, ForgeEndpoint, ForgeEntity, ForgeKind, OsArch, OsType,
    PatCredentials, Pool, PoolBalancerType, PoolManagerStatus,
};
use garm_store::{MemoryStore, Store};
use uuid::Uuid;

fn seed(store: &MemoryStore) -> Pool {
    let endpoint = ForgeEndpoint {
        name: "github.com".into(),
        description: String::new(),
        kind: ForgeKind::Github,
        base_url: "https://github.com".into(),
        api_base_url: "https://api.github.com".into(),
        upload_base_url: None,
        ca_cert_bundle: None,
    };
    store.create_endpoint(endpoint.clone()).unwrap();
    store
        .create_credentials(ForgeCredentials {
            id: 0,
            name: "c1".into(),
            description: String::new(),
            endpoint,
            auth_kind: AuthKind::Pat,
            pat: Some(PatCredentials {
                token: "t".into(),
            }),
            app: None,
        })
        .unwrap();
    let entity = ForgeEntity {
        id: Uuid::new_v4(),
        kind: EntityKind::Repository,
        owner: "acme".into(),
        name: Some("svc".into()),
        credentials_name: "c1".into(),
        endpoint_name: "github.com".into(),
        webhook_secret: "s".into(),
        balancer: PoolBalancerType::RoundRobin,
        pool_manager_status: PoolManagerStatus::default(),
    };
    store.create_entity(entity.clone()).unwrap();
    let pool = Pool {
        id: Uuid::new_v4(),
        entity_id: entity.id,
        provider_name: "mock".into(),
        image: "ubuntu:22.04".into(),
        flavor: "default".into(),
        os_type: OsType::Linux,
        os_arch: OsArch::Amd64,
        tags: vec!["self-hosted".into()],
        min_idle_runners: 1,
        max_runners: 4,
        enabled: true,
        priority: 0,
        extra_specs: serde_json::json!({}),
        runner_bootstrap_timeout_mins: 20,
        runner_prefix: "garm".into(),
        template_id: None,
        failure_reason: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    store.create_pool(pool.clone()).unwrap();
    pool
}

#[test]
fn concurrent_updates_serialize() {
    let store = Arc::new(MemoryStore::new());
    let pool = seed(&store);

    // Writer A: min_idle=2, image jammy. Writer B: min_idle=3, image noble.
    let mut a = pool.clone();
    a.min_idle_runners = 2;
    a.image = "ubuntu:22.04-jammy".into();
    let mut b = pool.clone();
    b.min_idle_runners = 3;
    b.image = "ubuntu:24.04-noble".into();

    let store_a = Arc::clone(&store);
    let store_b = Arc::clone(&store);
    let ta = std::thread::spawn(move || store_a.update_pool(a).unwrap());
    let tb = std::thread::spawn(move || store_b.update_pool(b).unwrap());
    ta.join().unwrap();
    tb.join().unwrap();

    let final_pool = store.get_pool(pool.id).unwrap();
    let outcome = (final_pool.min_idle_runners, final_pool.image.as_str());
    assert!(
        outcome == (2, "ubuntu:22.04-jammy") || outcome == (3, "ubuntu:24.04-noble"),
        "final state must equal one sequential ordering, got {outcome:?}"
    );
}
