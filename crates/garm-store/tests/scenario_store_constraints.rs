//! Referential and uniqueness constraints the orchestrator relies on.

use chrono::Utc;
use garm_schemas::{
    AuthKind, EntityKind, ForgeCredentials, ForgeEndpoint, ForgeEntity, ForgeKind, Instance,
    InstanceParent, InstanceStatus, OsArch, OsType, PatCredentials, Pool, PoolBalancerType,
    PoolManagerStatus, RunnerStatus,
};
use garm_store::{MemoryStore, Store, StoreError};
use uuid::Uuid;

fn endpoint() -> ForgeEndpoint {
    ForgeEndpoint {
        name: "github.com".into(),
        description: "public github".into(),
        kind: ForgeKind::Github,
        base_url: "https://github.com".into(),
        api_base_url: "https://api.github.com".into(),
        upload_base_url: Some("https://uploads.github.com".into()),
        ca_cert_bundle: None,
    }
}

fn credentials(name: &str) -> ForgeCredentials {
    ForgeCredentials {
        id: 0,
        name: name.into(),
        description: String::new(),
        endpoint: endpoint(),
        auth_kind: AuthKind::Pat,
        pat: Some(PatCredentials {
            token: "ghp_test".into(),
        }),
        app: None,
    }
}

fn entity(owner: &str, name: Option<&str>) -> ForgeEntity {
    ForgeEntity {
        id: Uuid::new_v4(),
        kind: match name {
            Some(_) => EntityKind::Repository,
            None => EntityKind::Organization,
        },
        owner: owner.into(),
        name: name.map(|n| n.to_string()),
        credentials_name: "c1".into(),
        endpoint_name: "github.com".into(),
        webhook_secret: "hunter2".into(),
        balancer: PoolBalancerType::RoundRobin,
        pool_manager_status: PoolManagerStatus::default(),
    }
}

fn pool(entity_id: Uuid) -> Pool {
    Pool {
        id: Uuid::new_v4(),
        entity_id,
        provider_name: "mock".into(),
        image: "ubuntu:22.04".into(),
        flavor: "default".into(),
        os_type: OsType::Linux,
        os_arch: OsArch::Amd64,
        tags: vec!["self-hosted".into(), "linux".into()],
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
    }
}

fn instance(name: &str, parent: InstanceParent, entity_id: Uuid) -> Instance {
    Instance {
        id: Uuid::new_v4(),
        name: name.into(),
        provider_id: None,
        parent,
        entity_id,
        provider_name: "mock".into(),
        os_type: OsType::Linux,
        os_arch: OsArch::Amd64,
        status: InstanceStatus::PendingCreate,
        runner_status: RunnerStatus::Pending,
        addresses: vec![],
        agent_id: None,
        jit_config: None,
        token_fetched: false,
        callback_token: Uuid::new_v4().to_string(),
        creation_attempts: 0,
        last_creation_error: None,
        status_messages: vec![],
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn seeded() -> (MemoryStore, ForgeEntity, Pool) {
    let store = MemoryStore::new();
    store.create_endpoint(endpoint()).unwrap();
    store.create_credentials(credentials("c1")).unwrap();
    let e = entity("acme", Some("svc"));
    store.create_entity(e.clone()).unwrap();
    let p = pool(e.id);
    store.create_pool(p.clone()).unwrap();
    (store, e, p)
}

#[test]
fn controller_id_is_stable() {
    let store = MemoryStore::new();
    assert_eq!(store.controller_id(), store.controller_id());
}

#[test]
fn entity_triple_unique_per_kind() {
    let (store, _, _) = seeded();
    // Same (endpoint, owner, name) repository again: conflict.
    let err = store.create_entity(entity("acme", Some("svc"))).unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    // Same owner as an organization: different kind, allowed.
    store.create_entity(entity("acme", None)).unwrap();
}

#[test]
fn entity_credentials_must_match_endpoint() {
    let store = MemoryStore::new();
    store.create_endpoint(endpoint()).unwrap();
    store.create_credentials(credentials("c1")).unwrap();
    let mut e = entity("acme", Some("svc"));
    e.endpoint_name = "gitea.internal".into();
    let err = store.create_entity(e).unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));
}

#[test]
fn instance_requires_existing_parent() {
    let (store, e, _) = seeded();
    let orphan = instance("garm-x", InstanceParent::Pool(Uuid::new_v4()), e.id);
    assert!(matches!(
        store.create_instance(orphan),
        Err(StoreError::Invalid(_))
    ));
    let no_scale_set = instance("garm-y", InstanceParent::ScaleSet(99), e.id);
    assert!(matches!(
        store.create_instance(no_scale_set),
        Err(StoreError::Invalid(_))
    ));
}

#[test]
fn instance_has_exactly_one_parent() {
    let (store, e, p) = seeded();
    let i = instance("garm-1", InstanceParent::Pool(p.id), e.id);
    store.create_instance(i).unwrap();
    let got = store.get_instance("garm-1").unwrap();
    assert_eq!(got.pool_id(), Some(p.id));
    assert_eq!(got.scale_set_id(), None);
}

#[test]
fn status_upsert_is_atomic_and_bumps_updated_at() {
    let (store, e, p) = seeded();
    let i = instance("garm-1", InstanceParent::Pool(p.id), e.id);
    let before = i.updated_at;
    store.create_instance(i).unwrap();
    store
        .set_instance_status("garm-1", InstanceStatus::Creating, None)
        .unwrap();
    let got = store.get_instance("garm-1").unwrap();
    assert_eq!(got.status, InstanceStatus::Creating);
    assert!(got.updated_at >= before);
}

#[test]
fn referenced_credentials_cannot_be_deleted() {
    let (store, _, _) = seeded();
    assert!(matches!(
        store.delete_credentials("c1"),
        Err(StoreError::Conflict(_))
    ));
}

#[test]
fn deleting_entity_cascades_pools() {
    let (store, e, p) = seeded();
    store.delete_entity(e.id).unwrap();
    assert!(matches!(store.get_pool(p.id), Err(StoreError::NotFound(_))));
}

#[test]
fn token_lookup_finds_instance() {
    let (store, e, p) = seeded();
    let i = instance("garm-1", InstanceParent::Pool(p.id), e.id);
    let token = i.callback_token.clone();
    store.create_instance(i).unwrap();
    assert_eq!(store.get_instance_by_token(&token).unwrap().name, "garm-1");
}
