//! Scale-set coordination: session lifecycle, message application,
//! acknowledgement, and session refresh on conflict.

use std::sync::Arc;
use std::time::Duration;

use garm_scaleset::{ScaleSetJob, ScaleSetMessage, ScaleSetMessageBody, ScaleSetStatistics};
use garm_schemas::RunnerStatus;
use garm_store::Store;
use garm_testkit::{MockScaleSetApi, TestBed};

fn jobs_available(message_id: i64, request_ids: &[i64]) -> ScaleSetMessage {
    ScaleSetMessage {
        message_id,
        message_type: "RunnerScaleSetJobMessages".into(),
        body: ScaleSetMessageBody {
            statistics: ScaleSetStatistics {
                total_available_jobs: request_ids.len() as u32,
                ..Default::default()
            },
            jobs_available: request_ids
                .iter()
                .map(|id| ScaleSetJob {
                    runner_request_id: *id,
                    runner_name: None,
                    agent_id: None,
                })
                .collect(),
            ..Default::default()
        },
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn messages_scale_up_and_are_acknowledged() {
    let bed = TestBed::new();
    let entity = bed.seed_repo_entity("acme", "svc");
    let scale_set = bed.seed_scale_set(&entity, 10, 0, 3);

    let api = Arc::new(MockScaleSetApi::new());
    let coordinator = bed.start_coordinator(entity.id, Arc::clone(&api) as _);

    api.push_message(jobs_available(1, &[101, 102]));

    bed.wait_until("two scale set instances", Duration::from_secs(5), || {
        bed.store
            .list_scale_set_instances(scale_set.id)
            .iter()
            .filter(|i| i.status == garm_schemas::InstanceStatus::Running)
            .count()
            == 2
    })
    .await;

    assert_eq!(api.acquired(), vec![101, 102]);
    bed.wait_until("message acked", Duration::from_secs(2), || {
        api.acked().contains(&1)
    })
    .await;
    let stored = bed.store.get_scale_set(scale_set.id).unwrap();
    assert_eq!(stored.last_message_id, 1);
    assert!(stored.session_id.is_some(), "session handle persisted");

    // Completion flows the instances out again.
    let names: Vec<String> = bed
        .store
        .list_scale_set_instances(scale_set.id)
        .into_iter()
        .map(|i| i.name)
        .collect();
    api.push_message(ScaleSetMessage {
        message_id: 2,
        message_type: "RunnerScaleSetJobMessages".into(),
        body: ScaleSetMessageBody {
            jobs_completed: names
                .iter()
                .map(|n| ScaleSetJob {
                    runner_request_id: 0,
                    runner_name: Some(n.clone()),
                    agent_id: None,
                })
                .collect(),
            ..Default::default()
        },
    });

    bed.wait_until("scale set drained", Duration::from_secs(5), || {
        bed.store.list_scale_set_instances(scale_set.id).is_empty()
    })
    .await;

    coordinator.shutdown().await;
    assert!(api.sessions_deleted() >= 1, "session released politely");
    assert!(
        bed.store
            .get_scale_set(scale_set.id)
            .unwrap()
            .session_id
            .is_none(),
        "session handle cleared on release"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn max_runners_caps_acquisition() {
    let bed = TestBed::new();
    let entity = bed.seed_repo_entity("acme", "svc");
    let scale_set = bed.seed_scale_set(&entity, 11, 0, 2);

    let api = Arc::new(MockScaleSetApi::new());
    let coordinator = bed.start_coordinator(entity.id, Arc::clone(&api) as _);

    // Five jobs offered, capacity for two.
    api.push_message(jobs_available(1, &[201, 202, 203, 204, 205]));

    bed.wait_until("capacity filled", Duration::from_secs(5), || {
        bed.store.list_scale_set_instances(scale_set.id).len() == 2
    })
    .await;
    assert_eq!(api.acquired().len(), 2, "only what fits under max is acquired");

    bed.assert_holds("cap holds", Duration::from_millis(400), || {
        bed.store.list_scale_set_instances(scale_set.id).len() <= 2
    })
    .await;

    coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn conflict_refreshes_the_session() {
    let bed = TestBed::new();
    let entity = bed.seed_repo_entity("acme", "svc");
    let scale_set = bed.seed_scale_set(&entity, 12, 0, 2);

    let api = Arc::new(MockScaleSetApi::new());
    let coordinator = bed.start_coordinator(entity.id, Arc::clone(&api) as _);

    bed.wait_until("first session", Duration::from_secs(2), || {
        api.sessions_created() >= 1
    })
    .await;

    // The service answers 409; the worker must re-acquire, not fail.
    api.invalidate_next_poll();
    bed.wait_until("session re-acquired", Duration::from_secs(5), || {
        api.sessions_created() >= 2
    })
    .await;

    // Still healthy: a message after the refresh is applied.
    api.push_message(jobs_available(1, &[301]));
    bed.wait_until("instance after refresh", Duration::from_secs(5), || {
        !bed.store.list_scale_set_instances(scale_set.id).is_empty()
    })
    .await;

    coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn started_jobs_mark_runners_active() {
    let bed = TestBed::new();
    let entity = bed.seed_repo_entity("acme", "svc");
    let scale_set = bed.seed_scale_set(&entity, 13, 1, 2);

    let api = Arc::new(MockScaleSetApi::new());
    let coordinator = bed.start_coordinator(entity.id, Arc::clone(&api) as _);

    // min_idle warm capacity comes up without any message.
    bed.wait_until("warm instance", Duration::from_secs(5), || {
        bed.store
            .list_scale_set_instances(scale_set.id)
            .iter()
            .any(|i| i.status == garm_schemas::InstanceStatus::Running)
    })
    .await;
    let instance = bed
        .store
        .list_scale_set_instances(scale_set.id)
        .into_iter()
        .next()
        .unwrap();

    api.push_message(ScaleSetMessage {
        message_id: 1,
        message_type: "RunnerScaleSetJobMessages".into(),
        body: ScaleSetMessageBody {
            jobs_started: vec![ScaleSetJob {
                runner_request_id: 401,
                runner_name: Some(instance.name.clone()),
                agent_id: None,
            }],
            ..Default::default()
        },
    });

    bed.wait_until("runner active", Duration::from_secs(5), || {
        bed.store
            .get_instance(&instance.name)
            .map(|i| i.runner_status == RunnerStatus::Active)
            .unwrap_or(false)
    })
    .await;

    coordinator.shutdown().await;
}
