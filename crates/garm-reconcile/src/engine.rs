//! Three-way diff between recorded, provider-observed and forge-observed
//! views of one pool or scale set.

use chrono::{DateTime, Duration, Utc};
use garm_schemas::{labels, Instance, InstanceStatus, ProviderInstance};
use garm_forge::ForgeRunner;
use std::collections::HashSet;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Input / report
// ---------------------------------------------------------------------------

pub struct ReconcileInput<'a> {
    /// Store view.
    pub recorded: &'a [Instance],
    /// What the provider reports for this pool.
    pub provider_observed: &'a [ProviderInstance],
    /// Runners the forge reports for the owning entity.
    pub forge_runners: &'a [ForgeRunner],
    pub controller_id: Uuid,
    /// Grace window before a recorded-but-unobserved instance is given up on.
    pub bootstrap_timeout: Duration,
    pub now: DateTime<Utc>,
}

/// Classified divergence. Names and ids, never whole records — the driver
/// re-reads the store before acting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Recorded instances the provider does not know, older than the
    /// bootstrap window: the provider lost them or never created them.
    pub stale_recorded: Vec<String>,
    /// Provider instances with no record: orphans from a crashed create.
    pub provider_orphans: Vec<String>,
    /// Forge runners carrying our controller label with no record: agent ids
    /// to deregister.
    pub forge_orphans: Vec<i64>,
    pub in_sync: usize,
    pub recorded_total: usize,
    pub observed_total: usize,
    pub forge_total: usize,
}

pub fn is_clean(report: &ReconcileReport) -> bool {
    report.stale_recorded.is_empty()
        && report.provider_orphans.is_empty()
        && report.forge_orphans.is_empty()
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

pub fn reconcile(input: &ReconcileInput<'_>) -> ReconcileReport {
    let mut report = ReconcileReport {
        recorded_total: input.recorded.len(),
        observed_total: input.provider_observed.len(),
        forge_total: input.forge_runners.len(),
        ..Default::default()
    };

    let observed_names: HashSet<&str> = input
        .provider_observed
        .iter()
        .map(|p| p.name.as_str())
        .collect();
    let recorded_names: HashSet<&str> =
        input.recorded.iter().map(|i| i.name.as_str()).collect();

    for instance in input.recorded {
        if observed_names.contains(instance.name.as_str()) {
            report.in_sync += 1;
            continue;
        }
        // Already on a delete path; nothing for the reconciler to add.
        if matches!(
            instance.status,
            InstanceStatus::PendingDelete
                | InstanceStatus::PendingForceDelete
                | InstanceStatus::Deleting
                | InstanceStatus::Deleted
        ) {
            continue;
        }
        if input.now - instance.created_at > input.bootstrap_timeout {
            report.stale_recorded.push(instance.name.clone());
        }
    }

    for observed in input.provider_observed {
        if !recorded_names.contains(observed.name.as_str()) {
            report.provider_orphans.push(observed.name.clone());
        }
    }

    let controller_label = labels::controller_label(input.controller_id);
    for runner in input.forge_runners {
        if recorded_names.contains(runner.name.as_str()) {
            continue;
        }
        if runner.labels.iter().any(|l| l == &controller_label) {
            report.forge_orphans.push(runner.id);
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use garm_schemas::{
        InstanceParent, OsArch, OsType, ProviderInstanceStatus, RunnerStatus,
    };

    fn instance(name: &str, status: InstanceStatus, age_mins: i64) -> Instance {
        let created = Utc::now() - Duration::minutes(age_mins);
        Instance {
            id: Uuid::new_v4(),
            name: name.into(),
            provider_id: Some(format!("prov-{name}")),
            parent: InstanceParent::Pool(Uuid::new_v4()),
            entity_id: Uuid::new_v4(),
            provider_name: "mock".into(),
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            status,
            runner_status: RunnerStatus::Idle,
            addresses: vec![],
            agent_id: None,
            jit_config: None,
            token_fetched: false,
            callback_token: "t".into(),
            creation_attempts: 0,
            last_creation_error: None,
            status_messages: vec![],
            created_at: created,
            updated_at: created,
        }
    }

    fn observed(name: &str) -> ProviderInstance {
        ProviderInstance {
            provider_id: format!("prov-{name}"),
            name: name.into(),
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            addresses: vec![],
            status: ProviderInstanceStatus::Running,
            provider_fault: None,
        }
    }

    fn runner(id: i64, name: &str, labels: Vec<String>) -> ForgeRunner {
        ForgeRunner {
            id,
            name: name.into(),
            os: None,
            status: "online".into(),
            busy: false,
            labels,
        }
    }

    fn input<'a>(
        recorded: &'a [Instance],
        provider_observed: &'a [ProviderInstance],
        forge_runners: &'a [ForgeRunner],
        controller_id: Uuid,
    ) -> ReconcileInput<'a> {
        ReconcileInput {
            recorded,
            provider_observed,
            forge_runners,
            controller_id,
            bootstrap_timeout: Duration::minutes(20),
            now: Utc::now(),
        }
    }

    #[test]
    fn everything_in_sync_is_clean() {
        let recorded = vec![instance("a", InstanceStatus::Running, 60)];
        let observed_set = vec![observed("a")];
        let ctrl = Uuid::new_v4();
        let runners = vec![runner(1, "a", vec![labels::controller_label(ctrl)])];
        let report = reconcile(&input(&recorded, &observed_set, &runners, ctrl));
        assert!(is_clean(&report));
        assert_eq!(report.in_sync, 1);
    }

    #[test]
    fn recorded_unseen_past_deadline_is_stale() {
        let recorded = vec![instance("lost", InstanceStatus::Creating, 30)];
        let report = reconcile(&input(&recorded, &[], &[], Uuid::new_v4()));
        assert_eq!(report.stale_recorded, vec!["lost".to_string()]);
    }

    #[test]
    fn recorded_unseen_inside_deadline_is_left_alone() {
        let recorded = vec![instance("booting", InstanceStatus::Creating, 5)];
        let report = reconcile(&input(&recorded, &[], &[], Uuid::new_v4()));
        assert!(report.stale_recorded.is_empty());
    }

    #[test]
    fn deleting_instances_are_not_reported_stale() {
        let recorded = vec![instance("going", InstanceStatus::PendingDelete, 60)];
        let report = reconcile(&input(&recorded, &[], &[], Uuid::new_v4()));
        assert!(report.stale_recorded.is_empty());
    }

    #[test]
    fn provider_only_instance_is_an_orphan() {
        let observed_set = vec![observed("ghost")];
        let report = reconcile(&input(&[], &observed_set, &[], Uuid::new_v4()));
        assert_eq!(report.provider_orphans, vec!["ghost".to_string()]);
    }

    #[test]
    fn forge_runner_with_our_label_is_deregistered() {
        let ctrl = Uuid::new_v4();
        let runners = vec![
            runner(7, "ghost", vec![labels::controller_label(ctrl)]),
            runner(8, "human-runner", vec!["self-hosted".into()]),
        ];
        let report = reconcile(&input(&[], &[], &runners, ctrl));
        assert_eq!(report.forge_orphans, vec![7]);
    }

    #[test]
    fn foreign_controller_runner_is_left_alone() {
        let ctrl = Uuid::new_v4();
        let other = Uuid::new_v4();
        let runners = vec![runner(9, "theirs", vec![labels::controller_label(other)])];
        let report = reconcile(&input(&[], &[], &runners, ctrl));
        assert!(report.forge_orphans.is_empty());
    }
}
