mod test_harness;

use chrono::{Duration, Utc};
use serde_yaml::Value;

use lab_scheduler::error::SchedulerError;
use lab_scheduler::registry::lifecycle;
use lab_scheduler::registry::{
    DeviceHealth, DeviceState, DeviceType, HealthCheckPolicy, HealthDenominator, JobHealth, JobState,
    Registry, Worker,
};
use lab_scheduler::render::BasicValidator;
use lab_scheduler::scheduler::{cancel_job, schedule, submit_job, TickOptions, HEALTH_CHECK_SUBMITTER};
use test_harness::*;

fn ordered() -> TickOptions {
    TickOptions {
        shuffle_devices: false,
    }
}

#[test]
fn test_untagged_job_prefers_device_with_fewest_extra_tags() {
    let registry = lab();
    set_online(&registry, &["w1", "w2"]);
    let ids = submit(&registry, &qemu_job("plain"));

    let report = schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), Utc::now()).unwrap();
    assert_eq!(report.scheduled, ids);

    let job = registry.job(ids[0]).unwrap();
    assert_eq!(job.state(), JobState::Scheduled);
    assert_eq!(job.actual_device.as_deref(), Some("q2"));
    assert_eq!(registry.device("q2").unwrap().state(), DeviceState::Reserved);
    assert_eq!(registry.device("q1").unwrap().state(), DeviceState::Idle);
}

#[test]
fn test_tagged_job_needs_tagged_device() {
    let registry = lab();
    set_online(&registry, &["w1"]);
    let ids = submit(
        &registry,
        "job_name: usb\ndevice_type: qemu\ntags: [usb]\nactions:\n- boot: {}\n",
    );
    schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), Utc::now()).unwrap();
    assert_eq!(registry.job(ids[0]).unwrap().actual_device.as_deref(), Some("q1"));

    // No device carries both tags: the job stays queued.
    let ids = submit(
        &registry,
        "job_name: hdmi\ndevice_type: qemu\ntags: [usb, hdmi]\nactions:\n- boot: {}\n",
    );
    let report = schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), Utc::now()).unwrap();
    assert!(report.scheduled.is_empty());
    assert_eq!(registry.job(ids[0]).unwrap().state(), JobState::Submitted);
}

#[test]
fn test_higher_priority_wins_the_last_device() {
    let registry = lab();
    set_online(&registry, &["w1"]);
    registry
        .transaction(|tx| tx.device_mut("q2")?.go_offline())
        .unwrap();

    let low = submit(
        &registry,
        "job_name: low\ndevice_type: qemu\npriority: low\nactions:\n- boot: {}\n",
    )[0];
    let high = submit(
        &registry,
        "job_name: high\ndevice_type: qemu\npriority: high\nactions:\n- boot: {}\n",
    )[0];

    schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), Utc::now()).unwrap();
    assert_eq!(registry.job(high).unwrap().actual_device.as_deref(), Some("q1"));
    assert_eq!(registry.job(low).unwrap().state(), JobState::Submitted);
}

#[test]
fn test_offline_worker_gets_nothing() {
    let registry = lab();
    let ids = submit(&registry, &qemu_job("waiting"));
    let report = schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), Utc::now()).unwrap();
    assert!(report.scheduled.is_empty());
    assert_eq!(registry.job(ids[0]).unwrap().state(), JobState::Submitted);
}

#[test]
fn test_job_limit_caps_busy_devices_per_worker() {
    let registry = lab();
    registry
        .transaction(|tx| {
            tx.upsert_worker(Worker::new("w1").with_job_limit(1));
            Ok(())
        })
        .unwrap();
    set_online(&registry, &["w1"]);
    submit(&registry, &qemu_job("one"));
    submit(&registry, &qemu_job("two"));

    let report = schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), Utc::now()).unwrap();
    assert_eq!(report.scheduled.len(), 1);
}

#[test]
fn test_multinode_group_scheduled_together_with_roles() {
    let registry = lab();
    set_online(&registry, &["w1", "w2"]);
    let ids = submit(&registry, CLIENT_SERVER);
    assert_eq!(ids.len(), 3);

    let report = schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), Utc::now()).unwrap();
    assert_eq!(report.groups_ready.len(), 1);

    for id in &ids {
        let job = registry.job(*id).unwrap();
        assert_eq!(job.state(), JobState::Scheduled);
        let definition: Value = serde_yaml::from_str(&job.definition).unwrap();
        let roles = definition["protocols"]["lava-multinode"]["roles"]
            .as_mapping()
            .unwrap();
        assert_eq!(roles.len(), 3);
        assert_eq!(roles.get(id.to_string()).and_then(Value::as_str), job.role.as_deref());
    }
    let devices: Vec<String> = ids
        .iter()
        .map(|id| registry.job(*id).unwrap().actual_device.unwrap())
        .collect();
    assert_eq!(devices, vec!["q2", "q1", "b1"]);
}

#[test]
fn test_incomplete_group_holds_reserved_members() {
    let registry = lab();
    set_online(&registry, &["w1"]);
    let ids = submit(&registry, CLIENT_SERVER);

    let report = schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), Utc::now()).unwrap();
    assert!(report.groups_ready.is_empty());

    assert_eq!(registry.job(ids[0]).unwrap().state(), JobState::Scheduling);
    assert_eq!(registry.job(ids[1]).unwrap().state(), JobState::Scheduling);
    assert_eq!(registry.job(ids[2]).unwrap().state(), JobState::Submitted);
    assert_eq!(registry.device("q1").unwrap().state(), DeviceState::Reserved);

    // The server's worker shows up: the whole group moves on.
    set_online(&registry, &["w2"]);
    let report = schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), Utc::now()).unwrap();
    assert_eq!(report.groups_ready.len(), 1);
    assert!(ids
        .iter()
        .all(|id| registry.job(*id).unwrap().state() == JobState::Scheduled));
}

#[test]
fn test_canceling_a_member_cancels_the_group() {
    let registry = lab();
    set_online(&registry, &["w1"]);
    let ids = submit(&registry, CLIENT_SERVER);
    schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), Utc::now()).unwrap();

    cancel_job(registry.as_ref(), ids[2]).unwrap();
    for id in &ids {
        let job = registry.job(*id).unwrap();
        assert_eq!(job.state(), JobState::Finished, "job {}", id);
        assert_eq!(job.health(), JobHealth::Canceled);
    }
    assert_eq!(registry.device("q1").unwrap().state(), DeviceState::Idle);
    assert_eq!(registry.device("q2").unwrap().state(), DeviceState::Idle);
    assert!(cancel_job(registry.as_ref(), ids[0]).is_err());
}

fn with_health_checks(registry: &lab_scheduler::registry::MemoryRegistry, denominator: HealthDenominator) {
    registry
        .transaction(|tx| {
            tx.insert_device_type(DeviceType::new("qemu").with_health_check(HealthCheckPolicy {
                definition: "job_name: qemu health\ndevice_type: qemu\nactions:\n- boot: {}\n".to_string(),
                frequency: 24,
                denominator,
                disabled: false,
            }));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_health_checks_reserve_devices_before_queued_jobs() {
    let registry = lab();
    with_health_checks(&registry, HealthDenominator::Hours);
    set_online(&registry, &["w1"]);
    let queued = submit(&registry, &qemu_job("queued"))[0];

    let report = schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), Utc::now()).unwrap();
    assert_eq!(report.health_checks.len(), 2);
    assert!(report.scheduled.is_empty());
    assert_eq!(registry.job(queued).unwrap().state(), JobState::Submitted);

    for id in &report.health_checks {
        let job = registry.job(*id).unwrap();
        assert!(job.health_check);
        assert_eq!(job.submitter, HEALTH_CHECK_SUBMITTER);
        assert_eq!(job.description, "qemu health");
        assert_eq!(job.state(), JobState::Scheduled);
    }

    // Passing the check frees the device and leaves it GOOD; no new check is due.
    let first = report.health_checks[0];
    let hostname = registry.job(first).unwrap().actual_device.unwrap();
    registry
        .transaction(|tx| {
            lifecycle::go_running(tx, first)?;
            lifecycle::go_finished(tx, first, JobHealth::Complete, false)
        })
        .unwrap();
    let device = registry.device(&hostname).unwrap();
    assert_eq!(device.health(), DeviceHealth::Good);
    assert_eq!(device.state(), DeviceState::Idle);
    assert!(device.last_health_report.is_some());

    let report = schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), Utc::now()).unwrap();
    assert!(report.health_checks.is_empty());
    assert_eq!(report.scheduled, vec![queued]);
    assert_eq!(registry.job(queued).unwrap().actual_device, Some(hostname));
}

#[test]
fn test_unrenderable_device_is_marked_bad() {
    let registry = lab();
    with_health_checks(&registry, HealthDenominator::Jobs);
    set_online(&registry, &["w1"]);

    let report = schedule(registry.as_ref(), &StaticRenderer::broken(["q1"]), &ordered(), Utc::now()).unwrap();
    assert_eq!(report.invalid_devices, vec!["q1".to_string()]);
    assert_eq!(report.health_checks.len(), 1);
    assert_eq!(registry.device("q1").unwrap().health(), DeviceHealth::Bad);
    assert_eq!(registry.device("q1").unwrap().state(), DeviceState::Idle);
}

#[test]
fn test_maintenance_device_is_skipped() {
    let registry = lab();
    with_health_checks(&registry, HealthDenominator::Hours);
    set_online(&registry, &["w1"]);
    registry
        .transaction(|tx| {
            lifecycle::set_device_health(tx, "q1", DeviceHealth::Maintenance)?;
            lifecycle::set_device_health(tx, "q2", DeviceHealth::Maintenance)
        })
        .unwrap();
    let queued = submit(&registry, &qemu_job("queued"))[0];

    let report = schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), Utc::now()).unwrap();
    assert!(report.health_checks.is_empty());
    assert!(report.scheduled.is_empty());
    assert_eq!(registry.job(queued).unwrap().state(), JobState::Submitted);
}

#[test]
fn test_queue_timeout_cancels_waiting_job() {
    let registry = lab();
    let id = submit(
        &registry,
        "job_name: impatient\ndevice_type: qemu\ntimeouts:\n  queue: {seconds: 30}\nactions:\n- boot: {}\n",
    )[0];

    let report = schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), Utc::now()).unwrap();
    assert!(report.timed_out.is_empty());

    let later = Utc::now() + Duration::seconds(31);
    let report = schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), later).unwrap();
    assert_eq!(report.timed_out, vec![id]);
    let job = registry.job(id).unwrap();
    assert_eq!(job.state(), JobState::Finished);
    assert_eq!(job.health(), JobHealth::Canceled);
    assert!(job.failure_comment.unwrap().contains("queue timeout"));
}

#[test]
fn test_exact_target_ignores_other_devices() {
    let registry = lab();
    set_online(&registry, &["w1"]);
    let id = submit(&registry, "job_name: pinned\ntarget: q1\nactions:\n- boot: {}\n")[0];
    schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), Utc::now()).unwrap();
    assert_eq!(registry.job(id).unwrap().actual_device.as_deref(), Some("q1"));
}

#[test]
fn test_huge_queue_timeout_never_expires() {
    let registry = lab();
    let id = submit(
        &registry,
        "job_name: patient\ndevice_type: qemu\ntimeouts:\n  queue: {days: 100000000}\nactions:\n- boot: {}\n",
    )[0];

    let later = Utc::now() + Duration::days(365);
    let report = schedule(registry.as_ref(), &StaticRenderer::default(), &ordered(), later).unwrap();
    assert!(report.timed_out.is_empty());
    assert_eq!(registry.job(id).unwrap().state(), JobState::Submitted);

    let err = submit_job(
        registry.as_ref(),
        &BasicValidator,
        "job_name: forever\ndevice_type: qemu\ntimeouts:\n  queue: {days: 1000000000000000}\nactions:\n- boot: {}\n",
        "tester",
        None,
    )
    .unwrap_err();
    assert!(matches!(err, SchedulerError::Submission(_)), "{}", err);
}
