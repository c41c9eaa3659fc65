//! The periodic scheduling pass.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde_yaml::{Mapping, Value};

use crate::error::Result;
use crate::registry::{
    lifecycle, Device, DeviceHealth, DeviceState, Job, JobId, JobState, RequestedTarget, Registry,
    Transaction,
};
use crate::render::DeviceRenderer;
use crate::scheduler::health::needs_health_check;
use crate::scheduler::matcher;
use crate::scheduler::multinode::MULTINODE_PROTOCOL;

/// Submitter recorded on synthesized health-check jobs.
pub const HEALTH_CHECK_SUBMITTER: &str = "lab-health";

#[derive(Debug, Clone, Default)]
pub struct TickOptions {
    pub shuffle_devices: bool,
}

/// What one tick changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub health_checks: Vec<JobId>,
    pub scheduled: Vec<JobId>,
    pub groups_ready: Vec<String>,
    pub timed_out: Vec<JobId>,
    pub invalid_devices: Vec<String>,
}

/// Run one scheduling pass: health checks first, then queued jobs in order,
/// then multinode groups that are fully reserved, then queue timeouts.
///
/// Each stage commits on its own, a failure in one leaves the earlier ones in
/// place.
pub fn schedule<R: Registry>(
    registry: &R,
    renderer: &dyn DeviceRenderer,
    options: &TickOptions,
    now: DateTime<Utc>,
) -> Result<TickReport> {
    let mut report = TickReport::default();

    let device_types: Vec<String> =
        registry.read(|tx| tx.device_types().into_iter().map(|dt| dt.name.clone()).collect())?;
    for device_type in device_types {
        registry.transaction(|tx| {
            schedule_health_checks(tx, &device_type, renderer, now, &mut report)
        })?;
    }

    report.scheduled = registry.transaction(|tx| schedule_jobs(tx, options))?;
    report.groups_ready = registry.transaction(|tx| transition_multinode_jobs(tx))?;
    report.timed_out = registry.transaction(|tx| check_queue_timeout(tx, now))?;

    if !report.scheduled.is_empty() || !report.health_checks.is_empty() {
        tracing::info!(
            scheduled = report.scheduled.len(),
            health_checks = report.health_checks.len(),
            "Scheduling tick done"
        );
    }
    Ok(report)
}

/// Online and below its job limit.
fn worker_available(tx: &dyn Transaction, worker: &str) -> bool {
    tx.worker(worker)
        .map(|w| w.is_online() && !w.overused(tx.busy_devices_on_worker(worker)))
        .unwrap_or(false)
}

fn mark_bad(tx: &mut dyn Transaction, hostname: &str, reason: &str) -> Result<()> {
    tx.device_mut(hostname)?.set_health(DeviceHealth::Bad)?;
    tracing::warn!(device = %hostname, reason, "Device marked bad");
    Ok(())
}

fn schedule_health_checks(
    tx: &mut dyn Transaction,
    device_type: &str,
    renderer: &dyn DeviceRenderer,
    now: DateTime<Utc>,
    report: &mut TickReport,
) -> Result<()> {
    let Some(policy) = tx.device_type(device_type)?.active_policy().cloned() else {
        return Ok(());
    };
    let hosts: Vec<String> = tx
        .devices_of_type(device_type)
        .into_iter()
        .filter(|d| d.state() == DeviceState::Idle)
        .filter(|d| {
            matches!(
                d.health(),
                DeviceHealth::Good | DeviceHealth::Unknown | DeviceHealth::Looping
            )
        })
        .map(|d| d.hostname.clone())
        .collect();

    for hostname in hosts {
        let device = tx.device(&hostname)?;
        if !worker_available(&*tx, &device.worker) {
            tracing::debug!(device = %hostname, worker = %device.worker, "Skipping health check, worker unavailable");
            continue;
        }
        if !needs_health_check(device, Some(&policy), now) {
            continue;
        }
        if let Err(e) = renderer.render(device, None) {
            mark_bad(tx, &hostname, &format!("Invalid device configuration: {}", e))?;
            report.invalid_devices.push(hostname);
            continue;
        }
        let definition: Mapping = match serde_yaml::from_str(&policy.definition) {
            Ok(definition) => definition,
            Err(e) => {
                mark_bad(tx, &hostname, &format!("Invalid health check: {}", e))?;
                report.invalid_devices.push(hostname);
                continue;
            }
        };
        let description = definition
            .get("job_name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Health check for {}", hostname));
        let exclusive = device.is_exclusive;

        let job = Job::new(
            HEALTH_CHECK_SUBMITTER,
            description,
            RequestedTarget::Device(hostname.clone()),
            policy.definition.clone(),
        )
        .health_check()
        .exclusive(exclusive);
        let job_id = tx.insert_job(job);
        if !lifecycle::try_reserve(tx, job_id, &hostname)? {
            return Err(crate::error::SchedulerError::Conflict(format!(
                "health check {} could not reserve {}",
                job_id, hostname
            )));
        }
        tracing::info!(job_id, device = %hostname, "Health check scheduled");
        report.health_checks.push(job_id);
    }
    Ok(())
}

/// Queue order: health checks, then priority (highest first), submit time,
/// target group and id.
fn queue_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    b.health_check
        .cmp(&a.health_check)
        .then(b.priority.cmp(&a.priority))
        .then(a.submit_time.cmp(&b.submit_time))
        .then(a.target_group.cmp(&b.target_group))
        .then(a.id.cmp(&b.id))
}

fn schedule_jobs(tx: &mut dyn Transaction, options: &TickOptions) -> Result<Vec<JobId>> {
    let mut queue: Vec<Job> = tx
        .jobs_in_state(JobState::Submitted)
        .into_iter()
        .filter(|j| !j.dynamic_connection() && j.actual_device.is_none())
        .cloned()
        .collect();
    queue.sort_by(queue_order);

    let mut scheduled = Vec::new();
    for job in queue {
        let mut candidates: Vec<Device> = {
            let view: &dyn Transaction = &*tx;
            view.devices()
                .into_iter()
                .filter(|d| matcher::is_eligible(d, &job) && worker_available(view, &d.worker))
                .cloned()
                .collect()
        };
        if options.shuffle_devices {
            candidates.shuffle(&mut rand::thread_rng());
        }
        let Some(device) = matcher::select_device(&job, &candidates) else {
            continue;
        };
        if lifecycle::try_reserve(tx, job.id, &device.hostname)? {
            tracing::info!(job_id = job.id, device = %device.hostname, "Job matched");
            scheduled.push(job.id);
        }
    }
    Ok(scheduled)
}

/// Move every multinode group whose members all hold a device to SCHEDULED,
/// telling each member which job plays which role.
fn transition_multinode_jobs(tx: &mut dyn Transaction) -> Result<Vec<String>> {
    let groups: BTreeSet<String> = tx
        .jobs_in_state(JobState::Scheduling)
        .into_iter()
        .filter_map(|j| j.target_group.clone())
        .collect();

    let mut ready = Vec::new();
    for group in groups {
        let members: Vec<Job> = tx.group_members(&group).into_iter().cloned().collect();
        let complete = members.iter().all(|j| {
            j.state() == JobState::Scheduling
                || (j.dynamic_connection() && j.state() == JobState::Submitted)
        });
        if !complete {
            continue;
        }

        let roles: Mapping = members
            .iter()
            .filter(|j| !j.dynamic_connection())
            .map(|j| {
                (
                    Value::from(j.id.to_string()),
                    Value::from(j.role.clone().unwrap_or_default()),
                )
            })
            .collect();
        for member in &members {
            let mut definition: Mapping = serde_yaml::from_str(&member.definition)?;
            if let Some(Value::Mapping(params)) = definition
                .get_mut("protocols")
                .and_then(|p| p.get_mut(MULTINODE_PROTOCOL))
            {
                params.insert("roles".into(), Value::Mapping(roles.clone()));
            }
            tx.job_mut(member.id)?.definition = serde_yaml::to_string(&definition)?;
            lifecycle::go_scheduled(tx, member.id, None)?;
        }
        tracing::info!(group = %group, size = members.len(), "Multinode group scheduled");
        ready.push(group);
    }
    Ok(ready)
}

fn check_queue_timeout(tx: &mut dyn Transaction, now: DateTime<Utc>) -> Result<Vec<JobId>> {
    let expired: Vec<JobId> = tx
        .jobs_in_state(JobState::Submitted)
        .into_iter()
        .filter(|j| {
            j.queue_timeout
                .and_then(|t| chrono::Duration::from_std(t).ok())
                .and_then(|t| j.submit_time.checked_add_signed(t))
                .is_some_and(|deadline| deadline < now)
        })
        .map(|j| j.id)
        .collect();

    let mut canceled = Vec::new();
    for job_id in expired {
        if tx.job(job_id)?.state() != JobState::Submitted {
            continue;
        }
        tx.job_mut(job_id)?.failure_comment = Some("Canceled after queue timeout".to_string());
        tracing::info!(job_id, "Queue timeout reached");
        canceled.extend(lifecycle::go_canceling(tx, job_id, true)?);
    }
    Ok(canceled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Priority;

    #[test]
    fn health_checks_sort_first_then_priority() {
        let ordinary = Job::new("a", "x", RequestedTarget::DeviceType("qemu".into()), "")
            .with_priority(Priority::HIGH);
        let hc = Job::new("lab-health", "hc", RequestedTarget::Device("q1".into()), "").health_check();
        let low = Job::new("a", "x", RequestedTarget::DeviceType("qemu".into()), "")
            .with_priority(Priority::LOW);
        let mut jobs = vec![low.clone(), ordinary.clone(), hc.clone()];
        jobs.sort_by(queue_order);
        assert!(jobs[0].health_check);
        assert_eq!(jobs[1].priority, Priority::HIGH);
        assert_eq!(jobs[2].priority, Priority::LOW);
    }
}
