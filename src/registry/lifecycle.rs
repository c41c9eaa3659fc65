//! Job and device state transitions.
//!
//! Each function runs inside a caller-provided transaction, re-reads the rows
//! it touches and refuses (or no-ops) when they no longer match. Functions that
//! return `bool` report whether anything changed; a repeated call is a no-op.

use chrono::Utc;

use crate::error::{Result, SchedulerError};
use crate::registry::{
    Device, DeviceHealth, HealthReport, Job, JobHealth, JobId, JobState, Transaction,
};
use crate::scheduler::matcher;

/// Reserve `hostname` for a submitted job if both rows still allow it.
pub fn try_reserve(tx: &mut dyn Transaction, job_id: JobId, hostname: &str) -> Result<bool> {
    let job = tx.job(job_id)?;
    if job.state() != JobState::Submitted || job.actual_device.is_some() {
        tracing::debug!(job_id, state = %job.state(), "Job no longer waiting for a device");
        return Ok(false);
    }
    let device = tx.device(hostname)?;
    if !matcher::device_matches(job, device) {
        tracing::debug!(job_id, device = %hostname, state = %device.state(), "Device no longer available");
        return Ok(false);
    }
    if job.is_multinode() {
        go_scheduling(tx, job_id, hostname)
    } else {
        go_scheduled(tx, job_id, Some(hostname))
    }
}

/// Multinode members hold their device in SCHEDULING until the whole group is reserved.
pub fn go_scheduling(tx: &mut dyn Transaction, job_id: JobId, hostname: &str) -> Result<bool> {
    if tx.job(job_id)?.state() >= JobState::Scheduling {
        return Ok(false);
    }
    tx.device_mut(hostname)?.reserve(job_id)?;
    let job = tx.job_mut(job_id)?;
    job.advance(JobState::Scheduling)?;
    job.actual_device = Some(hostname.to_string());
    Ok(true)
}

/// Move a job to SCHEDULED, reserving `hostname` when given. Without a hostname
/// the job must already hold a device, unless it is a dynamic connection.
pub fn go_scheduled(tx: &mut dyn Transaction, job_id: JobId, hostname: Option<&str>) -> Result<bool> {
    let job = tx.job(job_id)?;
    if job.state() >= JobState::Scheduled {
        return Ok(false);
    }
    let needs_device = !job.dynamic_connection() && job.actual_device.is_none();
    match hostname {
        Some(hostname) => {
            tx.device_mut(hostname)?.reserve(job_id)?;
            tx.job_mut(job_id)?.actual_device = Some(hostname.to_string());
        }
        None if needs_device => {
            return Err(SchedulerError::Conflict(format!(
                "job {} has no reserved device",
                job_id
            )));
        }
        None => {}
    }
    tx.job_mut(job_id)?.advance(JobState::Scheduled)?;
    Ok(true)
}

/// The worker confirmed START.
pub fn go_running(tx: &mut dyn Transaction, job_id: JobId) -> Result<bool> {
    let job = tx.job(job_id)?;
    if job.state() >= JobState::Running {
        return Ok(false);
    }
    let device = if job.dynamic_connection() {
        None
    } else {
        job.actual_device.clone()
    };
    let job = tx.job_mut(job_id)?;
    job.advance(JobState::Running)?;
    job.start_time = Some(Utc::now());
    if let Some(hostname) = device {
        tx.device_mut(&hostname)?.start()?;
    }
    Ok(true)
}

/// Cancel a job. Jobs that never reached a worker finish immediately; the
/// others wait in CANCELING for the worker's END. With `cascade`, every
/// unfinished member of the job's multinode group is canceled too.
///
/// Returns the ids whose state changed.
pub fn go_canceling(tx: &mut dyn Transaction, job_id: JobId, cascade: bool) -> Result<Vec<JobId>> {
    let job = tx.job(job_id)?;
    let state = job.state();
    if state >= JobState::Canceling {
        return Ok(Vec::new());
    }
    let group = job.target_group.clone();

    match state {
        JobState::Submitted | JobState::Scheduling => {
            go_finished(tx, job_id, JobHealth::Canceled, false)?;
        }
        _ => tx.job_mut(job_id)?.advance(JobState::Canceling)?,
    }
    tracing::info!(job_id, from = %state, "Job canceled");

    let mut changed = vec![job_id];
    if cascade {
        if let Some(group) = group {
            changed.extend(cancel_group(tx, &group, job_id)?);
        }
    }
    Ok(changed)
}

fn cancel_group(tx: &mut dyn Transaction, group: &str, except: JobId) -> Result<Vec<JobId>> {
    let members: Vec<JobId> = tx
        .group_members(group)
        .into_iter()
        .map(|j| j.id)
        .filter(|id| *id != except)
        .collect();
    let mut changed = Vec::new();
    for member in members {
        changed.extend(go_canceling(tx, member, false)?);
    }
    Ok(changed)
}

/// Terminate a job with the given outcome and release its device.
///
/// A job that was CANCELING always ends CANCELED. A finished job is never
/// touched again.
pub fn go_finished(
    tx: &mut dyn Transaction,
    job_id: JobId,
    health: JobHealth,
    infrastructure_error: bool,
) -> Result<bool> {
    if health == JobHealth::Unknown {
        return Err(SchedulerError::Internal(
            "a job cannot finish with unknown health".to_string(),
        ));
    }
    let job = tx.job(job_id)?;
    if job.state().is_finished() {
        return Ok(false);
    }
    let outcome = if job.state() == JobState::Canceling {
        JobHealth::Canceled
    } else {
        health
    };
    let device = if job.dynamic_connection() {
        None
    } else {
        job.actual_device.clone()
    };
    let health_check = job.health_check;
    let essential = job.essential;
    let group = job.target_group.clone();
    let submit_time = job.submit_time;

    let now = Utc::now();
    let job = tx.job_mut(job_id)?;
    job.advance(JobState::Finished)?;
    job.set_health(outcome);
    job.start_time.get_or_insert(now);
    job.end_time = Some(now);
    tracing::info!(job_id, health = %outcome, "Job finished");

    if let Some(hostname) = device {
        let device = tx.device_mut(&hostname)?;
        if device.current_job() == Some(job_id) {
            let report = health_check.then_some(HealthReport {
                job_id,
                outcome,
                submit_time,
                end_time: now,
            });
            release_device(device, report, infrastructure_error)?;
        }
    }

    if outcome == JobHealth::Incomplete && essential {
        if let Some(group) = group {
            tracing::warn!(job_id, group = %group, "Essential role failed, canceling group");
            cancel_group(tx, &group, job_id)?;
        }
    }
    Ok(true)
}

fn release_device(device: &mut Device, report: Option<HealthReport>, infrastructure_error: bool) -> Result<()> {
    let previous = device.health();
    let state = device.release()?;

    match report {
        Some(report) => {
            let outcome = report.outcome;
            device.last_health_report = Some(report);
            device.jobs_since_health_check = 0;
            match previous {
                DeviceHealth::Good | DeviceHealth::Unknown | DeviceHealth::Bad => {
                    let next = match outcome {
                        JobHealth::Complete => DeviceHealth::Good,
                        JobHealth::Incomplete => DeviceHealth::Maintenance,
                        JobHealth::Canceled | JobHealth::Unknown => DeviceHealth::Bad,
                    };
                    device.set_health(next)?;
                }
                DeviceHealth::Looping if outcome == JobHealth::Incomplete => {
                    tracing::warn!(device = %device.hostname, "Looping health-check failed");
                }
                _ => {}
            }
        }
        None => {
            device.jobs_since_health_check += 1;
            if infrastructure_error && previous == DeviceHealth::Good {
                device.set_health(DeviceHealth::Unknown)?;
            }
        }
    }

    tracing::info!(
        device = %device.hostname,
        state = %state,
        from = %previous,
        health = %device.health(),
        "Device released"
    );
    Ok(())
}

/// The worker that runs (or would run) a job. Dynamic connections run on the
/// worker of their group's host role.
pub fn job_worker(tx: &dyn Transaction, job: &Job) -> Option<String> {
    let hostname = if job.dynamic_connection() {
        let group = job.target_group.as_deref()?;
        let host_role = job.host_role.as_deref()?;
        tx.group_members(group)
            .into_iter()
            .find(|m| m.role.as_deref() == Some(host_role))
            .and_then(|m| m.actual_device.clone())?
    } else {
        job.actual_device.clone()?
    };
    tx.device(&hostname).ok().map(|d| d.worker.clone())
}

/// The worker lost every job it was running: force those jobs to FINISHED
/// with a CANCELED outcome and free their devices.
pub fn force_worker_jobs_canceled(tx: &mut dyn Transaction, worker: &str, reason: &str) -> Result<Vec<JobId>> {
    let lost: Vec<JobId> = {
        let view: &dyn Transaction = &*tx;
        view.jobs_in_state(JobState::Running)
            .into_iter()
            .chain(view.jobs_in_state(JobState::Canceling))
            .filter(|j| job_worker(view, j).as_deref() == Some(worker))
            .map(|j| j.id)
            .collect()
    };
    for job_id in &lost {
        tx.job_mut(*job_id)?
            .failure_comment
            .get_or_insert_with(|| reason.to_string());
        go_canceling(tx, *job_id, true)?;
        go_finished(tx, *job_id, JobHealth::Canceled, false)?;
        tracing::warn!(job_id, worker = %worker, reason, "Job forced to canceled");
    }
    Ok(lost)
}

/// Admin override of a device's health.
pub fn set_device_health(tx: &mut dyn Transaction, hostname: &str, health: DeviceHealth) -> Result<()> {
    let device = tx.device_mut(hostname)?;
    let previous = device.health();
    if health == DeviceHealth::Retired {
        device.retire()?;
    } else {
        device.set_health(health)?;
    }
    tracing::info!(device = %hostname, from = %previous, to = %health, "Device health changed");
    Ok(())
}
