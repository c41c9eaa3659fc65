//! Submission ingress: one YAML definition in, one or more queued jobs out.

use std::time::Duration;

use serde_yaml::{Mapping, Value};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::registry::job::parse_timeout;
use crate::registry::{lifecycle, Job, JobId, Priority, Registry, RequestedTarget, Transaction, VlanRequest};
use crate::render::SubmissionValidator;
use crate::scheduler::multinode::{self, MULTINODE_PROTOCOL, VLAND_PROTOCOL};

/// Validate, split and queue a submission. All jobs are created in one
/// transaction; on any error nothing is created.
///
/// Returns the new ids, in `sub_id` order for multinode submissions.
pub fn submit_job<R: Registry>(
    registry: &R,
    validator: &dyn SubmissionValidator,
    definition: &str,
    submitter: &str,
    default_queue_timeout: Option<Duration>,
) -> Result<Vec<JobId>> {
    let submission: Mapping = serde_yaml::from_str(definition)
        .map_err(|e| SchedulerError::submission(format!("Invalid YAML: {}", e)))?;
    validator.validate(&submission)?;

    let mut jobs = if multinode::is_multinode(&submission) {
        let target_group = Uuid::new_v4().to_string();
        let split = multinode::split(&submission, &target_group)?;
        split
            .jobs()
            .map(|sub| {
                job_from_definition(&sub.definition, submitter)
                    .map(|job| job.in_group(&target_group, &sub.role, sub.sub_id))
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        vec![job_from_definition(&submission, submitter)?]
    };
    for job in &mut jobs {
        if job.queue_timeout.is_none() {
            job.queue_timeout = default_queue_timeout;
        }
    }

    let ids = registry.transaction(|tx| {
        for job in &jobs {
            check_target(tx, job)?;
        }
        Ok(jobs.into_iter().map(|job| tx.insert_job(job)).collect::<Vec<_>>())
    })?;
    tracing::info!(?ids, submitter, "Submission accepted");
    Ok(ids)
}

fn check_target(tx: &dyn Transaction, job: &Job) -> Result<()> {
    let found = match &job.requested {
        RequestedTarget::Device(hostname) => tx.device(hostname).map(|_| ()),
        RequestedTarget::DeviceType(name) => tx.device_type(name).map(|_| ()),
        RequestedTarget::Connection => Ok(()),
    };
    found.map_err(|e| SchedulerError::submission(e.to_string()))
}

/// Cancel a job and every unfinished member of its group.
pub fn cancel_job<R: Registry>(registry: &R, job_id: JobId) -> Result<Vec<JobId>> {
    registry.transaction(|tx| {
        let job = tx.job(job_id)?;
        if job.state().is_finished() {
            return Err(SchedulerError::Conflict(format!("job {} already finished", job_id)));
        }
        lifecycle::go_canceling(tx, job_id, true)
    })
}

fn job_from_definition(definition: &Mapping, submitter: &str) -> Result<Job> {
    let requested = if let Some(hostname) = definition.get("target").and_then(Value::as_str) {
        RequestedTarget::Device(hostname.to_string())
    } else if let Some(device_type) = definition.get("device_type").and_then(Value::as_str) {
        RequestedTarget::DeviceType(device_type.to_string())
    } else if definition.contains_key("connection") {
        RequestedTarget::Connection
    } else {
        return Err(SchedulerError::submission("device_type or target is required"));
    };
    let description = definition
        .get("job_name")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let protocols = definition.get("protocols");
    let params = protocols.and_then(|p| p.get(MULTINODE_PROTOCOL));

    let mut tags = string_list(definition.get("tags"), "tags")?;
    if let Some(params) = params {
        tags.extend(string_list(params.get("tags"), "tags")?);
    }

    let mut job = Job::new(
        submitter,
        description,
        requested,
        serde_yaml::to_string(definition)?,
    )
    .with_tags(tags)
    .with_vlans(vlans(protocols.and_then(|p| p.get(VLAND_PROTOCOL)))?)
    .exclusive(definition.get("exclusive").and_then(Value::as_bool).unwrap_or(false));

    if let Some(priority) = definition.get("priority") {
        job = job.with_priority(Priority::parse(priority)?);
    }
    if let Some(queue) = definition.get("timeouts").and_then(|t| t.get("queue")) {
        job.queue_timeout = Some(parse_timeout(queue)?);
    }
    job.host_role = definition
        .get("host_role")
        .and_then(Value::as_str)
        .map(str::to_string);
    job.essential = params
        .and_then(|p| p.get("essential"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(job)
}

fn string_list(value: Option<&Value>, what: &str) -> Result<Vec<String>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    value
        .as_sequence()
        .ok_or_else(|| SchedulerError::submission(format!("{} must be a list", what)))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| SchedulerError::submission(format!("{} must be strings", what)))
        })
        .collect()
}

/// `lava-vland: {vlan_name: {tags: [...]}}`
fn vlans(value: Option<&Value>) -> Result<Vec<VlanRequest>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let block = value
        .as_mapping()
        .ok_or_else(|| SchedulerError::submission("lava-vland must be a mapping"))?;
    block
        .iter()
        .map(|(name, settings)| {
            let name = name
                .as_str()
                .ok_or_else(|| SchedulerError::submission("VLAN names must be strings"))?;
            Ok(VlanRequest {
                name: name.to_string(),
                tags: string_list(settings.get("tags"), "VLAN tags")?.into_iter().collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Device, DeviceType, JobState, MemoryRegistry};
    use crate::render::BasicValidator;

    fn registry() -> MemoryRegistry {
        let registry = MemoryRegistry::new();
        registry
            .transaction(|tx| {
                tx.insert_device_type(DeviceType::new("qemu"));
                tx.insert_device(Device::new("q1", "qemu", "w1"));
                Ok(())
            })
            .unwrap();
        registry
    }

    #[test]
    fn single_job_fields() {
        let registry = registry();
        let text = r#"
job_name: boot test
device_type: qemu
priority: low
tags: [usb]
timeouts:
  queue: {minutes: 5}
actions:
- boot: {method: qemu}
"#;
        let ids = submit_job(&registry, &BasicValidator, text, "alice", None).unwrap();
        let job = registry.job(ids[0]).unwrap();
        assert_eq!(job.state(), JobState::Submitted);
        assert_eq!(job.description, "boot test");
        assert_eq!(job.priority, Priority::LOW);
        assert!(job.tags.contains("usb"));
        assert_eq!(job.queue_timeout, Some(Duration::from_secs(300)));
        assert_eq!(job.requested, RequestedTarget::DeviceType("qemu".into()));
    }

    #[test]
    fn unknown_device_type_creates_nothing() {
        let registry = registry();
        let text = "job_name: x\ndevice_type: juno\nactions: [{boot: {}}]\n";
        let err = submit_job(&registry, &BasicValidator, text, "alice", None).unwrap_err();
        assert!(matches!(err, SchedulerError::Submission(_)));
        assert!(registry.job(1).is_err());
    }

    #[test]
    fn invalid_yaml_is_a_submission_error() {
        let registry = registry();
        let err = submit_job(&registry, &BasicValidator, "job_name: [", "alice", None).unwrap_err();
        assert!(matches!(err, SchedulerError::Submission(_)));
    }

    #[test]
    fn cancel_finished_job_is_refused() {
        let registry = registry();
        let text = "job_name: x\ndevice_type: qemu\nactions: [{boot: {}}]\n";
        let ids = submit_job(&registry, &BasicValidator, text, "alice", None).unwrap();
        assert_eq!(cancel_job(&registry, ids[0]).unwrap(), vec![ids[0]]);
        assert!(cancel_job(&registry, ids[0]).is_err());
    }
}
