//! Shared fixtures for the integration tests: a small lab, canned job
//! definitions and a renderer that needs no device files.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_yaml::Value;

use lab_scheduler::config::{DispatcherFilesConfig, MasterConfig};
use lab_scheduler::coordinator::{Master, MasterMessage, Outbound, WorkerMessage};
use lab_scheduler::error::{Result, SchedulerError};
use lab_scheduler::registry::{Device, DeviceHealth, DeviceType, JobId, MemoryRegistry, Registry, Worker};
use lab_scheduler::render::{BasicValidator, DeviceRenderer};
use lab_scheduler::scheduler::submit_job;

/// Renders `hostname`/`device_type` plus whatever the job context adds.
/// Hostnames in `broken` fail to render.
#[derive(Default)]
pub struct StaticRenderer {
    pub broken: BTreeSet<String>,
}

impl StaticRenderer {
    pub fn broken<I: IntoIterator<Item = &'static str>>(hosts: I) -> Self {
        Self {
            broken: hosts.into_iter().map(str::to_string).collect(),
        }
    }
}

impl DeviceRenderer for StaticRenderer {
    fn render(&self, device: &Device, context: Option<&Value>) -> Result<String> {
        if self.broken.contains(&device.hostname) {
            return Err(SchedulerError::Render(format!("no template for {}", device.hostname)));
        }
        let mut config = serde_yaml::Mapping::new();
        config.insert("hostname".into(), device.hostname.clone().into());
        config.insert("device_type".into(), device.device_type.clone().into());
        config.insert("commands".into(), Value::Mapping(Default::default()));
        config.insert("power_state".into(), "off".into());
        if let Some(Value::Mapping(context)) = context {
            for (key, value) in context {
                config.insert(key.clone(), value.clone());
            }
        }
        Ok(serde_yaml::to_string(&config)?)
    }
}

/// Two workers: `w1` with qemu devices `q1` (usb) and `q2`, `w2` with the
/// bbb device `b1` (usb). All devices start GOOD, all workers offline.
pub fn lab() -> Arc<MemoryRegistry> {
    let registry = MemoryRegistry::new();
    registry
        .transaction(|tx| {
            tx.upsert_worker(Worker::new("w1"));
            tx.upsert_worker(Worker::new("w2"));
            tx.insert_device_type(DeviceType::new("qemu"));
            tx.insert_device_type(DeviceType::new("bbb"));
            tx.insert_device(Device::new("q1", "qemu", "w1").with_tags(["usb"]).with_health(DeviceHealth::Good));
            tx.insert_device(Device::new("q2", "qemu", "w1").with_health(DeviceHealth::Good));
            tx.insert_device(Device::new("b1", "bbb", "w2").with_tags(["usb"]).with_health(DeviceHealth::Good));
            Ok(())
        })
        .unwrap();
    Arc::new(registry)
}

pub fn set_online(registry: &MemoryRegistry, workers: &[&str]) {
    registry
        .transaction(|tx| {
            for worker in workers {
                tx.worker_mut(worker)?.go_online(Utc::now());
            }
            Ok(())
        })
        .unwrap();
}

pub fn qemu_job(name: &str) -> String {
    format!(
        "job_name: {}\ndevice_type: qemu\nactions:\n- boot: {{method: qemu}}\n",
        name
    )
}

pub const CLIENT_SERVER: &str = r#"
job_name: client-server
protocols:
  lava-multinode:
    roles:
      client:
        device_type: qemu
        count: 2
      server:
        device_type: bbb
        count: 1
        essential: true
actions:
- deploy:
    role: [client, server]
    to: tmpfs
- test:
    role: [server]
    definitions: []
"#;

pub fn submit(registry: &MemoryRegistry, definition: &str) -> Vec<JobId> {
    submit_job(registry, &BasicValidator, definition, "tester", None).unwrap()
}

/// Short intervals, no env files, deterministic device order.
pub fn test_config() -> MasterConfig {
    let mut config = MasterConfig::new("127.0.0.1:0".parse().unwrap())
        .with_ping_interval_ms(100)
        .with_schedule_interval_ms(50)
        .with_files(DispatcherFilesConfig::rooted_at("/nonexistent/lab-scheduler"));
    config.shuffle_devices = false;
    config
}

pub fn master(registry: &Arc<MemoryRegistry>) -> Master<MemoryRegistry> {
    Master::new(registry.clone(), Arc::new(StaticRenderer::default()), test_config()).unwrap()
}

pub fn hello(hostname: &str) -> WorkerMessage {
    WorkerMessage::Hello {
        hostname: hostname.to_string(),
        version: lab_scheduler::config::PROTOCOL_VERSION,
    }
}

pub fn hello_retry(hostname: &str) -> WorkerMessage {
    WorkerMessage::HelloRetry {
        hostname: hostname.to_string(),
        version: lab_scheduler::config::PROTOCOL_VERSION,
    }
}

/// Messages in `out` addressed to `hostname`.
pub fn sent_to(out: &[Outbound], hostname: &str) -> Vec<MasterMessage> {
    out.iter()
        .filter_map(|o| match o {
            Outbound::Send { hostname: h, message } if h == hostname => Some(message.clone()),
            _ => None,
        })
        .collect()
}

pub fn started_ids(messages: &[MasterMessage]) -> Vec<JobId> {
    messages
        .iter()
        .filter_map(|m| match m {
            MasterMessage::Start { job_id, .. } => Some(*job_id),
            _ => None,
        })
        .collect()
}

/// Say HELLO from every worker, schedule, and acknowledge every START so the
/// started jobs end up RUNNING. Returns the started job ids.
pub fn run_until_running(master: &mut Master<MemoryRegistry>, workers: &[&str]) -> Vec<JobId> {
    let now = Instant::now();
    for worker in workers {
        master.handle(worker, hello(worker), now).unwrap();
    }
    let (_, out) = master.schedule_tick(Utc::now()).unwrap();
    let mut started = Vec::new();
    for worker in workers {
        for job_id in started_ids(&sent_to(&out, worker)) {
            master.handle(worker, WorkerMessage::StartOk { job_id }, now).unwrap();
            started.push(job_id);
        }
    }
    started.sort();
    started
}
