use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_yaml::Mapping;

use crate::config::{MasterConfig, PROTOCOL_VERSION};
use crate::coordinator::protocol::{MasterMessage, WorkerMessage};
use crate::error::{Result, SchedulerError};
use crate::registry::{
    lifecycle, Device, Job, JobHealth, JobId, JobState, Registry, Transaction, Worker,
};
use crate::render::{DeviceRenderer, DispatcherConfigLoader, DispatcherFiles};
use crate::scheduler::tick::{self, TickOptions, TickReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Online,
    Offline,
}

/// What the master knows about a dispatcher it has heard from since it started.
/// A dispatcher absent from the table is in the unknown state.
#[derive(Debug, Clone)]
struct DispatcherLink {
    state: LinkState,
    last_msg: Instant,
}

/// Something the transport must do on behalf of the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Send {
        hostname: String,
        message: MasterMessage,
    },
    /// Close the dispatcher's connection.
    Refuse { hostname: String, reason: String },
}

fn send(hostname: &str, message: MasterMessage) -> Outbound {
    Outbound::Send {
        hostname: hostname.to_string(),
        message,
    }
}

/// The master side of the dispatcher protocol.
///
/// Inbound messages and timer events go in, the messages to send come out;
/// the transport in [`crate::coordinator::server`] moves them over the wire.
pub struct Master<R: Registry> {
    registry: Arc<R>,
    renderer: Arc<dyn DeviceRenderer>,
    loader: DispatcherConfigLoader,
    config: MasterConfig,
    links: HashMap<String, DispatcherLink>,
}

impl<R: Registry> Master<R> {
    /// Every worker starts offline until it says HELLO again.
    pub fn new(registry: Arc<R>, renderer: Arc<dyn DeviceRenderer>, config: MasterConfig) -> Result<Self> {
        registry.transaction(|tx| {
            let hostnames: Vec<String> = tx.workers().into_iter().map(|w| w.hostname.clone()).collect();
            for hostname in hostnames {
                tx.worker_mut(&hostname)?.go_offline();
            }
            Ok(())
        })?;
        tracing::info!(version = PROTOCOL_VERSION, "Marked all workers offline");
        Ok(Self {
            registry,
            renderer,
            loader: DispatcherConfigLoader::new(config.files.clone()),
            config,
            links: HashMap::new(),
        })
    }

    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn link_state(&self, hostname: &str) -> Option<LinkState> {
        self.links.get(hostname).map(|l| l.state)
    }

    pub fn handle(&mut self, hostname: &str, message: WorkerMessage, now: Instant) -> Result<Vec<Outbound>> {
        match message {
            WorkerMessage::Hello { version, .. } => self.handle_hello(hostname, false, version, now),
            WorkerMessage::HelloRetry { version, .. } => self.handle_hello(hostname, true, version, now),
            WorkerMessage::Ping => {
                tracing::debug!(worker = %hostname, "PING");
                let mut out = self.dispatcher_alive(hostname, now)?;
                out.push(send(
                    hostname,
                    MasterMessage::Pong {
                        interval_ms: self.config.ping_interval_ms,
                    },
                ));
                Ok(out)
            }
            WorkerMessage::StartOk { job_id } => {
                let out = self.dispatcher_alive(hostname, now)?;
                self.handle_start_ok(hostname, job_id)?;
                Ok(out)
            }
            WorkerMessage::End {
                job_id,
                error_msg,
                description,
            } => {
                let mut out = self.dispatcher_alive(hostname, now)?;
                out.push(self.handle_end(hostname, job_id, error_msg, description)?);
                Ok(out)
            }
        }
    }

    fn handle_hello(&mut self, hostname: &str, retry: bool, version: u32, now: Instant) -> Result<Vec<Outbound>> {
        let action = if retry { "HELLO_RETRY" } else { "HELLO" };
        tracing::info!(worker = %hostname, action, version, "Handshake");
        if version != PROTOCOL_VERSION {
            let reason = format!(
                "protocol v{} while master is using v{}",
                version, PROTOCOL_VERSION
            );
            tracing::error!(worker = %hostname, %reason, "Refusing dispatcher");
            let failed = self
                .registry
                .transaction(|tx| fail_scheduled_jobs(tx, hostname, &reason))?;
            if !failed.is_empty() {
                tracing::warn!(worker = %hostname, ?failed, "Scheduled jobs failed");
            }
            return Ok(vec![Outbound::Refuse {
                hostname: hostname.to_string(),
                reason,
            }]);
        }

        let known = self.links.contains_key(hostname);
        let mut out = vec![send(hostname, MasterMessage::HelloOk)];
        if retry {
            if known {
                tracing::warn!(worker = %hostname, "Dispatcher was not confirmed");
            } else {
                tracing::warn!(worker = %hostname, "Unknown dispatcher (master restarted)");
                out.extend(self.status_requests(hostname)?);
            }
        } else {
            if known {
                tracing::warn!(worker = %hostname, "Dispatcher has restarted");
            } else {
                tracing::info!(worker = %hostname, "New dispatcher");
            }
            let lost = self.registry.transaction(|tx| {
                lifecycle::force_worker_jobs_canceled(tx, hostname, "Dispatcher restarted")
            })?;
            if !lost.is_empty() {
                tracing::warn!(worker = %hostname, ?lost, "Canceled jobs lost by the dispatcher");
            }
        }
        self.mark_alive(hostname, now)?;
        Ok(out)
    }

    /// Record contact. A dispatcher the master has never heard from is asked
    /// for the status of its running jobs before anything else.
    fn dispatcher_alive(&mut self, hostname: &str, now: Instant) -> Result<Vec<Outbound>> {
        let out = if self.links.contains_key(hostname) {
            Vec::new()
        } else {
            tracing::warn!(worker = %hostname, "Unknown dispatcher (master restarted)");
            self.status_requests(hostname)?
        };
        self.mark_alive(hostname, now)?;
        Ok(out)
    }

    fn mark_alive(&mut self, hostname: &str, now: Instant) -> Result<()> {
        self.links.insert(
            hostname.to_string(),
            DispatcherLink {
                state: LinkState::Online,
                last_msg: now,
            },
        );
        self.registry.transaction(|tx| {
            if tx.worker(hostname).is_err() {
                tracing::info!(worker = %hostname, "Creating worker");
                tx.upsert_worker(Worker::new(hostname));
            }
            tx.worker_mut(hostname)?.go_online(Utc::now());
            Ok(())
        })
    }

    fn status_requests(&self, hostname: &str) -> Result<Vec<Outbound>> {
        let running: Vec<JobId> = self.registry.read(|tx| {
            tx.jobs_in_state(JobState::Running)
                .into_iter()
                .filter(|j| lifecycle::job_worker(tx, j).as_deref() == Some(hostname))
                .map(|j| j.id)
                .collect()
        })?;
        Ok(running
            .into_iter()
            .map(|job_id| {
                tracing::info!(job_id, worker = %hostname, "STATUS");
                send(hostname, MasterMessage::Status { job_id })
            })
            .collect())
    }

    fn handle_start_ok(&self, hostname: &str, job_id: JobId) -> Result<()> {
        tracing::info!(job_id, worker = %hostname, "START_OK");
        match self.registry.transaction(|tx| lifecycle::go_running(tx, job_id)) {
            Ok(_) => Ok(()),
            Err(SchedulerError::JobNotFound(_)) => {
                tracing::error!(job_id, "Unknown job");
                Ok(())
            }
            Err(e @ SchedulerError::IllegalTransition { .. }) => {
                tracing::warn!(job_id, error = %e, "Ignoring stale START_OK");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Always acknowledged; only the first END for a job changes anything.
    fn handle_end(
        &self,
        hostname: &str,
        job_id: JobId,
        error_msg: String,
        description: Option<String>,
    ) -> Result<Outbound> {
        let health = if error_msg.is_empty() && description.is_some() {
            JobHealth::Complete
        } else {
            JobHealth::Incomplete
        };
        let changed = self.registry.transaction(|tx| {
            let job = match tx.job_mut(job_id) {
                Ok(job) => job,
                Err(SchedulerError::JobNotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            if matches!(
                job.state(),
                JobState::Submitted | JobState::Scheduling | JobState::Finished
            ) {
                return Ok(Some(false));
            }
            if !error_msg.is_empty() {
                job.failure_comment.get_or_insert_with(|| error_msg.clone());
            }
            job.result_description = description.clone();
            lifecycle::go_finished(tx, job_id, health, false).map(Some)
        })?;
        match changed {
            None => tracing::error!(job_id, worker = %hostname, "END for unknown job"),
            Some(false) => tracing::info!(job_id, worker = %hostname, "END (duplicated), skipping"),
            Some(true) if error_msg.is_empty() => tracing::info!(job_id, worker = %hostname, %health, "END"),
            Some(true) => tracing::error!(job_id, worker = %hostname, error = %error_msg, "END with error"),
        }
        Ok(send(hostname, MasterMessage::EndOk { job_id }))
    }

    /// Mark dispatchers silent for longer than the timeout offline and cancel
    /// the jobs they were running. Returns the hostnames that went offline.
    pub fn check_dispatchers(&mut self, now: Instant) -> Result<Vec<String>> {
        let timeout = self.config.dispatcher_timeout();
        let mut lost = Vec::new();
        for (hostname, link) in self.links.iter_mut() {
            if link.state == LinkState::Online && now.saturating_duration_since(link.last_msg) > timeout {
                link.state = LinkState::Offline;
                lost.push(hostname.clone());
            }
        }
        for hostname in &lost {
            tracing::warn!(worker = %hostname, timeout_ms = timeout.as_millis() as u64, "Dispatcher lost");
            let canceled = self.registry.transaction(|tx| {
                if let Ok(worker) = tx.worker_mut(hostname) {
                    worker.go_offline();
                }
                lifecycle::force_worker_jobs_canceled(tx, hostname, "Dispatcher lost")
            })?;
            if !canceled.is_empty() {
                tracing::warn!(worker = %hostname, ?canceled, "Canceled jobs of lost dispatcher");
            }
        }
        Ok(lost)
    }

    /// Run a scheduling pass, then push START and CANCEL messages.
    pub fn schedule_tick(&mut self, now: DateTime<Utc>) -> Result<(TickReport, Vec<Outbound>)> {
        let options = TickOptions {
            shuffle_devices: self.config.shuffle_devices,
        };
        let report = tick::schedule(&*self.registry, &*self.renderer, &options, now)?;
        let mut out = self.start_jobs()?;
        out.extend(self.cancel_jobs()?);
        Ok((report, out))
    }

    /// START every scheduled job whose worker is online. Jobs that cannot be
    /// prepared fail as infrastructure errors.
    pub fn start_jobs(&self) -> Result<Vec<Outbound>> {
        let ready: Vec<(Job, Device)> = self.registry.read(|tx| {
            tx.jobs_in_state(JobState::Scheduled)
                .into_iter()
                .filter(|j| !j.dynamic_connection())
                .filter_map(|j| {
                    let device = tx.device(j.actual_device.as_deref()?).ok()?;
                    let online = tx.worker(&device.worker).map(|w| w.is_online()).unwrap_or(false);
                    online.then(|| (j.clone(), device.clone()))
                })
                .collect()
        })?;

        let mut out = Vec::new();
        for (job, device) in ready {
            match self.prepare_start(&job, &device) {
                Ok(messages) => out.extend(messages),
                Err(e) => {
                    tracing::error!(job_id = job.id, device = %device.hostname, error = %e, "Unable to start job");
                    let message = e.to_string();
                    self.registry.transaction(|tx| {
                        tx.job_mut(job.id)?.failure_comment = Some(message);
                        lifecycle::go_finished(tx, job.id, JobHealth::Incomplete, true)
                    })?;
                }
            }
        }
        Ok(out)
    }

    fn prepare_start(&self, job: &Job, device: &Device) -> Result<Vec<Outbound>> {
        let definition: Mapping = serde_yaml::from_str(&job.definition)
            .map_err(|e| SchedulerError::Render(format!("Cannot parse job definition: {}", e)))?;
        let device_config = self.renderer.render(device, definition.get("context"))?;
        let files = self.loader.load(&device.worker)?;

        tracing::info!(job_id = job.id, worker = %device.worker, device = %device.hostname, "START");
        let mut out = vec![send(
            &device.worker,
            start_message(job, device_config.clone(), &files),
        )];

        if let (Some(group), Some(role)) = (&job.target_group, &job.role) {
            let connections: Vec<Job> = self.registry.read(|tx| {
                tx.group_members(group)
                    .into_iter()
                    .filter(|m| {
                        m.dynamic_connection()
                            && m.state() == JobState::Scheduled
                            && m.host_role.as_deref() == Some(role.as_str())
                    })
                    .cloned()
                    .collect()
            })?;
            if !connections.is_empty() {
                let minimal = self.renderer.minimise(&device_config)?;
                for sub_job in connections {
                    tracing::info!(job_id = sub_job.id, worker = %device.worker, "START (connection)");
                    out.push(send(
                        &device.worker,
                        start_message(&sub_job, minimal.clone(), &files),
                    ));
                }
            }
        }
        Ok(out)
    }

    /// Ask the owning dispatcher to stop every CANCELING job. Repeated each
    /// tick until the END arrives.
    pub fn cancel_jobs(&self) -> Result<Vec<Outbound>> {
        let targets: Vec<(JobId, String)> = self.registry.read(|tx| {
            tx.jobs_in_state(JobState::Canceling)
                .into_iter()
                .filter_map(|j| {
                    let worker = lifecycle::job_worker(tx, j)?;
                    tx.worker(&worker)
                        .ok()
                        .filter(|w| w.is_online())
                        .map(|_| (j.id, worker))
                })
                .collect()
        })?;
        Ok(targets
            .into_iter()
            .map(|(job_id, worker)| {
                tracing::info!(job_id, worker = %worker, "CANCEL");
                send(&worker, MasterMessage::Cancel { job_id })
            })
            .collect())
    }
}

fn start_message(job: &Job, device_config: String, files: &DispatcherFiles) -> MasterMessage {
    MasterMessage::Start {
        job_id: job.id,
        definition: job.definition.clone(),
        device_config,
        dispatcher_config: files.dispatcher_config.clone(),
        env: files.env.clone(),
        env_dut: files.env_dut.clone(),
    }
}

/// A refused dispatcher will never start its scheduled jobs.
fn fail_scheduled_jobs(tx: &mut dyn Transaction, hostname: &str, reason: &str) -> Result<Vec<JobId>> {
    let scheduled: Vec<JobId> = {
        let view: &dyn Transaction = &*tx;
        view.jobs_in_state(JobState::Scheduled)
            .into_iter()
            .filter(|j| lifecycle::job_worker(view, j).as_deref() == Some(hostname))
            .map(|j| j.id)
            .collect()
    };
    for job_id in &scheduled {
        tx.job_mut(*job_id)?.failure_comment = Some(format!("Dispatcher refused: {}", reason));
        lifecycle::go_finished(tx, *job_id, JobHealth::Incomplete, true)?;
    }
    Ok(scheduled)
}
