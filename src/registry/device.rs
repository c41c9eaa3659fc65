use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::registry::job::{JobHealth, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Idle,
    Reserved,
    Running,
    Offline,
    Retired,
}

impl DeviceState {
    pub fn can_transition_to(self, next: DeviceState) -> bool {
        use DeviceState::*;
        matches!(
            (self, next),
            (Idle, Reserved | Offline | Retired)
                | (Reserved, Running | Idle | Offline)
                | (Running, Idle | Offline)
                | (Offline, Idle | Reserved | Retired)
        )
    }

    pub fn is_busy(self) -> bool {
        matches!(self, DeviceState::Reserved | DeviceState::Running)
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Idle => write!(f, "idle"),
            DeviceState::Reserved => write!(f, "reserved"),
            DeviceState::Running => write!(f, "running"),
            DeviceState::Offline => write!(f, "offline"),
            DeviceState::Retired => write!(f, "retired"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceHealth {
    Good,
    Unknown,
    Looping,
    Bad,
    Maintenance,
    Retired,
}

impl std::fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceHealth::Good => write!(f, "good"),
            DeviceHealth::Unknown => write!(f, "unknown"),
            DeviceHealth::Looping => write!(f, "looping"),
            DeviceHealth::Bad => write!(f, "bad"),
            DeviceHealth::Maintenance => write!(f, "maintenance"),
            DeviceHealth::Retired => write!(f, "retired"),
        }
    }
}

/// A network interface and the switch port it is cabled to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default)]
    pub switch: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// Result of the last health-check job that ran on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub job_id: JobId,
    pub outcome: JobHealth,
    pub submit_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub hostname: String,
    pub device_type: String,
    pub worker: String,
    pub tags: BTreeSet<String>,
    pub interfaces: Vec<Interface>,
    pub is_exclusive: bool,
    state: DeviceState,
    health: DeviceHealth,
    current_job: Option<JobId>,
    /// Set when an admin asks for the device to go offline while it is busy.
    offline_requested: bool,
    pub last_health_report: Option<HealthReport>,
    pub jobs_since_health_check: u32,
}

impl Device {
    pub fn new(hostname: impl Into<String>, device_type: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            device_type: device_type.into(),
            worker: worker.into(),
            tags: BTreeSet::new(),
            interfaces: Vec::new(),
            is_exclusive: false,
            state: DeviceState::Idle,
            health: DeviceHealth::Unknown,
            current_job: None,
            offline_requested: false,
            last_health_report: None,
            jobs_since_health_check: 0,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interfaces(mut self, interfaces: Vec<Interface>) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn with_health(mut self, health: DeviceHealth) -> Self {
        self.health = health;
        if health == DeviceHealth::Retired {
            self.state = DeviceState::Retired;
        }
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.is_exclusive = exclusive;
        self
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn health(&self) -> DeviceHealth {
        self.health
    }

    pub fn current_job(&self) -> Option<JobId> {
        self.current_job
    }

    pub fn offline_requested(&self) -> bool {
        self.offline_requested
    }

    fn go(&mut self, next: DeviceState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SchedulerError::illegal("device", self.state, next));
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn reserve(&mut self, job_id: JobId) -> Result<()> {
        self.go(DeviceState::Reserved)?;
        self.current_job = Some(job_id);
        Ok(())
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        if self.state == DeviceState::Running {
            return Ok(());
        }
        self.go(DeviceState::Running)
    }

    /// Free the device after its job ended; honours a pending offline request.
    pub(crate) fn release(&mut self) -> Result<DeviceState> {
        let next = if self.offline_requested {
            DeviceState::Offline
        } else {
            DeviceState::Idle
        };
        self.go(next)?;
        self.current_job = None;
        self.offline_requested = false;
        Ok(next)
    }

    pub(crate) fn set_health(&mut self, health: DeviceHealth) -> Result<()> {
        if self.health == DeviceHealth::Retired && health != DeviceHealth::Retired {
            return Err(SchedulerError::illegal("device health", self.health, health));
        }
        self.health = health;
        Ok(())
    }

    /// Take the device out of service. A busy device finishes its job first.
    pub fn go_offline(&mut self) -> Result<()> {
        match self.state {
            DeviceState::Reserved | DeviceState::Running => {
                self.offline_requested = true;
                Ok(())
            }
            DeviceState::Offline => Ok(()),
            _ => self.go(DeviceState::Offline),
        }
    }

    pub fn go_online(&mut self) -> Result<()> {
        if self.offline_requested {
            self.offline_requested = false;
            return Ok(());
        }
        match self.state {
            DeviceState::Idle | DeviceState::Reserved | DeviceState::Running => Ok(()),
            _ => self.go(DeviceState::Idle),
        }
    }

    pub fn retire(&mut self) -> Result<()> {
        if self.state.is_busy() {
            return Err(SchedulerError::Conflict(format!(
                "device {} is busy with job {:?}",
                self.hostname, self.current_job
            )));
        }
        if self.state != DeviceState::Retired {
            self.go(DeviceState::Retired)?;
        }
        self.health = DeviceHealth::Retired;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthDenominator {
    Hours,
    Jobs,
}

/// How often devices of a type must pass a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckPolicy {
    pub definition: String,
    pub frequency: u32,
    pub denominator: HealthDenominator,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceType {
    pub name: String,
    pub health_check: Option<HealthCheckPolicy>,
}

impl DeviceType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            health_check: None,
        }
    }

    pub fn with_health_check(mut self, policy: HealthCheckPolicy) -> Self {
        self.health_check = Some(policy);
        self
    }

    /// The active policy, if health checks are configured and enabled.
    pub fn active_policy(&self) -> Option<&HealthCheckPolicy> {
        self.health_check.as_ref().filter(|p| !p.disabled)
    }
}
