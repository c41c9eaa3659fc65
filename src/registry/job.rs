use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

pub type JobId = u64;

/// Lifecycle of a job. Transitions only move forward along the declared
/// order, except that `Canceling` may be entered from any unfinished state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Submitted,
    Scheduling,
    Scheduled,
    Running,
    Canceling,
    Finished,
}

impl JobState {
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Finished, _) => false,
            (Canceling, Canceling) => false,
            (_, Canceling) => true,
            (Submitted, Scheduling | Scheduled | Finished) => true,
            (Scheduling, Scheduled | Finished) => true,
            (Scheduled, Running | Finished) => true,
            (Running, Finished) => true,
            (Canceling, Finished) => true,
            _ => false,
        }
    }

    pub fn is_finished(self) -> bool {
        self == JobState::Finished
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Submitted => write!(f, "submitted"),
            JobState::Scheduling => write!(f, "scheduling"),
            JobState::Scheduled => write!(f, "scheduled"),
            JobState::Running => write!(f, "running"),
            JobState::Canceling => write!(f, "canceling"),
            JobState::Finished => write!(f, "finished"),
        }
    }
}

/// Outcome of a job, only meaningful once the job is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobHealth {
    Unknown,
    Complete,
    Incomplete,
    Canceled,
}

impl std::fmt::Display for JobHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobHealth::Unknown => write!(f, "unknown"),
            JobHealth::Complete => write!(f, "complete"),
            JobHealth::Incomplete => write!(f, "incomplete"),
            JobHealth::Canceled => write!(f, "canceled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const MEDIUM: Priority = Priority(50);
    pub const HIGH: Priority = Priority(100);

    pub fn new(value: i64) -> Result<Self> {
        if !(0..=100).contains(&value) {
            return Err(SchedulerError::submission(format!(
                "Invalid job priority: {}. Should be in [0, 100]",
                value
            )));
        }
        Ok(Priority(value as u8))
    }

    /// Accepts either an integer in `0..=100` or one of `low`, `medium`, `high`.
    pub fn parse(value: &serde_yaml::Value) -> Result<Self> {
        if let Some(n) = value.as_i64() {
            return Self::new(n);
        }
        match value.as_str().map(|s| s.to_ascii_lowercase()).as_deref() {
            Some("low") => Ok(Priority::LOW),
            Some("medium") => Ok(Priority::MEDIUM),
            Some("high") => Ok(Priority::HIGH),
            _ => Err(SchedulerError::submission(format!(
                "Invalid job priority: {:?}",
                value
            ))),
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}

/// What the submitter asked to run on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum RequestedTarget {
    /// One exact device, by hostname.
    Device(String),
    /// Any device of the given type.
    DeviceType(String),
    /// Dynamic connection sub-job: runs alongside its host role, no device.
    Connection,
}

/// One VLAN a job needs, with the interface tags that must be present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanRequest {
    pub name: String,
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub sub_id: Option<u32>,
    pub target_group: Option<String>,
    pub role: Option<String>,
    pub host_role: Option<String>,
    pub essential: bool,
    pub requested: RequestedTarget,
    pub priority: Priority,
    pub tags: BTreeSet<String>,
    pub vlans: Vec<VlanRequest>,
    pub exclusive: bool,
    pub health_check: bool,
    pub submitter: String,
    pub description: String,
    pub definition: String,
    pub queue_timeout: Option<Duration>,
    state: JobState,
    health: JobHealth,
    pub actual_device: Option<String>,
    pub failure_comment: Option<String>,
    pub result_description: Option<String>,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Job {
    /// A new, not yet persisted job. The registry assigns the id on insert.
    pub fn new(
        submitter: impl Into<String>,
        description: impl Into<String>,
        requested: RequestedTarget,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            sub_id: None,
            target_group: None,
            role: None,
            host_role: None,
            essential: false,
            requested,
            priority: Priority::default(),
            tags: BTreeSet::new(),
            vlans: Vec::new(),
            exclusive: false,
            health_check: false,
            submitter: submitter.into(),
            description: description.into(),
            definition: definition.into(),
            queue_timeout: None,
            state: JobState::Submitted,
            health: JobHealth::Unknown,
            actual_device: None,
            failure_comment: None,
            result_description: None,
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_vlans(mut self, vlans: Vec<VlanRequest>) -> Self {
        self.vlans = vlans;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn health_check(mut self) -> Self {
        self.health_check = true;
        self.priority = Priority::HIGH;
        self
    }

    pub fn in_group(mut self, target_group: impl Into<String>, role: impl Into<String>, sub_id: u32) -> Self {
        self.target_group = Some(target_group.into());
        self.role = Some(role.into());
        self.sub_id = Some(sub_id);
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn health(&self) -> JobHealth {
        self.health
    }

    pub fn is_multinode(&self) -> bool {
        self.target_group.is_some()
    }

    pub fn dynamic_connection(&self) -> bool {
        self.requested == RequestedTarget::Connection
    }

    pub(crate) fn advance(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SchedulerError::illegal("job", self.state, next));
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn set_health(&mut self, health: JobHealth) {
        self.health = health;
    }
}

/// Parse a `{days, hours, minutes, seconds}` timeout block.
pub fn parse_timeout(value: &serde_yaml::Value) -> Result<Duration> {
    let map = value
        .as_mapping()
        .ok_or_else(|| SchedulerError::submission("Timeout must be a mapping"))?;
    let mut secs = 0u64;
    for (key, amount) in map {
        let unit = key.as_str().unwrap_or_default();
        let amount = amount
            .as_u64()
            .ok_or_else(|| SchedulerError::submission(format!("Invalid timeout value for {}", unit)))?;
        let factor = match unit {
            "days" => 86_400,
            "hours" => 3_600,
            "minutes" => 60,
            "seconds" => 1,
            other => {
                return Err(SchedulerError::submission(format!(
                    "Unknown timeout unit: {}",
                    other
                )))
            }
        };
        secs = amount
            .checked_mul(factor)
            .and_then(|s| secs.checked_add(s))
            .ok_or_else(|| SchedulerError::submission("Timeout is too large"))?;
    }
    Ok(Duration::from_secs(secs))
}
