use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Online,
    Offline,
}

/// A dispatcher host that owns devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub hostname: String,
    pub state: WorkerState,
    pub last_ping: Option<DateTime<Utc>>,
    /// Maximum number of busy devices on this worker, 0 for no limit.
    pub job_limit: u32,
}

impl Worker {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            state: WorkerState::Offline,
            last_ping: None,
            job_limit: 0,
        }
    }

    pub fn with_job_limit(mut self, job_limit: u32) -> Self {
        self.job_limit = job_limit;
        self
    }

    pub fn is_online(&self) -> bool {
        self.state == WorkerState::Online
    }

    pub fn go_online(&mut self, now: DateTime<Utc>) {
        if self.state == WorkerState::Offline {
            tracing::info!(worker = %self.hostname, "Worker online");
        }
        self.state = WorkerState::Online;
        self.last_ping = Some(now);
    }

    pub fn go_offline(&mut self) {
        if self.state == WorkerState::Online {
            tracing::info!(worker = %self.hostname, "Worker offline");
        }
        self.state = WorkerState::Offline;
    }

    pub fn overused(&self, busy: usize) -> bool {
        self.job_limit > 0 && busy >= self.job_limit as usize
    }
}
