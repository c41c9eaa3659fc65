//! Messages exchanged between the master and its dispatchers.
//!
//! Each message is one JSON object on its own line, tagged by `action`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::registry::JobId;

/// Dispatcher to master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// First contact after the dispatcher (re)started.
    Hello { hostname: String, version: u32 },
    /// Reconnection of a dispatcher that kept its state.
    HelloRetry { hostname: String, version: u32 },
    Ping,
    StartOk { job_id: JobId },
    End {
        job_id: JobId,
        #[serde(default)]
        error_msg: String,
        /// Job-produced metadata, absent when the job runtime crashed.
        #[serde(default)]
        description: Option<String>,
    },
}

impl WorkerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerMessage::Hello { .. } => "HELLO",
            WorkerMessage::HelloRetry { .. } => "HELLO_RETRY",
            WorkerMessage::Ping => "PING",
            WorkerMessage::StartOk { .. } => "START_OK",
            WorkerMessage::End { .. } => "END",
        }
    }
}

/// Master to dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MasterMessage {
    HelloOk,
    Pong {
        interval_ms: u64,
    },
    Start {
        job_id: JobId,
        definition: String,
        device_config: String,
        dispatcher_config: String,
        env: String,
        env_dut: String,
    },
    EndOk {
        job_id: JobId,
    },
    Cancel {
        job_id: JobId,
    },
    /// Asks for the state of a job the master believes is running.
    Status {
        job_id: JobId,
    },
}

impl MasterMessage {
    pub fn name(&self) -> &'static str {
        match self {
            MasterMessage::HelloOk => "HELLO_OK",
            MasterMessage::Pong { .. } => "PONG",
            MasterMessage::Start { .. } => "START",
            MasterMessage::EndOk { .. } => "END_OK",
            MasterMessage::Cancel { .. } => "CANCEL",
            MasterMessage::Status { .. } => "STATUS",
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line).map_err(|e| SchedulerError::Protocol(format!("Invalid message: {}", e)))
}
