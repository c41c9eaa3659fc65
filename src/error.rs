use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The submission was rejected before any job row was created.
    #[error("Submission rejected: {0}")]
    Submission(String),

    #[error("Job not found: {0}")]
    JobNotFound(u64),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device type not found: {0}")]
    DeviceTypeNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Illegal {entity} transition: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// A row no longer matched the precondition once re-read inside the lock.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn submission(msg: impl Into<String>) -> Self {
        SchedulerError::Submission(msg.into())
    }

    pub fn illegal(entity: &'static str, from: impl ToString, to: impl ToString) -> Self {
        SchedulerError::IllegalTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
