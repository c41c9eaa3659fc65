use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::client::{DispatcherEvent, DispatcherHandle, StartRequest};
use crate::error::Result;
use crate::registry::JobId;

/// How a job run ended, in the shape END expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub error_msg: String,
    /// Result metadata; `None` when the run crashed or was canceled.
    pub description: Option<String>,
}

/// Runs every started job as `sh -c <command>` inside its own directory
/// holding the files sent with START (`job.yaml`, `device.yaml`,
/// `dispatcher.yaml`, `env.yaml`, `env.dut.yaml`).
#[derive(Debug, Clone)]
pub struct CommandRunner {
    command: String,
    work_dir: PathBuf,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            work_dir: work_dir.into(),
        }
    }

    /// Consume dispatcher events until the channel closes or `shutdown` fires.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<DispatcherEvent>,
        handle: DispatcherHandle,
        shutdown: CancellationToken,
    ) {
        let mut running: HashMap<JobId, CancellationToken> = HashMap::new();
        let (done_tx, mut done_rx) = mpsc::channel::<JobId>(64);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(job_id) = done_rx.recv() => {
                    running.remove(&job_id);
                }

                event = events.recv() => match event {
                    Some(DispatcherEvent::Start(request)) => {
                        let job_id = request.job_id;
                        let cancel = shutdown.child_token();
                        running.insert(job_id, cancel.clone());
                        let runner = self.clone();
                        let handle = handle.clone();
                        let done = done_tx.clone();
                        tokio::spawn(async move {
                            let outcome = runner.execute(&request, cancel).await;
                            if let Err(e) = handle.finish(job_id, outcome.error_msg, outcome.description).await {
                                tracing::error!(job_id, error = %e, "Failed to report job end");
                            }
                            let _ = done.send(job_id).await;
                        });
                    }
                    Some(DispatcherEvent::Cancel { job_id }) => {
                        if let Some(cancel) = running.get(&job_id) {
                            tracing::info!(job_id, "Canceling job");
                            cancel.cancel();
                        }
                    }
                    None => break,
                },
            }
        }
    }

    /// Run one job to completion or cancellation.
    pub async fn execute(&self, request: &StartRequest, cancel: CancellationToken) -> RunOutcome {
        let job_dir = self.work_dir.join(request.job_id.to_string());
        if let Err(e) = write_job_files(&job_dir, request) {
            tracing::error!(job_id = request.job_id, error = %e, "Failed to prepare job directory");
            return RunOutcome {
                error_msg: format!("Cannot prepare job directory: {}", e),
                description: None,
            };
        }

        tracing::info!(job_id = request.job_id, command = %self.command, "Executing job");
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&job_dir)
            .env("LAB_JOB_ID", request.job_id.to_string())
            .env("LAB_JOB_DIR", &job_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = request.job_id, error = %e, "Job execution failed");
                return RunOutcome {
                    error_msg: e.to_string(),
                    description: None,
                };
            }
        };

        let output = tokio::select! {
            output = child.wait_with_output() => output,
            _ = cancel.cancelled() => {
                tracing::info!(job_id = request.job_id, "Job canceled");
                return RunOutcome {
                    error_msg: "Job canceled".to_string(),
                    description: None,
                };
            }
        };

        match output {
            Ok(output) => {
                let exit_code = output.status.code();
                tracing::info!(job_id = request.job_id, exit_code = ?exit_code, "Job completed");
                let description = Some(format!("exit_code: {}\n", exit_code.unwrap_or(-1)));
                if output.status.success() {
                    RunOutcome {
                        error_msg: String::new(),
                        description,
                    }
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    RunOutcome {
                        error_msg: if stderr.is_empty() {
                            format!("Exit code: {:?}", exit_code)
                        } else {
                            stderr
                        },
                        description,
                    }
                }
            }
            Err(e) => {
                tracing::error!(job_id = request.job_id, error = %e, "Job execution failed");
                RunOutcome {
                    error_msg: e.to_string(),
                    description: None,
                }
            }
        }
    }
}

fn write_job_files(job_dir: &Path, request: &StartRequest) -> Result<()> {
    std::fs::create_dir_all(job_dir)?;
    std::fs::write(job_dir.join("job.yaml"), &request.definition)?;
    std::fs::write(job_dir.join("device.yaml"), &request.device_config)?;
    std::fs::write(job_dir.join("dispatcher.yaml"), &request.dispatcher_config)?;
    std::fs::write(job_dir.join("env.yaml"), &request.env)?;
    std::fs::write(job_dir.join("env.dut.yaml"), &request.env_dut)?;
    Ok(())
}
