use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::config::{DispatcherConfig, PROTOCOL_VERSION};
use crate::coordinator::protocol::{self, MasterMessage, WorkerMessage};
use crate::dispatcher::heartbeat::Heartbeat;
use crate::error::{Result, SchedulerError};
use crate::registry::JobId;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Everything the master sends with START.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub job_id: JobId,
    pub definition: String,
    pub device_config: String,
    pub dispatcher_config: String,
    pub env: String,
    pub env_dut: String,
}

/// Work handed to whatever runs the jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherEvent {
    Start(StartRequest),
    Cancel { job_id: JobId },
}

enum Command {
    Finish {
        job_id: JobId,
        error_msg: String,
        description: Option<String>,
    },
}

/// Reports job results back through a running [`Dispatcher`].
#[derive(Clone)]
pub struct DispatcherHandle {
    commands: mpsc::Sender<Command>,
}

impl DispatcherHandle {
    /// Report that a job ended. `description` is the job's result metadata;
    /// leave it out when the job crashed. END is repeated until acknowledged.
    pub async fn finish(&self, job_id: JobId, error_msg: impl Into<String>, description: Option<String>) -> Result<()> {
        self.commands
            .send(Command::Finish {
                job_id,
                error_msg: error_msg.into(),
                description,
            })
            .await
            .map_err(|_| SchedulerError::Internal("dispatcher stopped".to_string()))
    }
}

/// Dispatcher side of the protocol: handshake, pings, START/CANCEL/STATUS
/// handling and reliable END delivery. Running the jobs is left to the
/// receiver of [`DispatcherEvent`]s.
pub struct Dispatcher {
    config: DispatcherConfig,
    commands: mpsc::Receiver<Command>,
    running: BTreeSet<JobId>,
    /// ENDs not yet acknowledged by END_OK.
    unacked: BTreeMap<JobId, WorkerMessage>,
    greeted: bool,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> (Self, DispatcherHandle) {
        let (commands_tx, commands) = mpsc::channel(64);
        (
            Self {
                config,
                commands,
                running: BTreeSet::new(),
                unacked: BTreeMap::new(),
                greeted: false,
            },
            DispatcherHandle {
                commands: commands_tx,
            },
        )
    }

    /// Talk to the master until `shutdown` fires, reconnecting with
    /// HELLO_RETRY whenever the connection drops.
    pub async fn run(mut self, events: mpsc::Sender<DispatcherEvent>, shutdown: CancellationToken) -> Result<()> {
        loop {
            match self.session(&events, &shutdown).await {
                Ok(()) => return Ok(()),
                Err(e) => tracing::warn!(master = %self.config.master_addr, error = %e, "Connection to master lost"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn session(&mut self, events: &mpsc::Sender<DispatcherEvent>, shutdown: &CancellationToken) -> Result<()> {
        let stream = TcpStream::connect(&self.config.master_addr).await?;
        let (read_half, mut writer) = stream.into_split();
        let mut frames = FramedRead::new(read_half, LinesCodec::new_with_max_length(self.config.max_frame_len));

        let hello = if self.greeted {
            WorkerMessage::HelloRetry {
                hostname: self.config.hostname.clone(),
                version: PROTOCOL_VERSION,
            }
        } else {
            WorkerMessage::Hello {
                hostname: self.config.hostname.clone(),
                version: PROTOCOL_VERSION,
            }
        };
        tracing::info!(master = %self.config.master_addr, action = hello.name(), "Connecting");
        write_message(&mut writer, &hello).await?;
        tokio::time::timeout(HANDSHAKE_TIMEOUT, wait_hello_ok(&mut frames))
            .await
            .map_err(|_| SchedulerError::Protocol("no HELLO_OK from master".to_string()))??;
        self.greeted = true;
        tracing::info!("Connected to master");

        for end in self.unacked.values() {
            write_message(&mut writer, end).await?;
        }

        let mut heartbeat = Heartbeat::new(self.config.ping_interval_ms);
        let retry_period = Duration::from_millis(self.config.end_retry_ms.max(1));
        let mut end_retry = tokio::time::interval_at(tokio::time::Instant::now() + retry_period, retry_period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = writer.shutdown().await;
                    return Ok(());
                }

                _ = heartbeat.tick() => {
                    write_message(&mut writer, &WorkerMessage::Ping).await?;
                }

                _ = end_retry.tick() => {
                    for end in self.unacked.values() {
                        tracing::debug!(action = end.name(), "Resending END");
                        write_message(&mut writer, end).await?;
                    }
                }

                Some(command) = self.commands.recv() => match command {
                    Command::Finish { job_id, error_msg, description } => {
                        self.running.remove(&job_id);
                        let end = WorkerMessage::End { job_id, error_msg, description };
                        tracing::info!(job_id, "END");
                        write_message(&mut writer, &end).await?;
                        self.unacked.insert(job_id, end);
                    }
                },

                frame = frames.next() => {
                    let line = match frame {
                        Some(Ok(line)) => line,
                        Some(Err(e)) => return Err(SchedulerError::Protocol(e.to_string())),
                        None => return Err(SchedulerError::Protocol("master closed the connection".to_string())),
                    };
                    match protocol::decode::<MasterMessage>(&line) {
                        Ok(message) => self.handle(message, events, &mut writer, &mut heartbeat).await?,
                        Err(e) => tracing::warn!(error = %e, "Invalid message from master"),
                    }
                }
            }
        }
    }

    async fn handle(
        &mut self,
        message: MasterMessage,
        events: &mpsc::Sender<DispatcherEvent>,
        writer: &mut OwnedWriteHalf,
        heartbeat: &mut Heartbeat,
    ) -> Result<()> {
        match message {
            MasterMessage::HelloOk => {}
            MasterMessage::Pong { interval_ms } => {
                heartbeat.adjust(interval_ms);
            }
            MasterMessage::Start {
                job_id,
                definition,
                device_config,
                dispatcher_config,
                env,
                env_dut,
            } => {
                if let Some(end) = self.unacked.get(&job_id) {
                    write_message(writer, end).await?;
                    return Ok(());
                }
                if self.running.insert(job_id) {
                    tracing::info!(job_id, "START");
                    let request = StartRequest {
                        job_id,
                        definition,
                        device_config,
                        dispatcher_config,
                        env,
                        env_dut,
                    };
                    events
                        .send(DispatcherEvent::Start(request))
                        .await
                        .map_err(|_| SchedulerError::Internal("job runner stopped".to_string()))?;
                }
                write_message(writer, &WorkerMessage::StartOk { job_id }).await?;
            }
            MasterMessage::Cancel { job_id } => {
                tracing::info!(job_id, "CANCEL");
                if self.running.contains(&job_id) {
                    events
                        .send(DispatcherEvent::Cancel { job_id })
                        .await
                        .map_err(|_| SchedulerError::Internal("job runner stopped".to_string()))?;
                } else {
                    self.report_unknown(job_id, writer).await?;
                }
            }
            MasterMessage::Status { job_id } => {
                tracing::info!(job_id, "STATUS");
                if self.running.contains(&job_id) {
                    write_message(writer, &WorkerMessage::StartOk { job_id }).await?;
                } else {
                    self.report_unknown(job_id, writer).await?;
                }
            }
            MasterMessage::EndOk { job_id } => {
                tracing::debug!(job_id, "END_OK");
                self.unacked.remove(&job_id);
            }
        }
        Ok(())
    }

    /// Either the END is still unacknowledged, or the job never ran here.
    async fn report_unknown(&mut self, job_id: JobId, writer: &mut OwnedWriteHalf) -> Result<()> {
        let end = self
            .unacked
            .entry(job_id)
            .or_insert_with(|| WorkerMessage::End {
                job_id,
                error_msg: "Job not running on this dispatcher".to_string(),
                description: None,
            });
        write_message(writer, end).await
    }
}

async fn wait_hello_ok(frames: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, LinesCodec>) -> Result<()> {
    while let Some(frame) = frames.next().await {
        let line = frame.map_err(|e| SchedulerError::Protocol(e.to_string()))?;
        match protocol::decode::<MasterMessage>(&line)? {
            MasterMessage::HelloOk => return Ok(()),
            other => tracing::debug!(action = other.name(), "Ignoring message before HELLO_OK"),
        }
    }
    Err(SchedulerError::Protocol("connection refused by master".to_string()))
}

async fn write_message(writer: &mut OwnedWriteHalf, message: &WorkerMessage) -> Result<()> {
    let mut line = protocol::encode(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}
