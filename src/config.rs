use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Version of the master/dispatcher wire protocol. A dispatcher announcing any
/// other version is refused.
pub const PROTOCOL_VERSION: u32 = 3;

/// Where the master looks for per-dispatcher environment files.
///
/// For a worker `w` the files are read from `<dispatchers_path>/w/`, falling
/// back to the global `env_path` / `env_dut_path` and to
/// `<dispatchers_path>/w.yaml` for the dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherFilesConfig {
    pub dispatchers_path: PathBuf,
    pub env_path: PathBuf,
    pub env_dut_path: PathBuf,
}

impl Default for DispatcherFilesConfig {
    fn default() -> Self {
        Self {
            dispatchers_path: PathBuf::from("/etc/lab-scheduler/dispatcher.d"),
            env_path: PathBuf::from("/etc/lab-scheduler/env.yaml"),
            env_dut_path: PathBuf::from("/etc/lab-scheduler/env.dut.yaml"),
        }
    }
}

impl DispatcherFilesConfig {
    /// Put every file under one directory, e.g. for tests.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            dispatchers_path: root.join("dispatcher.d"),
            env_path: root.join("env.yaml"),
            env_dut_path: root.join("env.dut.yaml"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub listen_addr: SocketAddr,
    /// Dispatchers are told to ping this often.
    pub ping_interval_ms: u64,
    /// A dispatcher silent for `ping_interval_ms * dispatcher_timeout_factor`
    /// is considered lost.
    pub dispatcher_timeout_factor: u32,
    pub schedule_interval_ms: u64,
    pub files: DispatcherFilesConfig,
    pub dashboard_addr: Option<SocketAddr>,
    /// Shuffle candidate devices before matching to spread load.
    pub shuffle_devices: bool,
    pub max_frame_len: usize,
    /// Applied to submissions that do not set `timeouts.queue`.
    pub default_queue_timeout: Option<Duration>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5556)),
            ping_interval_ms: 20_000,
            dispatcher_timeout_factor: 3,
            schedule_interval_ms: 20_000,
            files: DispatcherFilesConfig::default(),
            dashboard_addr: None,
            shuffle_devices: true,
            max_frame_len: 16 * 1024 * 1024,
            default_queue_timeout: None,
        }
    }
}

impl MasterConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_ping_interval_ms(mut self, ping_interval_ms: u64) -> Self {
        self.ping_interval_ms = ping_interval_ms;
        self
    }

    pub fn with_schedule_interval_ms(mut self, schedule_interval_ms: u64) -> Self {
        self.schedule_interval_ms = schedule_interval_ms;
        self
    }

    pub fn with_files(mut self, files: DispatcherFilesConfig) -> Self {
        self.files = files;
        self
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms.max(1))
    }

    pub fn dispatcher_timeout(&self) -> Duration {
        self.ping_interval() * self.dispatcher_timeout_factor
    }
}

/// Settings for the dispatcher side of the protocol.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub hostname: String,
    pub master_addr: String,
    /// Used until the master's PONG announces its interval.
    pub ping_interval_ms: u64,
    /// How long to wait for END_OK before sending END again.
    pub end_retry_ms: u64,
    pub max_frame_len: usize,
}

impl DispatcherConfig {
    pub fn new(hostname: impl Into<String>, master_addr: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            master_addr: master_addr.into(),
            ping_interval_ms: 20_000,
            end_retry_ms: 5_000,
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}
