use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use lab_scheduler::config::{DispatcherConfig, DispatcherFilesConfig, MasterConfig};
use lab_scheduler::dispatcher::{CommandRunner, Dispatcher};
use lab_scheduler::inventory::Inventory;
use lab_scheduler::node::MasterNode;
use lab_scheduler::registry::MemoryRegistry;
use lab_scheduler::render::{BasicValidator, DirectoryRenderer};
use lab_scheduler::scheduler::split;
use lab_scheduler::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "lab-scheduler")]
#[command(version)]
#[command(about = "Job scheduler and dispatcher coordinator for shared lab devices")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the master: scheduler, dispatcher coordinator and dashboard
    Master(MasterArgs),

    /// Run a dispatcher that executes jobs as shell commands
    Dispatcher(DispatcherArgs),

    /// Split a multinode job definition and print the sub-jobs
    Split {
        /// Path to the job definition (YAML)
        file: PathBuf,

        /// Group id to embed in the sub-jobs
        #[arg(long, default_value = "preview")]
        target_group: String,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Master Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct MasterArgs {
    /// Inventory of workers, device types and devices (YAML)
    #[arg(long)]
    inventory: PathBuf,

    /// Directory holding one `<hostname>.yaml` device configuration per device
    #[arg(long, default_value = "/etc/lab-scheduler/devices")]
    devices_dir: PathBuf,

    /// Address dispatchers connect to
    #[arg(long, default_value = "0.0.0.0:5556")]
    listen: SocketAddr,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Ping interval announced to dispatchers
    #[arg(long, default_value = "20000")]
    ping_interval_ms: u64,

    /// Time between scheduling passes
    #[arg(long, default_value = "20000")]
    schedule_interval_ms: u64,

    /// Per-dispatcher configuration directory
    #[arg(long, default_value = "/etc/lab-scheduler/dispatcher.d")]
    dispatchers_path: PathBuf,

    /// Global env file sent to dispatchers
    #[arg(long, default_value = "/etc/lab-scheduler/env.yaml")]
    env_path: PathBuf,

    /// Global env.dut file sent to dispatchers
    #[arg(long, default_value = "/etc/lab-scheduler/env.dut.yaml")]
    env_dut_path: PathBuf,

    /// Keep candidate devices in hostname order instead of shuffling them
    #[arg(long)]
    no_shuffle: bool,

    /// Cancel jobs still queued after this many seconds, unless the job sets its own queue timeout
    #[arg(long)]
    queue_timeout_secs: Option<u64>,
}

// =============================================================================
// Dispatcher Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DispatcherArgs {
    /// Name this dispatcher registers under
    #[arg(long)]
    hostname: String,

    /// Master address
    #[arg(long, default_value = "127.0.0.1:5556")]
    master: String,

    /// Shell command run for every job, inside the job's directory
    #[arg(long)]
    command: String,

    /// Directory where job files are written
    #[arg(long, default_value = "/var/lib/lab-scheduler/jobs")]
    work_dir: PathBuf,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct SubJobOutput {
    role: String,
    sub_id: u32,
    definition: String,
}

#[derive(Serialize)]
struct SplitOutput {
    target_group: String,
    group_size: u32,
    jobs: Vec<SubJobOutput>,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_master(args: MasterArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let registry = Arc::new(MemoryRegistry::new());
    Inventory::from_file(&args.inventory)?.load_into(registry.as_ref())?;

    let config = MasterConfig {
        listen_addr: args.listen,
        ping_interval_ms: args.ping_interval_ms,
        schedule_interval_ms: args.schedule_interval_ms,
        files: DispatcherFilesConfig {
            dispatchers_path: args.dispatchers_path,
            env_path: args.env_path,
            env_dut_path: args.env_dut_path,
        },
        dashboard_addr,
        shuffle_devices: !args.no_shuffle,
        default_queue_timeout: args.queue_timeout_secs.map(Duration::from_secs),
        ..MasterConfig::default()
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        dashboard_addr = ?config.dashboard_addr,
        ping_interval_ms = config.ping_interval_ms,
        schedule_interval_ms = config.schedule_interval_ms,
        "Starting lab-scheduler master"
    );

    let shutdown = install_shutdown_handler();
    let node = MasterNode::new(
        config,
        registry,
        Arc::new(DirectoryRenderer::new(args.devices_dir)),
        Arc::new(BasicValidator),
    );
    node.run(shutdown).await?;
    Ok(())
}

async fn run_dispatcher(args: DispatcherArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    tracing::info!(hostname = %args.hostname, master = %args.master, "Starting dispatcher");

    let shutdown = install_shutdown_handler();
    let (dispatcher, handle) = Dispatcher::new(DispatcherConfig::new(args.hostname, args.master));
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(64);

    let runner = CommandRunner::new(args.command, args.work_dir);
    let runner_shutdown = shutdown.clone();
    tokio::spawn(async move {
        runner.run(events_rx, handle, runner_shutdown).await;
    });

    dispatcher.run(events_tx, shutdown).await?;
    Ok(())
}

fn run_split(file: PathBuf, target_group: String, output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(&file)?;
    let submission: serde_yaml::Mapping = serde_yaml::from_str(&text)?;
    let jobs = split(&submission, &target_group)?;

    match output {
        OutputFormat::Json => {
            let mut out = SplitOutput {
                target_group: jobs.target_group.clone(),
                group_size: jobs.group_size,
                jobs: Vec::new(),
            };
            for job in jobs.jobs() {
                out.jobs.push(SubJobOutput {
                    role: job.role.clone(),
                    sub_id: job.sub_id,
                    definition: serde_yaml::to_string(&job.definition)?,
                });
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Target group: {}", jobs.target_group);
            println!("Group size:   {}", jobs.group_size);
            println!();
            println!("{:<8} {:<20} TARGET", "SUB ID", "ROLE");
            println!("{}", "-".repeat(50));
            for job in jobs.jobs() {
                let target = job
                    .definition
                    .get("device_type")
                    .or_else(|| job.definition.get("connection"))
                    .and_then(serde_yaml::Value::as_str)
                    .unwrap_or("-");
                println!("{:<8} {:<20} {}", job.sub_id, job.role, target);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Master(master_args) => run_master(master_args).await?,
        Commands::Dispatcher(dispatcher_args) => run_dispatcher(dispatcher_args).await?,
        Commands::Split {
            file,
            target_group,
            output,
        } => run_split(file, target_group, output)?,
    }

    Ok(())
}
