use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::MasterConfig;
use crate::coordinator::{serve, Master};
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::registry::Registry;
use crate::render::{DeviceRenderer, SubmissionValidator};

/// The master process: coordinator server plus the optional dashboard, all
/// sharing one registry.
pub struct MasterNode<R: Registry> {
    pub config: MasterConfig,
    pub registry: Arc<R>,
    pub renderer: Arc<dyn DeviceRenderer>,
    pub validator: Arc<dyn SubmissionValidator>,
}

impl<R: Registry> MasterNode<R> {
    pub fn new(
        config: MasterConfig,
        registry: Arc<R>,
        renderer: Arc<dyn DeviceRenderer>,
        validator: Arc<dyn SubmissionValidator>,
    ) -> Self {
        Self {
            config,
            registry,
            renderer,
            validator,
        }
    }

    /// Run the master until `shutdown` fires.
    ///
    /// 1. Marks every worker offline until it says HELLO
    /// 2. Optionally spawns the dashboard server
    /// 3. Runs the coordinator loop (blocking)
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be bound or the registry
    /// fails while resetting worker state. The dashboard runs as a spawned task
    /// and logs its own errors.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let master = Master::new(self.registry.clone(), self.renderer.clone(), self.config.clone())?;

        if let Some(dashboard_addr) = self.config.dashboard_addr {
            let dashboard_state = DashboardState {
                registry: self.registry.clone(),
                validator: self.validator.clone(),
                default_queue_timeout: self.config.default_queue_timeout,
            };
            let dashboard_shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = run_dashboard(dashboard_addr, dashboard_state) => {}
                    _ = dashboard_shutdown.cancelled() => {}
                }
            });
        }

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        serve(listener, master, shutdown).await
    }
}
