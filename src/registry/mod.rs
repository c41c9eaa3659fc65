//! Persisted entities and the repository interface the scheduler works through.
//!
//! Everything that reads and then mutates a job or device does so inside
//! [`Registry::transaction`]: the closure sees a consistent view of the rows,
//! re-checks its preconditions there, and its writes are committed only if it
//! returns `Ok`. The matcher, scheduler tick and coordinator depend on these
//! traits only, never on a storage engine.

pub mod device;
pub mod job;
pub mod lifecycle;
pub mod memory;
pub mod worker;

pub use device::{
    Device, DeviceHealth, DeviceState, DeviceType, HealthCheckPolicy, HealthDenominator,
    HealthReport, Interface,
};
pub use job::{Job, JobHealth, JobId, JobState, Priority, RequestedTarget, VlanRequest};
pub use memory::MemoryRegistry;
pub use worker::{Worker, WorkerState};

use crate::error::Result;

/// Row-level access to the registry inside one transaction.
pub trait Transaction {
    fn job(&self, id: JobId) -> Result<&Job>;
    fn job_mut(&mut self, id: JobId) -> Result<&mut Job>;
    /// Persist a new job and return its id.
    fn insert_job(&mut self, job: Job) -> JobId;
    fn jobs_in_state(&self, state: JobState) -> Vec<&Job>;
    fn group_members(&self, target_group: &str) -> Vec<&Job>;

    fn device(&self, hostname: &str) -> Result<&Device>;
    fn device_mut(&mut self, hostname: &str) -> Result<&mut Device>;
    fn insert_device(&mut self, device: Device);
    fn devices(&self) -> Vec<&Device>;
    fn devices_of_type(&self, device_type: &str) -> Vec<&Device>;

    fn device_type(&self, name: &str) -> Result<&DeviceType>;
    fn insert_device_type(&mut self, device_type: DeviceType);
    fn device_types(&self) -> Vec<&DeviceType>;

    fn worker(&self, hostname: &str) -> Result<&Worker>;
    fn worker_mut(&mut self, hostname: &str) -> Result<&mut Worker>;
    fn upsert_worker(&mut self, worker: Worker);
    fn workers(&self) -> Vec<&Worker>;

    fn idle_devices_by_type(&self, device_type: &str) -> Vec<&Device> {
        self.devices_of_type(device_type)
            .into_iter()
            .filter(|d| d.state() == DeviceState::Idle)
            .collect()
    }

    fn devices_on_worker(&self, worker: &str) -> Vec<&Device> {
        self.devices()
            .into_iter()
            .filter(|d| d.worker == worker)
            .collect()
    }

    /// Number of reserved or running devices on a worker.
    fn busy_devices_on_worker(&self, worker: &str) -> usize {
        self.devices_on_worker(worker)
            .into_iter()
            .filter(|d| d.state().is_busy())
            .count()
    }
}

/// A transactional store for jobs, devices and workers.
pub trait Registry: Send + Sync + 'static {
    /// Run `f` atomically. Writes become visible only if `f` returns `Ok`.
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T>;

    /// Run a read-only closure against a consistent view.
    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn Transaction) -> T;

    fn get_idle_devices_by_type(&self, device_type: &str) -> Result<Vec<Device>> {
        self.read(|tx| {
            tx.idle_devices_by_type(device_type)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    /// Atomically reserve `hostname` for `job_id`. Returns `false` when either
    /// row no longer satisfies the precondition, e.g. a concurrent tick won.
    fn try_reserve(&self, job_id: JobId, hostname: &str) -> Result<bool> {
        self.transaction(|tx| lifecycle::try_reserve(tx, job_id, hostname))
    }

    fn job(&self, id: JobId) -> Result<Job> {
        self.read(|tx| tx.job(id).cloned())?
    }

    fn device(&self, hostname: &str) -> Result<Device> {
        self.read(|tx| tx.device(hostname).cloned())?
    }
}
