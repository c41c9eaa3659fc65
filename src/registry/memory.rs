use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{Result, SchedulerError};
use crate::registry::{
    Device, DeviceType, Job, JobId, JobState, Registry, Transaction, Worker,
};

/// The rows of an in-memory registry.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    jobs: BTreeMap<JobId, Job>,
    devices: BTreeMap<String, Device>,
    device_types: BTreeMap<String, DeviceType>,
    workers: BTreeMap<String, Worker>,
    next_job_id: JobId,
}

impl Transaction for Tables {
    fn job(&self, id: JobId) -> Result<&Job> {
        self.jobs.get(&id).ok_or(SchedulerError::JobNotFound(id))
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs.get_mut(&id).ok_or(SchedulerError::JobNotFound(id))
    }

    fn insert_job(&mut self, mut job: Job) -> JobId {
        self.next_job_id += 1;
        job.id = self.next_job_id;
        self.jobs.insert(job.id, job);
        self.next_job_id
    }

    fn jobs_in_state(&self, state: JobState) -> Vec<&Job> {
        self.jobs.values().filter(|j| j.state() == state).collect()
    }

    fn group_members(&self, target_group: &str) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|j| j.target_group.as_deref() == Some(target_group))
            .collect()
    }

    fn device(&self, hostname: &str) -> Result<&Device> {
        self.devices
            .get(hostname)
            .ok_or_else(|| SchedulerError::DeviceNotFound(hostname.to_string()))
    }

    fn device_mut(&mut self, hostname: &str) -> Result<&mut Device> {
        self.devices
            .get_mut(hostname)
            .ok_or_else(|| SchedulerError::DeviceNotFound(hostname.to_string()))
    }

    fn insert_device(&mut self, device: Device) {
        self.devices.insert(device.hostname.clone(), device);
    }

    fn devices(&self) -> Vec<&Device> {
        self.devices.values().collect()
    }

    fn devices_of_type(&self, device_type: &str) -> Vec<&Device> {
        self.devices
            .values()
            .filter(|d| d.device_type == device_type)
            .collect()
    }

    fn device_type(&self, name: &str) -> Result<&DeviceType> {
        self.device_types
            .get(name)
            .ok_or_else(|| SchedulerError::DeviceTypeNotFound(name.to_string()))
    }

    fn insert_device_type(&mut self, device_type: DeviceType) {
        self.device_types.insert(device_type.name.clone(), device_type);
    }

    fn device_types(&self) -> Vec<&DeviceType> {
        self.device_types.values().collect()
    }

    fn worker(&self, hostname: &str) -> Result<&Worker> {
        self.workers
            .get(hostname)
            .ok_or_else(|| SchedulerError::WorkerNotFound(hostname.to_string()))
    }

    fn worker_mut(&mut self, hostname: &str) -> Result<&mut Worker> {
        self.workers
            .get_mut(hostname)
            .ok_or_else(|| SchedulerError::WorkerNotFound(hostname.to_string()))
    }

    fn upsert_worker(&mut self, worker: Worker) {
        self.workers.insert(worker.hostname.clone(), worker);
    }

    fn workers(&self) -> Vec<&Worker> {
        self.workers.values().collect()
    }
}

/// Registry kept in process memory.
///
/// A transaction works on a copy of the tables taken under the lock and swaps
/// it in on success, so a failed transaction leaves no partial writes behind.
/// The lock is held for the whole transaction, which serialises concurrent
/// schedulers the way row locks would.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    tables: Mutex<Tables>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| SchedulerError::Internal("registry lock poisoned".to_string()))
    }
}

impl Registry for MemoryRegistry {
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T>,
    {
        let mut guard = self.lock()?;
        let mut working = guard.clone();
        let value = f(&mut working)?;
        *guard = working;
        Ok(value)
    }

    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn Transaction) -> T,
    {
        let guard = self.lock()?;
        Ok(f(&*guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RequestedTarget;

    fn job() -> Job {
        Job::new("alice", "boot", RequestedTarget::DeviceType("qemu".into()), "")
    }

    #[test]
    fn ids_are_assigned_on_insert() {
        let registry = MemoryRegistry::new();
        let ids = registry
            .transaction(|tx| Ok((tx.insert_job(job()), tx.insert_job(job()))))
            .unwrap();
        assert_eq!(ids, (1, 2));
        assert_eq!(registry.job(2).unwrap().id, 2);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let registry = MemoryRegistry::new();
        let result: Result<()> = registry.transaction(|tx| {
            tx.insert_job(job());
            Err(SchedulerError::Conflict("abort".into()))
        });
        assert!(result.is_err());
        assert!(matches!(registry.job(1), Err(SchedulerError::JobNotFound(1))));
    }

    #[test]
    fn idle_devices_by_type_filters_state_and_type() {
        let registry = MemoryRegistry::new();
        registry
            .transaction(|tx| {
                tx.insert_device(Device::new("q1", "qemu", "w1"));
                tx.insert_device(Device::new("q2", "qemu", "w1"));
                tx.insert_device(Device::new("b1", "bbb", "w1"));
                tx.device_mut("q2")?.go_offline()?;
                Ok(())
            })
            .unwrap();
        let idle = registry.get_idle_devices_by_type("qemu").unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].hostname, "q1");
    }
}
