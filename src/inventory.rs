//! Static lab inventory: workers, device types and devices read from one YAML
//! file and loaded into a registry at startup.
//!
//! ```yaml
//! workers:
//!   - hostname: worker01
//!     job_limit: 2
//! device_types:
//!   - name: qemu
//!     health_check:
//!       definition: "job_name: qemu health\nactions: []"
//!       frequency: 24
//!       denominator: hours
//! devices:
//!   - hostname: qemu01
//!     device_type: qemu
//!     worker: worker01
//!     tags: [usb]
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, SchedulerError};
use crate::registry::{Device, DeviceHealth, DeviceType, HealthCheckPolicy, Interface, Registry, Worker};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Inventory {
    #[serde(default)]
    pub workers: Vec<WorkerEntry>,
    #[serde(default)]
    pub device_types: Vec<DeviceTypeEntry>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerEntry {
    pub hostname: String,
    #[serde(default)]
    pub job_limit: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceTypeEntry {
    pub name: String,
    #[serde(default)]
    pub health_check: Option<HealthCheckPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    pub hostname: String,
    pub device_type: String,
    pub worker: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub exclusive: bool,
    /// Starting health; new devices default to unknown and get checked first.
    #[serde(default)]
    pub health: Option<DeviceHealth>,
}

impl Inventory {
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Insert every entry in one transaction. A device naming an unknown
    /// worker or device type aborts the whole load.
    pub fn load_into<R: Registry>(&self, registry: &R) -> Result<()> {
        registry.transaction(|tx| {
            for entry in &self.workers {
                tx.upsert_worker(Worker::new(&entry.hostname).with_job_limit(entry.job_limit));
            }
            for entry in &self.device_types {
                let mut device_type = DeviceType::new(&entry.name);
                if let Some(policy) = &entry.health_check {
                    if policy.frequency == 0 && !policy.disabled {
                        return Err(SchedulerError::Conflict(format!(
                            "device type {}: health check frequency must be positive",
                            entry.name
                        )));
                    }
                    device_type = device_type.with_health_check(policy.clone());
                }
                tx.insert_device_type(device_type);
            }
            for entry in &self.devices {
                tx.device_type(&entry.device_type)?;
                tx.worker(&entry.worker)?;
                if tx.device(&entry.hostname).is_ok() {
                    return Err(SchedulerError::Conflict(format!("duplicate device {}", entry.hostname)));
                }
                let mut device = Device::new(&entry.hostname, &entry.device_type, &entry.worker)
                    .with_tags(entry.tags.iter().cloned())
                    .with_interfaces(entry.interfaces.clone())
                    .exclusive(entry.exclusive);
                if let Some(health) = entry.health {
                    device = device.with_health(health);
                }
                tx.insert_device(device);
            }
            Ok(())
        })?;
        tracing::info!(
            workers = self.workers.len(),
            device_types = self.device_types.len(),
            devices = self.devices.len(),
            "Inventory loaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::registry::{DeviceState, HealthDenominator, MemoryRegistry};

    const INVENTORY: &str = r#"
workers:
  - hostname: worker01
    job_limit: 2
  - hostname: worker02
device_types:
  - name: qemu
    health_check:
      definition: "job_name: check"
      frequency: 10
      denominator: jobs
  - name: bbb
devices:
  - hostname: qemu01
    device_type: qemu
    worker: worker01
    tags: [usb, hdmi]
    health: good
  - hostname: bbb01
    device_type: bbb
    worker: worker02
    exclusive: true
    interfaces:
      - name: eth1
        switch: sw1
        port: "5"
        tags: [1G]
"#;

    #[test]
    fn loads_all_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(INVENTORY.as_bytes()).unwrap();

        let inventory = Inventory::from_file(file.path()).unwrap();
        let registry = MemoryRegistry::new();
        inventory.load_into(&registry).unwrap();

        let qemu = registry.device("qemu01").unwrap();
        assert_eq!(qemu.health(), DeviceHealth::Good);
        assert_eq!(qemu.state(), DeviceState::Idle);
        assert!(qemu.tags.contains("usb"));

        let bbb = registry.device("bbb01").unwrap();
        assert!(bbb.is_exclusive);
        assert_eq!(bbb.health(), DeviceHealth::Unknown);
        assert_eq!(bbb.interfaces[0].tags.len(), 1);

        let policy = registry
            .read(|tx| tx.device_type("qemu").map(|dt| dt.health_check.clone()))
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(policy.denominator, HealthDenominator::Jobs);
        assert_eq!(policy.frequency, 10);

        let worker = registry.read(|tx| tx.worker("worker01").cloned()).unwrap().unwrap();
        assert_eq!(worker.job_limit, 2);
        assert!(!worker.is_online());
    }

    #[test]
    fn unknown_worker_aborts_load() {
        let inventory = Inventory::from_yaml(
            "device_types:\n  - name: qemu\ndevices:\n  - hostname: q1\n    device_type: qemu\n    worker: nowhere\n",
        )
        .unwrap();
        let registry = MemoryRegistry::new();
        assert!(matches!(
            inventory.load_into(&registry),
            Err(SchedulerError::WorkerNotFound(_))
        ));
        assert!(registry.read(|tx| tx.device_types().is_empty()).unwrap());
    }

    #[test]
    fn empty_file_is_empty_inventory() {
        let inventory = Inventory::from_yaml("  \n").unwrap();
        assert!(inventory.devices.is_empty());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Inventory::from_yaml("switches: []\n").is_err());
    }
}
