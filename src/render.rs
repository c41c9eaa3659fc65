//! Collaborators the scheduler calls out to: device configuration rendering,
//! submission validation and the dispatcher environment files.

use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use crate::config::DispatcherFilesConfig;
use crate::error::{Result, SchedulerError};
use crate::registry::Device;

/// Turns a device and a job's `context` into the device configuration sent
/// with START.
pub trait DeviceRenderer: Send + Sync {
    fn render(&self, device: &Device, context: Option<&Value>) -> Result<String>;

    /// The reduced configuration given to dynamic connections, which only need
    /// to reach the device, not drive it.
    fn minimise(&self, config: &str) -> Result<String> {
        let full: Mapping = serde_yaml::from_str(config)?;
        let minimal: Mapping = full
            .into_iter()
            .filter(|(key, _)| {
                matches!(
                    key.as_str(),
                    Some("hostname" | "device_type" | "commands" | "timeouts")
                )
            })
            .collect();
        Ok(serde_yaml::to_string(&minimal)?)
    }
}

/// Reads `<root>/<hostname>.yaml`. Keys from the job context override the
/// keys of the stored configuration.
#[derive(Debug, Clone)]
pub struct DirectoryRenderer {
    root: PathBuf,
}

impl DirectoryRenderer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DeviceRenderer for DirectoryRenderer {
    fn render(&self, device: &Device, context: Option<&Value>) -> Result<String> {
        let path = self.root.join(format!("{}.yaml", device.hostname));
        let text = std::fs::read_to_string(&path).map_err(|e| {
            SchedulerError::Render(format!("Cannot open '{}': {}", path.display(), e))
        })?;
        let mut config: Mapping = serde_yaml::from_str(&text).map_err(|e| {
            SchedulerError::Render(format!("Invalid device configuration '{}': {}", path.display(), e))
        })?;
        if let Some(context) = context.and_then(Value::as_mapping) {
            for (key, value) in context {
                config.insert(key.clone(), value.clone());
            }
        }
        Ok(serde_yaml::to_string(&config)?)
    }
}

/// Schema check for raw submissions.
pub trait SubmissionValidator: Send + Sync {
    fn validate(&self, definition: &Mapping) -> Result<()>;
}

/// Checks the handful of keys the scheduler itself relies on.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicValidator;

impl SubmissionValidator for BasicValidator {
    fn validate(&self, definition: &Mapping) -> Result<()> {
        match definition.get("job_name") {
            Some(Value::String(name)) if !name.trim().is_empty() => {}
            _ => return Err(SchedulerError::submission("job_name is required")),
        }
        let actions = definition
            .get("actions")
            .and_then(Value::as_sequence)
            .ok_or_else(|| SchedulerError::submission("actions must be a list"))?;
        if actions.is_empty() {
            return Err(SchedulerError::submission("actions must not be empty"));
        }
        let multinode = definition
            .get("protocols")
            .and_then(|p| p.get("lava-multinode"))
            .is_some();
        if !multinode && definition.get("device_type").is_none() && definition.get("target").is_none() {
            return Err(SchedulerError::submission(
                "device_type or target is required",
            ));
        }
        Ok(())
    }
}

/// Environment blobs sent to a dispatcher with every START.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherFiles {
    pub env: String,
    pub env_dut: String,
    pub dispatcher_config: String,
}

#[derive(Debug, Clone, Default)]
pub struct DispatcherConfigLoader {
    files: DispatcherFilesConfig,
}

impl DispatcherConfigLoader {
    pub fn new(files: DispatcherFilesConfig) -> Self {
        Self { files }
    }

    pub fn load(&self, worker: &str) -> Result<DispatcherFiles> {
        let dir = self.files.dispatchers_path.join(worker);
        Ok(DispatcherFiles {
            env: load_optional_yaml(&dir.join("env.yaml"), Some(&self.files.env_path))?,
            env_dut: load_optional_yaml(&dir.join("env.dut.yaml"), Some(&self.files.env_dut_path))?,
            dispatcher_config: load_optional_yaml(
                &dir.join("dispatcher.yaml"),
                Some(&self.files.dispatchers_path.join(format!("{}.yaml", worker))),
            )?,
        })
    }
}

/// Missing files are fine and yield an empty blob; a file that exists but is
/// unreadable or not YAML is an error.
fn load_optional_yaml(path: &Path, fallback: Option<&Path>) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            serde_yaml::from_str::<Value>(&text).map_err(|e| {
                SchedulerError::Render(format!("'{}' is not a valid YAML file: {}", path.display(), e))
            })?;
            Ok(text)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => match fallback {
            Some(fallback) => load_optional_yaml(fallback, None),
            None => Ok(String::new()),
        },
        Err(e) => Err(SchedulerError::Render(format!(
            "Cannot open '{}': {}",
            path.display(),
            e
        ))),
    }
}
