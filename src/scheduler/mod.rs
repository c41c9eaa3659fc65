//! Matching queued jobs to devices.
//!
//! - [`matcher`]: device selection for one job
//! - [`multinode`]: splitting a multinode submission into sub-jobs
//! - [`health`]: when a device is due a health check
//! - [`submit`]: submission ingress and cancellation
//! - [`tick`]: the periodic scheduling pass tying them together

pub mod health;
pub mod matcher;
pub mod multinode;
pub mod submit;
pub mod tick;

pub use health::needs_health_check;
pub use matcher::select_device;
pub use multinode::{split, SplitJobs, SubJob};
pub use submit::{cancel_job, submit_job};
pub use tick::{schedule, TickOptions, TickReport, HEALTH_CHECK_SUBMITTER};
