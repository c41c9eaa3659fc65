//! Worker-side end of the dispatcher protocol.
//!
//! [`Dispatcher`] keeps one connection to the master alive and turns `START`
//! and `CANCEL` into [`DispatcherEvent`]s. [`CommandRunner`] is a simple
//! consumer that runs each job as a shell command and reports the result
//! through [`DispatcherHandle::finish`].

pub mod client;
pub mod heartbeat;
pub mod runner;

pub use client::{Dispatcher, DispatcherEvent, DispatcherHandle, StartRequest};
pub use heartbeat::Heartbeat;
pub use runner::{CommandRunner, RunOutcome};
