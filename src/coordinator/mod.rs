//! Master side of the dispatcher protocol.
//!
//! - [`protocol`]: message types and their line-delimited JSON encoding
//! - [`master`]: the protocol state machine, free of any I/O
//! - [`server`]: TCP transport and the single dispatch loop
//!
//! # Protocol
//!
//! A dispatcher connects and sends `HELLO` (fresh start) or `HELLO_RETRY`
//! (reconnection), answered by `HELLO_OK`. It then pings periodically and gets
//! `PONG` with the interval to use. The master pushes `START` for jobs
//! reserved on the dispatcher's devices until `START_OK` arrives, and `CANCEL`
//! for canceling jobs. The dispatcher reports `END` until it receives
//! `END_OK`. Every message is idempotent.

pub mod master;
pub mod protocol;
pub mod server;

pub use master::{LinkState, Master, Outbound};
pub use protocol::{MasterMessage, WorkerMessage};
pub use server::serve;
