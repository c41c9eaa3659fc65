pub mod config;
pub mod coordinator;
pub mod dashboard;
pub mod dispatcher;
pub mod error;
pub mod inventory;
pub mod node;
pub mod registry;
pub mod render;
pub mod scheduler;
pub mod shutdown;
