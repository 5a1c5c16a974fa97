//! Resumable transfer engine.
//!
//! [`TransferScheduler`] owns the task set: it admits pending tasks up to a
//! global cap, and on every terminal transition frees the slot and admits
//! the next one. Each admitted task runs in its own [`TransferStateMachine`],
//! which drives the parts through a bounded worker pool and persists the
//! task record after every step so a restart can pick up where it stopped.

pub mod config;
pub mod error;
pub mod machine;
pub mod scheduler;
pub mod store;

pub use config::{EngineConfig, RetryConfig};
pub use error::EngineError;
pub use machine::{EngineContext, RunControl, RunOutcome, TransferStateMachine};
pub use scheduler::{TaskGroups, TransferScheduler};
pub use store::TaskStore;
