//! Shared data model for the cloudxfer transfer engine.
//!
//! Every other crate in the workspace speaks in these types: the signer
//! consumes [`Credential`], the planner produces [`ChunkDescriptor`]s, the
//! executor returns [`PartResult`]s, and the engine persists
//! [`TransferTask`] records and emits [`TransferEvent`]s.

pub mod events;
pub mod task;
pub mod types;

pub use events::TransferEvent;
pub use task::TransferTask;
pub use types::{
    ChunkDescriptor, Credential, PartResult, ProviderKind, TaskStatus, TransferDirection,
};
