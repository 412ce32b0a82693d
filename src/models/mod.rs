//! Data transfer objects for the operation API.
//!
//! These structs are serialized to JSON for the orchestrator and persisted
//! verbatim by the store.
//! - `operation`: Operation, OperationSetup/Setup, RepositoryStrategy,
//!   OperationLoadFiles, RepositoryInfo

pub mod operation;

pub use operation::*;
