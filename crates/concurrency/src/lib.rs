//! Operation scheduling for Tessera
//!
//! This crate decides when shard operations run and carries their results:
//! - WorkerPool: the shared, bounded priority pool every operation runs on
//! - Promise / OperationHandle: one-shot results with bounded waits
//! - ContainerShardExecutor: per-shard admission of key and value operations
//! - CleanupManager: interval-gated maintenance triggered by regular traffic
//! - value_stream: bounded chunked pipes for streaming values

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod executor;
pub mod operation;
pub mod pool;
pub mod stream;

pub use cleanup::CleanupManager;
pub use executor::{
    Completion, ContainerShardExecutor, ExecutorStats, KeyOperationKind, KeyState, ValueOperation,
};
pub use operation::{promise, OperationHandle, Promise};
pub use pool::{Admission, Job, PoolStats, TaskPriority, WorkerPool};
pub use stream::{value_stream, ValueReader, ValueSink, ValueSource};
