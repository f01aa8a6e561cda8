//! Tessera - embedded single-file block key-value engine
//!
//! A store is one pre-sized file of fixed-size blocks. Named containers live
//! inside it, each split into shards that keep a sorted key index and the
//! value chains it points at. Every operation is scheduled per shard and
//! returns a handle the caller waits on.
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::{AsyncContainers, ContainerMeta, PutOptions};
//!
//! let store = AsyncContainers::open("/path/to/store")?;
//! let users = store.create_container("users", ContainerMeta::new(10))?;
//!
//! users.put(b"alice", b"admin", PutOptions::new()).wait()?;
//! let role = users.get(b"alice").wait()?;
//! ```
//!
//! # Architecture
//!
//! - `tessera-core`: errors, configuration, records and put options
//! - `tessera-storage`: blocks, catalogs, allocators and key indexes
//! - `tessera-concurrency`: worker pool, operation handles, shard executors
//! - `tessera-engine`: containers and the store

pub use tessera_concurrency::{OperationHandle, ValueReader, ValueSink};
pub use tessera_core::{
    ContainerMeta, Error, PutOptions, Record, RecordOptions, Result, StoreConfig, EOL_NEVER,
    ID_UNDEFINED, VERSION_INITIAL,
};
pub use tessera_engine::{
    update_with_retry, AsyncContainer, AsyncContainers, ContainerStats, RetryConfig, StoreStats,
    StreamLookup, ValueLookup,
};
pub use tessera_storage::{AllocationObserver, KeyListing};
