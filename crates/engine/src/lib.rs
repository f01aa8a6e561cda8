//! Containers and stores for Tessera
//!
//! This crate puts the block layer and the schedulers together:
//! - ContainerShard: one key index plus the value chains it points at
//! - Container / ContainerListOperations: named shard groups and their directory
//! - AsyncContainer: key routing and the put/get/remove/list orchestration
//! - AsyncContainers: the store, with lazy container loading and idle reclamation
//! - update_with_retry: optimistic read-modify-write with jittered backoff

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod async_container;
pub mod container;
pub mod container_list;
pub mod retry;
pub mod routing;
pub mod shard;
pub mod store;

pub use async_container::{AsyncContainer, StreamLookup, ValueLookup};
pub use container::{Container, ContainerDescriptor, ContainerStats, MAX_SHARDS};
pub use container_list::ContainerListOperations;
pub use retry::{update_with_retry, RetryConfig};
pub use routing::{key_hash, shard_for_key};
pub use shard::{ContainerShard, ShardDescriptor};
pub use store::{AsyncContainers, StoreStats, OPEN_STORES, STORE_FILE_NAME};
