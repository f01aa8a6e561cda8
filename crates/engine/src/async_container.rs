//! Asynchronous operations on one container
//!
//! Every key is routed to one shard, and every operation on it goes through
//! that shard's executor. Operations return an `OperationHandle` right away;
//! callers wait on it or drop it.
//!
//! ## Put
//!
//! A put runs in two phases. The value is written to a fresh chain first,
//! outside the key slot, so a large payload never holds up other key
//! operations. The key write that installs the record is admitted from the
//! value write's continuation. If the key write fails (version conflict,
//! insert-only on a live key), the fresh chain is deleted before the error
//! reaches the caller. A replaced value is deleted by an autonomous operation
//! the caller does not wait for.
//!
//! ## Get
//!
//! The record is read under a shared key slot, and the value read is admitted
//! before that slot is released. A delete of the value therefore either waits
//! for the read or cancels it, and a cancelled read is reported as not found.
//!
//! ## List
//!
//! Shards are listed one after the other, starting at the shard owning the
//! continuation key. Keys come back shard-major and sorted within a shard.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tessera_concurrency::{
    promise, value_stream, CleanupManager, Completion, ContainerShardExecutor, KeyOperationKind,
    OperationHandle, Promise, ValueOperation, ValueReader, ValueSink, WorkerPool,
};
use tessera_core::{
    now_millis, now_secs, ContainerMeta, Error, PutOptions, Record, Result, StoreConfig,
    ID_UNDEFINED,
};
use tessera_storage::{KeyListing, PutOutcome};
use tracing::{debug, warn};

use crate::container::{Container, ContainerStats};
use crate::shard::ContainerShard;

/// Outcome of a buffered get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueLookup {
    /// The key holds `value`
    Found {
        /// Stored bytes
        value: Vec<u8>,
        /// Record version
        version: u64,
    },
    /// The key exists with a zero-length value
    Empty {
        /// Record version
        version: u64,
    },
    /// The key is absent, expired, or its value was deleted under the read
    NotFound,
}

impl ValueLookup {
    /// Stored bytes; empty for `Empty`, `None` for `NotFound`
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            ValueLookup::Found { value, .. } => Some(value),
            ValueLookup::Empty { .. } => Some(&[]),
            ValueLookup::NotFound => None,
        }
    }

    /// Record version, if the key exists
    pub fn version(&self) -> Option<u64> {
        match self {
            ValueLookup::Found { version, .. } | ValueLookup::Empty { version } => Some(*version),
            ValueLookup::NotFound => None,
        }
    }

    /// Whether the key exists
    pub fn is_found(&self) -> bool {
        !matches!(self, ValueLookup::NotFound)
    }
}

/// Outcome of a streaming get.
pub enum StreamLookup {
    /// The key holds a value, readable from `reader`
    Found {
        /// Reader over the value, fed chunk by chunk
        reader: ValueReader,
        /// Record version
        version: u64,
    },
    /// The key exists with a zero-length value
    Empty {
        /// Record version
        version: u64,
    },
    /// The key is absent, expired, or its value was deleted under the read
    NotFound,
}

#[derive(Clone)]
struct ShardHandle {
    shard: Arc<ContainerShard>,
    executor: Arc<ContainerShardExecutor>,
}

/// Handle on an open container.
pub struct AsyncContainer {
    container: Arc<Container>,
    shards: Arc<[ShardHandle]>,
    stream_chunk_size: usize,
    stream_capacity: usize,
    last_used: AtomicU64,
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("keys must not be empty"));
    }
    Ok(())
}

/// Free value `id` without anyone waiting on the outcome.
fn delete_value_later(
    executor: &Arc<ContainerShardExecutor>,
    shard: &Arc<ContainerShard>,
    id: u64,
    label: &'static str,
) {
    let shard = Arc::clone(shard);
    executor.value_operation(
        ValueOperation::Delete(id),
        false,
        move || shard.delete_value(id),
        Completion::Autonomous(label),
    );
}

/// Expiry sweep of one shard, run as an exclusive key operation.
fn expiry_sweep(
    shard: &Arc<ContainerShard>,
    executor: &Arc<ContainerShardExecutor>,
    interval: Duration,
) -> Arc<CleanupManager> {
    let name = format!("{} expiry", shard.name());
    let shard = Arc::clone(shard);
    let executor: Weak<ContainerShardExecutor> = Arc::downgrade(executor);
    CleanupManager::new(name, interval, move || {
        let garbage = shard.sweep_expired(now_secs())?;
        if let Some(executor) = executor.upgrade() {
            for id in garbage {
                delete_value_later(&executor, &shard, id, "expired value delete");
            }
        }
        Ok(())
    })
}

/// Phase two of a put: install `id` under `key`.
fn install(
    handle: ShardHandle,
    key: Vec<u8>,
    id: u64,
    options: PutOptions,
    fail_in_shutdown: bool,
    producer: Promise<Record>,
) {
    let shard = Arc::clone(&handle.shard);
    let executor = Arc::clone(&handle.executor);
    executor.key_operation(
        KeyOperationKind::Write,
        fail_in_shutdown,
        move || shard.put_record(&key, id, &options, now_secs()),
        Completion::then(move |outcome: Result<PutOutcome>| match outcome {
            Ok(outcome) => {
                if let Some(replaced) = outcome.replaced {
                    if replaced.has_value() {
                        delete_value_later(&handle.executor, &handle.shard, replaced.id, "replaced value delete");
                    }
                }
                producer.complete(Ok(outcome.record));
            }
            Err(e) if id == ID_UNDEFINED => producer.complete(Err(e)),
            Err(e) => {
                let shard = Arc::clone(&handle.shard);
                handle.executor.value_operation(
                    ValueOperation::Delete(id),
                    false,
                    move || shard.delete_value(id),
                    Completion::then(move |cleanup: Result<()>| {
                        if let Err(cleanup) = cleanup {
                            warn!(value = id, error = %cleanup, "compensating delete after failed put failed");
                        }
                        producer.complete(Err(e));
                    }),
                );
            }
        }),
    );
}

struct ListCursor {
    prefix: Vec<u8>,
    continuation: Option<Vec<u8>>,
    max_number: usize,
    max_size: usize,
    shard: usize,
    size: usize,
    first: bool,
    listing: KeyListing,
}

/// List shard `cursor.shard`, then chain to the next shard from inside the
/// continuation.
fn list_step(shards: Arc<[ShardHandle]>, mut cursor: ListCursor, producer: Promise<KeyListing>) {
    let handle = shards[cursor.shard].clone();
    let shard = Arc::clone(&handle.shard);
    let prefix = cursor.prefix.clone();
    let continuation = cursor.continuation.take();
    let remaining = cursor.max_number - cursor.listing.keys.len();
    let remaining_size = cursor.max_size - cursor.size;
    let fail_in_shutdown = cursor.first;
    cursor.first = false;
    handle.executor.key_operation(
        KeyOperationKind::Read,
        fail_in_shutdown,
        move || shard.list(&prefix, continuation.as_deref(), remaining, remaining_size, now_secs()),
        Completion::then(move |page: Result<KeyListing>| {
            let page = match page {
                Ok(page) => page,
                Err(e) => return producer.complete(Err(e)),
            };
            cursor.size += page.keys.iter().map(Vec::len).sum::<usize>();
            cursor.listing.keys.extend(page.keys);
            let next = cursor.shard + 1;
            let exhausted =
                cursor.listing.keys.len() >= cursor.max_number || cursor.size >= cursor.max_size;
            if page.more || (exhausted && next < shards.len()) {
                cursor.listing.more = true;
                producer.complete(Ok(cursor.listing));
            } else if next >= shards.len() {
                producer.complete(Ok(cursor.listing));
            } else {
                cursor.shard = next;
                list_step(shards, cursor, producer);
            }
        }),
    );
}

impl AsyncContainer {
    /// Wrap `container`, giving every shard an executor on `pool`.
    ///
    /// `background` is the store-wide maintenance piggybacked on this
    /// container's operations.
    pub fn new(
        container: Container,
        pool: &Arc<WorkerPool>,
        background: &[Arc<CleanupManager>],
        config: &StoreConfig,
    ) -> Self {
        let container = Arc::new(container);
        let shards: Vec<ShardHandle> = container
            .shards()
            .iter()
            .map(|shard| {
                let executor = ContainerShardExecutor::new(shard.name(), Arc::clone(pool), background.to_vec());
                executor.set_expiry_cleanup(expiry_sweep(shard, &executor, config.cleanup_interval()));
                ShardHandle {
                    shard: Arc::clone(shard),
                    executor,
                }
            })
            .collect();
        debug!(container = %container.name(), shards = shards.len(), "container opened");
        Self {
            container,
            shards: Arc::from(shards),
            stream_chunk_size: config.stream_chunk_size,
            stream_capacity: config.stream_channel_capacity,
            last_used: AtomicU64::new(now_millis()),
        }
    }

    /// Container name
    pub fn name(&self) -> &str {
        self.container.name()
    }

    /// Settings fixed at creation
    pub fn meta(&self) -> &ContainerMeta {
        self.container.meta()
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Index of the shard owning `key`
    pub fn shard_of(&self, key: &[u8]) -> usize {
        self.container.shard_index(key)
    }

    fn route(&self, key: &[u8]) -> &ShardHandle {
        self.last_used.store(now_millis(), Ordering::Relaxed);
        &self.shards[self.container.shard_index(key)]
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Store `value` under `key`. Resolves to the record now stored.
    pub fn put(&self, key: &[u8], value: &[u8], options: PutOptions) -> OperationHandle<Record> {
        if let Err(e) = check_key(key) {
            return OperationHandle::failed(e);
        }
        let handle = self.route(key).clone();
        let (producer, result) = promise();
        let key = key.to_vec();
        if value.is_empty() {
            install(handle, key, ID_UNDEFINED, options, true, producer);
            return result;
        }
        let value = value.to_vec();
        let shard = Arc::clone(&handle.shard);
        let executor = Arc::clone(&handle.executor);
        executor.value_operation(
            ValueOperation::Write,
            true,
            move || shard.write_value(&value),
            Completion::then(move |written: Result<u64>| match written {
                Ok(id) => install(handle, key, id, options, false, producer),
                Err(e) => producer.complete(Err(e)),
            }),
        );
        result
    }

    /// Store a value streamed through the returned sink under `key`.
    ///
    /// The put completes after the sink is finished. Dropping the sink
    /// unfinished fails the put with `Interrupted` and frees what was
    /// written.
    pub fn put_stream(&self, key: &[u8], options: PutOptions) -> (ValueSink, OperationHandle<Record>) {
        let (sink, source) = value_stream(self.stream_chunk_size, self.stream_capacity);
        if let Err(e) = check_key(key) {
            return (sink, OperationHandle::failed(e));
        }
        let handle = self.route(key).clone();
        let (producer, result) = promise();
        let key = key.to_vec();
        let shard = Arc::clone(&handle.shard);
        let executor = Arc::clone(&handle.executor);
        executor.value_operation(
            ValueOperation::Write,
            true,
            move || shard.write_value_from(source),
            Completion::then(move |written: Result<u64>| match written {
                Ok(id) => install(handle, key, id, options, false, producer),
                Err(e) => producer.complete(Err(e)),
            }),
        );
        (sink, result)
    }

    /// Read the value of `key`.
    pub fn get(&self, key: &[u8]) -> OperationHandle<ValueLookup> {
        if let Err(e) = check_key(key) {
            return OperationHandle::failed(e);
        }
        let handle = self.route(key).clone();
        let (producer, result) = promise();
        let key = key.to_vec();
        let shard = Arc::clone(&handle.shard);
        let executor = Arc::clone(&handle.executor);
        executor.key_operation(
            KeyOperationKind::Read,
            true,
            move || shard.get_record(&key, now_secs()),
            Completion::then(move |found: Result<Option<Record>>| match found {
                Err(e) => producer.complete(Err(e)),
                Ok(None) => producer.complete(Ok(ValueLookup::NotFound)),
                Ok(Some(record)) if !record.has_value() => {
                    producer.complete(Ok(ValueLookup::Empty {
                        version: record.version,
                    }))
                }
                Ok(Some(record)) => {
                    let shard = Arc::clone(&handle.shard);
                    handle.executor.value_operation(
                        ValueOperation::Read(record.id),
                        false,
                        move || shard.read_value(record.id),
                        Completion::then(move |read: Result<Vec<u8>>| {
                            producer.complete(match read {
                                Ok(value) => Ok(ValueLookup::Found {
                                    value,
                                    version: record.version,
                                }),
                                Err(Error::Cancelled) => Ok(ValueLookup::NotFound),
                                Err(e) => Err(e),
                            })
                        }),
                    );
                }
            }),
        );
        result
    }

    /// Read the value of `key` as a stream.
    ///
    /// The handle resolves as soon as the value read starts; the reader then
    /// yields the value with bounded buffering.
    pub fn get_stream(&self, key: &[u8]) -> OperationHandle<StreamLookup> {
        if let Err(e) = check_key(key) {
            return OperationHandle::failed(e);
        }
        let handle = self.route(key).clone();
        let (producer, result) = promise();
        let key = key.to_vec();
        let (chunk_size, capacity) = (self.stream_chunk_size, self.stream_capacity);
        let shard = Arc::clone(&handle.shard);
        let executor = Arc::clone(&handle.executor);
        executor.key_operation(
            KeyOperationKind::Read,
            true,
            move || shard.get_record(&key, now_secs()),
            Completion::then(move |found: Result<Option<Record>>| match found {
                Err(e) => producer.complete(Err(e)),
                Ok(None) => producer.complete(Ok(StreamLookup::NotFound)),
                Ok(Some(record)) if !record.has_value() => {
                    producer.complete(Ok(StreamLookup::Empty {
                        version: record.version,
                    }))
                }
                Ok(Some(record)) => {
                    let pending = Arc::new(Mutex::new(Some(producer)));
                    let started = Arc::clone(&pending);
                    let shard = Arc::clone(&handle.shard);
                    handle.executor.value_operation(
                        ValueOperation::Read(record.id),
                        false,
                        move || {
                            let (mut sink, source) = value_stream(chunk_size, capacity);
                            if let Some(producer) = started.lock().take() {
                                producer.complete(Ok(StreamLookup::Found {
                                    reader: source.into_reader(),
                                    version: record.version,
                                }));
                            }
                            match shard.stream_value(record.id, &mut sink) {
                                Ok(()) => {
                                    if sink.finish().is_err() {
                                        debug!(value = record.id, "stream reader went away");
                                    }
                                }
                                Err(e) => sink.fail(e),
                            }
                            Ok(())
                        },
                        Completion::then(move |streamed: Result<()>| {
                            if let Err(e) = streamed {
                                if let Some(producer) = pending.lock().take() {
                                    producer.complete(match e {
                                        Error::Cancelled => Ok(StreamLookup::NotFound),
                                        e => Err(e),
                                    });
                                }
                            }
                        }),
                    );
                }
            }),
        );
        result
    }

    /// Remove `key`. Resolves to whether a live entry was removed.
    pub fn remove(&self, key: &[u8]) -> OperationHandle<bool> {
        if let Err(e) = check_key(key) {
            return OperationHandle::failed(e);
        }
        let handle = self.route(key).clone();
        let (producer, result) = promise();
        let key = key.to_vec();
        let shard = Arc::clone(&handle.shard);
        let executor = Arc::clone(&handle.executor);
        executor.key_operation(
            KeyOperationKind::Delete,
            true,
            move || shard.remove_record(&key),
            Completion::then(move |removed: Result<Option<Record>>| match removed {
                Err(e) => producer.complete(Err(e)),
                Ok(None) => producer.complete(Ok(false)),
                Ok(Some(record)) => {
                    if record.has_value() {
                        delete_value_later(&handle.executor, &handle.shard, record.id, "removed value delete");
                    }
                    producer.complete(Ok(!record.is_expired(now_secs())));
                }
            }),
        );
        result
    }

    /// List live keys starting with `prefix`, after `continuation` when given.
    ///
    /// At most `max_number` keys totalling at most `max_size` bytes are
    /// returned; `more` is set when the listing stopped early.
    pub fn list(
        &self,
        prefix: &[u8],
        continuation: Option<&[u8]>,
        max_number: usize,
        max_size: usize,
    ) -> OperationHandle<KeyListing> {
        self.last_used.store(now_millis(), Ordering::Relaxed);
        let shard = continuation.map_or(0, |key| self.container.shard_index(key));
        let (producer, result) = promise();
        let cursor = ListCursor {
            prefix: prefix.to_vec(),
            continuation: continuation.map(<[u8]>::to_vec),
            max_number,
            max_size,
            shard,
            size: 0,
            first: true,
            listing: KeyListing::default(),
        };
        list_step(Arc::clone(&self.shards), cursor, producer);
        result
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Current usage
    pub fn stats(&self) -> ContainerStats {
        self.container.stats()
    }

    /// Blocks held by the key indexes. Every other owned block belongs to a
    /// value chain.
    pub fn index_blocks(&self) -> Result<u64> {
        self.container.index_blocks()
    }

    /// Whether no shard has queued or running work
    pub fn is_idle(&self) -> bool {
        self.shards.iter().all(|h| h.executor.is_idle())
    }

    /// Unix milliseconds of the last operation submitted
    pub fn last_used_millis(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }

    /// Failed autonomous operations across every shard
    pub fn autonomous_failures(&self) -> u64 {
        self.shards.iter().map(|h| h.executor.autonomous_failures()).sum()
    }

    /// Reject new operations; admitted ones keep running.
    pub fn shutdown(&self) {
        for handle in self.shards.iter() {
            handle.executor.shutdown();
        }
    }

    /// Block until every shard is shut down and idle.
    pub fn wait_for_shutdown(&self) {
        for handle in self.shards.iter() {
            handle.executor.wait_for_shutdown();
        }
    }

    /// Persist every shard's caches.
    pub fn flush(&self) -> Result<()> {
        self.container.flush()
    }

    /// Shut down, drain, and flush.
    pub fn close(&self) -> Result<()> {
        self.shutdown();
        self.wait_for_shutdown();
        self.container.flush()?;
        debug!(container = %self.name(), "container closed");
        Ok(())
    }

    pub(crate) fn container(&self) -> &Arc<Container> {
        &self.container
    }
}
