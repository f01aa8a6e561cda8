//! The store: every container of one block file
//!
//! `AsyncContainers` owns the block storage, the container list and the
//! worker pool shared by every container. Containers are opened lazily on
//! first access and closed again once idle with no handle left outside the
//! store, which keeps a store with many containers cheap to hold open.
//!
//! Store-wide maintenance rides on container traffic:
//! - idle cached blocks are written back and dropped
//! - idle containers are closed, to be reloaded on next access
//!
//! ## Lifecycle
//!
//! `open(dir)` maps `dir/tessera.db`, creating it on first use, with the
//! settings of `dir/tessera.toml`. Closing shuts every container down, waits
//! for admitted work, persists every cache and stops the pool. Dropping the
//! last handle closes the store.

mod registry;

pub use registry::OPEN_STORES;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_concurrency::{CleanupManager, WorkerPool};
use tessera_core::{now_millis, ContainerMeta, Error, Result, StoreConfig};
use tessera_storage::{AllocationObserver, BlockAllocator, BlockStorage};
use tracing::{debug, info, warn};

use crate::async_container::AsyncContainer;
use crate::container::Container;
use crate::container_list::ContainerListOperations;

/// Name of the block file inside a store directory
pub const STORE_FILE_NAME: &str = "tessera.db";

/// Usage of a whole store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Blocks in the file
    pub total_blocks: u64,
    /// Blocks in the root free pool
    pub free_blocks: u64,
    /// Blocks not in the root free pool
    pub used_blocks: u64,
    /// Bytes per block
    pub block_size: usize,
    /// `free_blocks` in bytes
    pub free_bytes: u64,
    /// `used_blocks` in bytes
    pub used_bytes: u64,
    /// Containers in the container list
    pub containers: usize,
    /// Containers currently loaded in memory
    pub open_containers: usize,
}

/// Loaded containers, shared with the idle-container sweep.
#[derive(Default)]
struct OpenContainers {
    entries: DashMap<String, Arc<AsyncContainer>>,
    /// Serializes loading, creating, removing and reclaiming containers
    admin: Mutex<()>,
}

impl OpenContainers {
    /// Close containers unused for `idle_millis` that nobody outside the
    /// store holds.
    fn close_idle(&self, idle_millis: u64) {
        // busy admin means a create, remove or close is running; try next round
        let Some(_admin) = self.admin.try_lock() else {
            return;
        };
        let now = now_millis();
        let reclaimable = |container: &Arc<AsyncContainer>| {
            Arc::strong_count(container) == 1
                && container.is_idle()
                && now.saturating_sub(container.last_used_millis()) >= idle_millis
        };
        let idle: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| reclaimable(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        for name in idle {
            if let Some((_, container)) = self.entries.remove_if(&name, |_, c| reclaimable(c)) {
                match container.close() {
                    Ok(()) => debug!(container = %name, "closed idle container"),
                    Err(e) => warn!(container = %name, error = %e, "closing idle container failed"),
                }
            }
        }
    }
}

/// An open store.
pub struct AsyncContainers {
    data_dir: Option<PathBuf>,
    config: StoreConfig,
    storage: Arc<BlockStorage>,
    list: ContainerListOperations,
    pool: Arc<WorkerPool>,
    open: Arc<OpenContainers>,
    background: Vec<Arc<CleanupManager>>,
    closed: AtomicBool,
}

impl AsyncContainers {
    // ========================================================================
    // Opening
    // ========================================================================

    /// Open the store in `dir`, creating the directory, its config file and
    /// its block file as needed.
    ///
    /// Opening a directory that is already open returns the same instance.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Arc<Self>> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let config = StoreConfig::load_or_create(dir)?;
        Self::open_in(dir, config)
    }

    /// Open the store in `dir` with `config`, writing `config` to the
    /// directory's config file so later `open` calls use it.
    ///
    /// A block file that already exists keeps the geometry it was created with.
    pub fn open_with_config<P: AsRef<Path>>(dir: P, config: StoreConfig) -> Result<Arc<Self>> {
        let dir = dir.as_ref();
        config.validate()?;
        std::fs::create_dir_all(dir)?;
        config.write_to_file(&dir.join(tessera_core::CONFIG_FILE_NAME))?;
        Self::open_in(dir, config)
    }

    fn open_in(dir: &Path, config: StoreConfig) -> Result<Arc<Self>> {
        let canonical = dir.canonicalize()?;

        // held throughout so two threads cannot map the same file
        let mut registry = OPEN_STORES.lock();
        if let Some(store) = registry.get(&canonical).and_then(|weak| weak.upgrade()) {
            if !store.is_closed() {
                debug!(path = ?canonical, "returning existing store instance");
                return Ok(store);
            }
        }

        let file = canonical.join(STORE_FILE_NAME);
        let storage = if file.exists() {
            BlockStorage::open_file(&file, &config)?
        } else {
            BlockStorage::create_file(&file, &config)?
        };
        let store = Arc::new(Self::build(storage, config, Some(canonical.clone()))?);
        registry.insert(canonical.clone(), Arc::downgrade(&store));
        info!(path = ?canonical, "store opened");
        Ok(store)
    }

    /// Fresh heap-backed store, gone once dropped.
    pub fn in_memory(config: StoreConfig) -> Result<Arc<Self>> {
        Self::in_memory_with_observer(config, None)
    }

    /// Fresh heap-backed store reporting root allocations to `observer`.
    pub fn in_memory_with_observer(
        config: StoreConfig,
        observer: Option<Arc<dyn AllocationObserver>>,
    ) -> Result<Arc<Self>> {
        let storage = BlockStorage::in_memory(&config, observer)?;
        Ok(Arc::new(Self::build(storage, config, None)?))
    }

    fn build(storage: BlockStorage, config: StoreConfig, data_dir: Option<PathBuf>) -> Result<Self> {
        let storage = Arc::new(storage);
        let list = ContainerListOperations::open(&storage)?;
        let pool = Arc::new(WorkerPool::new(config.worker_threads, config.max_queue_depth)?);
        let open = Arc::new(OpenContainers::default());

        let blocks = {
            let storage = Arc::clone(&storage);
            let idle = config.close_unused_blocks_after();
            CleanupManager::new("idle blocks", config.cleanup_interval(), move || {
                let closed = storage.close_unused_blocks(idle)?;
                if closed > 0 {
                    debug!(closed, "closed idle blocks");
                }
                Ok(())
            })
        };
        let containers = {
            let open = Arc::clone(&open);
            let idle_millis = config.close_unused_sequences_after_millis;
            CleanupManager::new("idle containers", config.cleanup_interval(), move || {
                open.close_idle(idle_millis);
                Ok(())
            })
        };

        Ok(Self {
            data_dir,
            config,
            storage,
            list,
            pool,
            open,
            background: vec![blocks, containers],
            closed: AtomicBool::new(false),
        })
    }

    /// Directory of a file-backed store
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// Settings the store was opened with
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    fn root(&self) -> Arc<dyn BlockAllocator> {
        self.storage.root().clone()
    }

    fn activate(&self, container: Container) -> Arc<AsyncContainer> {
        let name = container.name().to_string();
        let container = Arc::new(AsyncContainer::new(container, &self.pool, &self.background, &self.config));
        self.open.entries.insert(name, Arc::clone(&container));
        container
    }

    // ========================================================================
    // Containers
    // ========================================================================

    /// Handle on container `name`, loading it if it is not open.
    pub fn container(&self, name: &str) -> Result<Arc<AsyncContainer>> {
        self.check_open()?;
        if let Some(open) = self.open.entries.get(name) {
            return Ok(Arc::clone(open.value()));
        }
        let _admin = self.open.admin.lock();
        if let Some(open) = self.open.entries.get(name) {
            return Ok(Arc::clone(open.value()));
        }
        let descriptor = self
            .list
            .get(name)?
            .ok_or_else(|| Error::ContainerNotFound(name.to_string()))?;
        let container = Container::load(
            name,
            &descriptor,
            self.storage.arena(),
            &self.root(),
            self.config.secondary_cache,
        )?;
        debug!(container = name, "container loaded");
        Ok(self.activate(container))
    }

    /// Create container `name` and open it.
    ///
    /// # Errors
    ///
    /// `ContainerExists` if the name is taken, `InvalidArgument` for an empty
    /// name or a shard number outside `1..=256`, `QuotaExceeded` if the store
    /// cannot hold the shards. A failed create leaves no blocks behind.
    pub fn create_container(&self, name: &str, meta: ContainerMeta) -> Result<Arc<AsyncContainer>> {
        self.check_open()?;
        if name.is_empty() {
            return Err(Error::invalid_argument("container names must not be empty"));
        }
        let _admin = self.open.admin.lock();
        if self.list.contains(name)? {
            return Err(Error::ContainerExists(name.to_string()));
        }
        let container = Container::create(
            name,
            meta,
            self.storage.arena(),
            &self.root(),
            self.config.secondary_cache,
        )?;
        if let Err(e) = container
            .descriptor()
            .and_then(|descriptor| self.list.insert(name, &descriptor))
        {
            if let Err(cleanup) = container.remove() {
                warn!(container = name, error = %cleanup, "rollback of failed create failed");
            }
            return Err(e);
        }
        info!(container = name, shards = meta.shard_number, max_size = meta.max_size, "container created");
        Ok(self.activate(container))
    }

    /// Remove container `name` and every block it holds.
    ///
    /// Returns false if there is no such container. Handles still held on
    /// the container fail further operations with `Interrupted`.
    pub fn remove_container(&self, name: &str) -> Result<bool> {
        self.check_open()?;
        let _admin = self.open.admin.lock();
        let descriptor = match self.list.remove(name)? {
            Some(descriptor) => descriptor,
            None => return Ok(false),
        };
        let released = match self.open.entries.remove(name) {
            Some((_, open)) => {
                open.shutdown();
                open.wait_for_shutdown();
                open.container().remove()?
            }
            None => Container::load(
                name,
                &descriptor,
                self.storage.arena(),
                &self.root(),
                self.config.secondary_cache,
            )?
            .remove()?,
        };
        info!(container = name, released, "container removed");
        Ok(true)
    }

    /// Every container name, sorted
    pub fn container_names(&self) -> Result<Vec<String>> {
        self.list.names()
    }

    /// Settings of container `name`
    pub fn container_meta(&self, name: &str) -> Result<Option<ContainerMeta>> {
        if let Some(open) = self.open.entries.get(name) {
            return Ok(Some(*open.value().meta()));
        }
        Ok(self.list.get(name)?.map(|descriptor| descriptor.meta))
    }

    /// Whether container `name` exists
    pub fn contains_container(&self, name: &str) -> Result<bool> {
        self.list.contains(name)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Persist every open container, the container list and the block cache.
    pub fn flush(&self) -> Result<()> {
        let open: Vec<Arc<AsyncContainer>> = self.open.entries.iter().map(|e| Arc::clone(e.value())).collect();
        for container in open {
            container.flush()?;
        }
        self.list.close()?;
        self.storage.flush()
    }

    /// Current usage
    pub fn stats(&self) -> Result<StoreStats> {
        let blocks = self.storage.stats();
        let block_size = blocks.block_size as u64;
        Ok(StoreStats {
            total_blocks: blocks.total_blocks,
            free_blocks: blocks.free_blocks,
            used_blocks: blocks.used_blocks(),
            block_size: blocks.block_size,
            free_bytes: blocks.free_blocks * block_size,
            used_bytes: blocks.used_blocks() * block_size,
            containers: self.list.names()?.len(),
            open_containers: self.open.entries.len(),
        })
    }

    /// Shut every container down, wait for admitted work, persist everything
    /// and stop the pool. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.shutdown_and_flush();
        self.pool.shutdown();
        if let Some(dir) = &self.data_dir {
            let mut registry = OPEN_STORES.lock();
            if registry.get(dir).is_some_and(|weak| std::ptr::eq(weak.as_ptr(), self)) {
                registry.remove(dir);
            }
        }
        info!(path = ?self.data_dir, "store closed");
        result
    }

    fn shutdown_and_flush(&self) -> Result<()> {
        let _admin = self.open.admin.lock();
        let open: Vec<Arc<AsyncContainer>> = self.open.entries.iter().map(|e| Arc::clone(e.value())).collect();
        self.open.entries.clear();
        for container in &open {
            container.shutdown();
        }
        let mut first_error = None;
        for container in &open {
            container.wait_for_shutdown();
            if let Err(e) = container.flush() {
                warn!(container = %container.name(), error = %e, "flush on close failed");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.list.close() {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.storage.flush() {
            first_error.get_or_insert(e);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for AsyncContainers {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "closing store on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_container::ValueLookup;
    use std::time::{Duration, Instant};
    use tessera_core::PutOptions;

    fn config() -> StoreConfig {
        StoreConfig::new()
            .with_block_size(256)
            .with_max_total_size(256 * 4096)
            .with_worker_threads(2)
    }

    #[test]
    fn test_create_use_remove_container() {
        let store = AsyncContainers::in_memory(config()).unwrap();
        let before = store.storage.stats();

        let users = store.create_container("users", ContainerMeta::new(4)).unwrap();
        users.put(b"alice", b"admin", PutOptions::new()).wait().unwrap();
        assert!(store.contains_container("users").unwrap());
        assert_eq!(store.container_names().unwrap(), vec!["users"]);
        assert_eq!(store.container_meta("users").unwrap().map(|m| m.shard_number), Some(4));

        assert!(matches!(
            store.create_container("users", ContainerMeta::new(1)),
            Err(Error::ContainerExists(_))
        ));

        assert!(store.remove_container("users").unwrap());
        assert!(!store.remove_container("users").unwrap());
        assert!(matches!(
            users.get(b"alice").wait(),
            Err(Error::Interrupted)
        ));
        assert!(matches!(store.container("users"), Err(Error::ContainerNotFound(_))));

        store.flush().unwrap();
        assert_eq!(store.stats().unwrap().containers, 0);
        let after = store.storage.stats();
        assert_eq!(
            after.free_blocks + after.catalog_blocks,
            before.free_blocks + before.catalog_blocks
        );
    }

    #[test]
    fn test_invalid_container_rejected() {
        let store = AsyncContainers::in_memory(config()).unwrap();
        assert!(matches!(
            store.create_container("", ContainerMeta::new(1)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            store.create_container("zero", ContainerMeta::new(0)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(!store.contains_container("zero").unwrap());
    }

    #[test]
    fn test_open_same_dir_returns_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        let first = AsyncContainers::open_with_config(dir.path(), config()).unwrap();
        let second = AsyncContainers::open(dir.path()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().block_size, 256);
    }

    #[test]
    fn test_closed_store_is_replaced_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let first = AsyncContainers::open_with_config(dir.path(), config()).unwrap();
        first.create_container("c", ContainerMeta::new(2)).unwrap();
        first.close().unwrap();
        assert!(matches!(first.container("c"), Err(Error::Interrupted)));

        let second = AsyncContainers::open(dir.path()).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.contains_container("c").unwrap());
    }

    #[test]
    fn test_idle_container_closed_and_reloaded() {
        let config = config()
            .with_cleanup_interval_millis(0)
            .with_close_unused_sequences_after_millis(0);
        let store = AsyncContainers::in_memory(config).unwrap();
        {
            let cold = store.create_container("cold", ContainerMeta::new(1)).unwrap();
            cold.put(b"k", b"v", PutOptions::new()).wait().unwrap();
        }
        let hot = store.create_container("hot", ContainerMeta::new(1)).unwrap();

        // traffic on `hot` drives the idle sweep that closes `cold`
        let deadline = Instant::now() + Duration::from_secs(10);
        while store.stats().unwrap().open_containers > 1 {
            assert!(Instant::now() < deadline, "idle container never closed");
            hot.put(b"tick", b"tock", PutOptions::new()).wait().unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }

        let cold = store.container("cold").unwrap();
        assert_eq!(
            cold.get(b"k").wait().unwrap(),
            ValueLookup::Found {
                value: b"v".to_vec(),
                version: 1
            }
        );
    }
}
