//! Root directory of containers
//!
//! The container list is itself a key index, allocated from the root pool:
//! container names are its keys, and each record points at a chain holding
//! the container's serialized `ContainerDescriptor`. The first block of the
//! index is kept in the superblock, which makes it the one piece of state
//! needed to reopen every container of a store.

use parking_lot::RwLock;
use std::sync::Arc;
use tessera_core::{now_secs, Error, RecordOptions, Result, EOL_NEVER};
use tessera_storage::{
    BlockAllocator, BlockArena, BlockContainer, BlockStorage, BlockType, KeyBlockOperations,
    VarSizeMultiBlock,
};
use tracing::debug;

use crate::container::ContainerDescriptor;

/// Persistent name -> descriptor map of a store.
pub struct ContainerListOperations {
    arena: Arc<BlockArena>,
    root: Arc<dyn BlockAllocator>,
    keys: RwLock<KeyBlockOperations>,
    descriptors: VarSizeMultiBlock,
}

impl ContainerListOperations {
    /// Open the list recorded in the superblock, creating it on a fresh store.
    pub fn open(storage: &BlockStorage) -> Result<Self> {
        let arena = Arc::clone(storage.arena());
        let root: Arc<dyn BlockAllocator> = storage.root().clone();
        let keys = match storage.container_list_start() {
            Some(start) => KeyBlockOperations::load(Arc::clone(&arena), Arc::clone(&root), start)?,
            None => {
                let keys = KeyBlockOperations::create(Arc::clone(&arena), Arc::clone(&root))?;
                storage.set_container_list_start(keys.start_index())?;
                debug!(start = keys.start_index(), "created container list");
                keys
            }
        };
        Ok(Self {
            descriptors: VarSizeMultiBlock::new(*arena.geometry(), BlockType::Data),
            arena,
            root,
            keys: RwLock::new(keys),
        })
    }

    fn tx(&self) -> BlockContainer {
        BlockContainer::new(Arc::clone(&self.arena))
    }

    /// Record a new container.
    ///
    /// Fails with `ContainerExists` if the name is taken.
    pub fn insert(&self, name: &str, descriptor: &ContainerDescriptor) -> Result<()> {
        let bytes = descriptor.encode()?;
        let mut tx = self.tx();
        let id = self.descriptors.store(&mut tx, self.root.as_ref(), &bytes)?;
        let put = self.keys.write().put(
            name.as_bytes(),
            id,
            EOL_NEVER,
            None,
            RecordOptions::ONLY_INSERT,
            now_secs(),
        );
        match put {
            Ok(_) => Ok(()),
            Err(e) => {
                self.descriptors.free(&mut tx, self.root.as_ref(), id)?;
                Err(match e {
                    Error::OptionMismatch(_) => Error::ContainerExists(name.to_string()),
                    other => other,
                })
            }
        }
    }

    /// Descriptor of container `name`
    pub fn get(&self, name: &str) -> Result<Option<ContainerDescriptor>> {
        let record = match self.keys.read().get(name.as_bytes(), now_secs())? {
            Some(record) => record,
            None => return Ok(None),
        };
        let mut tx = self.tx();
        let bytes = self.descriptors.read(&mut tx, record.id)?;
        ContainerDescriptor::decode(&bytes).map(Some)
    }

    /// Whether container `name` exists
    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.keys.read().get(name.as_bytes(), now_secs())?.is_some())
    }

    /// Forget container `name`, returning its descriptor.
    pub fn remove(&self, name: &str) -> Result<Option<ContainerDescriptor>> {
        let record = match self.keys.write().remove_any(name.as_bytes())? {
            Some(record) => record,
            None => return Ok(None),
        };
        let mut tx = self.tx();
        let bytes = self.descriptors.read(&mut tx, record.id)?;
        self.descriptors.free(&mut tx, self.root.as_ref(), record.id)?;
        ContainerDescriptor::decode(&bytes).map(Some)
    }

    /// Every container name, sorted
    pub fn names(&self) -> Result<Vec<String>> {
        let listing = self
            .keys
            .read()
            .list(b"", None, usize::MAX, usize::MAX, now_secs())?;
        listing
            .keys
            .into_iter()
            .map(|key| {
                String::from_utf8(key)
                    .map_err(|e| Error::corruption(format!("container name is not UTF-8: {}", e)))
            })
            .collect()
    }

    /// Trim the index's spare tail.
    pub fn close(&self) -> Result<()> {
        self.keys.write().close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardDescriptor;
    use tessera_core::{ContainerMeta, StoreConfig};

    fn descriptor(shards: u32) -> ContainerDescriptor {
        ContainerDescriptor {
            meta: ContainerMeta::new(shards),
            shards: (0..u64::from(shards))
                .map(|i| ShardDescriptor {
                    allocator_start: 100 + i,
                    keys_start: 200 + i,
                })
                .collect(),
        }
    }

    fn storage() -> BlockStorage {
        let config = StoreConfig::new()
            .with_block_size(256)
            .with_max_total_size(256 * 1024);
        BlockStorage::in_memory(&config, None).unwrap()
    }

    #[test]
    fn test_insert_get_remove() {
        let storage = storage();
        let list = ContainerListOperations::open(&storage).unwrap();
        assert!(storage.container_list_start().is_some());

        list.insert("orders", &descriptor(4)).unwrap();
        list.insert("customers", &descriptor(2)).unwrap();
        assert!(list.contains("orders").unwrap());
        assert_eq!(list.get("orders").unwrap(), Some(descriptor(4)));
        assert_eq!(list.names().unwrap(), vec!["customers", "orders"]);

        assert_eq!(list.remove("orders").unwrap(), Some(descriptor(4)));
        assert_eq!(list.remove("orders").unwrap(), None);
        assert!(list.get("orders").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_name_rejected_without_leak() {
        let storage = storage();
        let list = ContainerListOperations::open(&storage).unwrap();
        list.insert("dup", &descriptor(1)).unwrap();
        let before = storage.stats();

        let err = list.insert("dup", &descriptor(8)).unwrap_err();
        assert!(matches!(err, Error::ContainerExists(ref name) if name == "dup"));
        let after = storage.stats();
        assert_eq!(
            after.free_blocks + after.catalog_blocks,
            before.free_blocks + before.catalog_blocks
        );
        assert_eq!(list.get("dup").unwrap(), Some(descriptor(1)));
    }

    #[test]
    fn test_reopen_through_superblock() {
        let storage = storage();
        {
            let list = ContainerListOperations::open(&storage).unwrap();
            list.insert("kept", &descriptor(3)).unwrap();
            list.close().unwrap();
        }
        let list = ContainerListOperations::open(&storage).unwrap();
        assert_eq!(list.get("kept").unwrap(), Some(descriptor(3)));
    }
}
