//! End-to-end store scenarios
//!
//! Exercises the public surface the way an embedding application would:
//! open a store, create containers, run concurrent traffic, close and reopen.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tessera_core::{now_secs, ContainerMeta, Error, PutOptions, StoreConfig};
use tessera_engine::{AsyncContainers, StreamLookup, ValueLookup};

fn config() -> StoreConfig {
    StoreConfig::new()
        .with_block_size(256)
        .with_max_total_size(256 * 8192)
        .with_worker_threads(4)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ============================================================================
// Basic Operations
// ============================================================================

mod basic {
    use super::*;

    #[test]
    fn test_put_get_remove_in_ten_shards() {
        init_tracing();
        let store = AsyncContainers::in_memory(config()).unwrap();
        let container = store.create_container("basic", ContainerMeta::new(10)).unwrap();

        container.put(b"key1", b"value1", PutOptions::new()).wait().unwrap();
        assert_eq!(container.get(b"key1").wait().unwrap().value(), Some(&b"value1"[..]));
        assert!(container.remove(b"key1").wait().unwrap());
        assert!(!container.remove(b"key1").wait().unwrap());
    }

    #[test]
    fn test_versions_increase_on_overwrite() {
        let store = AsyncContainers::in_memory(config()).unwrap();
        let container = store.create_container("versions", ContainerMeta::new(3)).unwrap();

        let mut last = 0;
        for round in 0..5u8 {
            let record = container.put(b"k", &[round; 300], PutOptions::new()).wait().unwrap();
            assert!(record.version > last);
            last = record.version;
        }
        let forced = container
            .put(b"k", b"v", PutOptions::new().with_version(100).override_version())
            .wait()
            .unwrap();
        assert_eq!(forced.version, 100);
        assert_eq!(container.get(b"k").wait().unwrap().version(), Some(100));
    }

    #[test]
    fn test_version_on_absent_key_rejected() {
        let store = AsyncContainers::in_memory(config()).unwrap();
        let container = store.create_container("init", ContainerMeta::new(1)).unwrap();
        let err = container
            .put(b"new", b"v", PutOptions::new().with_version(3))
            .wait()
            .unwrap_err();
        assert!(matches!(err, Error::VersionMismatchInit { supplied: 3 }));
        assert!(err.is_business());
    }
}

// ============================================================================
// Quotas
// ============================================================================

mod quota {
    use super::*;

    #[test]
    fn test_concurrent_oversized_puts_roll_back() {
        init_tracing();
        let store = AsyncContainers::in_memory(config()).unwrap();
        let container = store
            .create_container("small", ContainerMeta::new(1).with_max_size(256 * 16))
            .unwrap();
        let before = store.stats().unwrap();

        let barrier = Arc::new(Barrier::new(10));
        let threads: Vec<_> = (0..10u8)
            .map(|i| {
                let container = Arc::clone(&container);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    container
                        .put(format!("big-{}", i).as_bytes(), &vec![i; 256 * 40], PutOptions::new())
                        .wait()
                })
            })
            .collect();
        for thread in threads {
            let result = thread.join().unwrap();
            assert!(matches!(result, Err(Error::QuotaExceeded { .. })));
        }

        let after = store.stats().unwrap();
        assert_eq!(after.free_bytes, before.free_bytes);
        assert_eq!(after.used_bytes, before.used_bytes);
        assert_eq!(container.stats().keys, 0);
    }

    #[test]
    fn test_values_within_quota_still_fit() {
        let store = AsyncContainers::in_memory(config()).unwrap();
        let container = store
            .create_container("fits", ContainerMeta::new(1).with_max_size(256 * 32))
            .unwrap();
        container.put(b"small", &[1u8; 1000], PutOptions::new()).wait().unwrap();
        assert!(matches!(
            container.put(b"big", &[2u8; 256 * 64], PutOptions::new()).wait(),
            Err(Error::QuotaExceeded { .. })
        ));
        assert_eq!(container.get(b"small").wait().unwrap().value().map(<[u8]>::len), Some(1000));
    }
}

// ============================================================================
// Expiry
// ============================================================================

mod expiry {
    use super::*;

    #[test]
    fn test_max_ttl_clamps_eol() {
        let store = AsyncContainers::in_memory(config()).unwrap();
        let container = store
            .create_container("ttl", ContainerMeta::new(2).with_max_ttl(3600))
            .unwrap();
        let before = now_secs();
        let record = container.put(b"k", b"v", PutOptions::new()).wait().unwrap();
        assert!(record.eol >= before + 3600 && record.eol <= now_secs() + 3600);

        let short = container.put(b"s", b"v", PutOptions::new().with_ttl(10)).wait().unwrap();
        assert!(short.eol <= now_secs() + 10);
    }

    #[test]
    fn test_expired_entries_are_swept() {
        init_tracing();
        let store = AsyncContainers::in_memory(config().with_cleanup_interval_millis(0)).unwrap();
        let container = store.create_container("sweep", ContainerMeta::new(1)).unwrap();
        let past = now_secs() - 60;
        for i in 0..20u32 {
            container
                .put(format!("old-{:02}", i).as_bytes(), &[7u8; 600], PutOptions::new().with_eol(past))
                .wait()
                .unwrap();
        }
        assert_eq!(container.get(b"old-00").wait().unwrap(), ValueLookup::NotFound);
        container.put(b"live", b"x", PutOptions::new()).wait().unwrap();

        // the sweep piggybacks on traffic, so keep reading until it has run
        let deadline = Instant::now() + Duration::from_secs(10);
        while container.stats().keys != 1 {
            assert!(Instant::now() < deadline, "expired entries never swept");
            assert_eq!(container.get(b"live").wait().unwrap().value(), Some(&b"x"[..]));
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(container.get(b"live").wait().unwrap().value(), Some(&b"x"[..]));
        let listing = container.list(b"", None, usize::MAX, usize::MAX).wait().unwrap();
        assert_eq!(listing.keys, vec![b"live".to_vec()]);
    }
}

// ============================================================================
// Listing
// ============================================================================

mod listing {
    use super::*;

    #[test]
    fn test_pagination_visits_every_key_once() {
        let store = AsyncContainers::in_memory(config()).unwrap();
        let container = store.create_container("pages", ContainerMeta::new(7)).unwrap();
        let mut expected: Vec<Vec<u8>> = (0..150u32).map(|i| format!("user:{:04}", i).into_bytes()).collect();
        for key in &expected {
            container.put(key, b"", PutOptions::new()).wait().unwrap();
        }
        container.put(b"other", b"", PutOptions::new()).wait().unwrap();

        let mut seen = Vec::new();
        let mut continuation: Option<Vec<u8>> = None;
        let mut pages = 0;
        loop {
            let page = container
                .list(b"user:", continuation.as_deref(), 16, usize::MAX)
                .wait()
                .unwrap();
            assert!(page.keys.len() <= 16);
            pages += 1;
            seen.extend(page.keys.iter().cloned());
            if !page.more {
                break;
            }
            continuation = page.keys.last().cloned();
        }
        assert!(pages >= 10);
        expected.sort_by_key(|k| (container.shard_of(k), k.clone()));
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_size_budget_limits_page() {
        let store = AsyncContainers::in_memory(config()).unwrap();
        let container = store.create_container("sized", ContainerMeta::new(1)).unwrap();
        for i in 0..10u32 {
            container.put(format!("k{}", i).as_bytes(), b"v", PutOptions::new()).wait().unwrap();
        }
        // every key is two bytes long
        let page = container.list(b"", None, usize::MAX, 7).wait().unwrap();
        assert_eq!(page.keys.len(), 3);
        assert!(page.more);
    }
}

// ============================================================================
// Streaming
// ============================================================================

mod streaming {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_large_value_streams_both_ways() {
        let store = AsyncContainers::in_memory(config()).unwrap();
        let container = store.create_container("blobs", ContainerMeta::new(2)).unwrap();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 251) as u8).collect();

        let (mut sink, handle) = container.put_stream(b"blob", PutOptions::new());
        let producer = {
            let payload = payload.clone();
            thread::spawn(move || {
                for chunk in payload.chunks(4096) {
                    sink.write_all(chunk).unwrap();
                }
                sink.finish().unwrap();
            })
        };
        let record = handle.wait().unwrap();
        producer.join().unwrap();
        assert_eq!(record.version, 1);

        match container.get_stream(b"blob").wait().unwrap() {
            StreamLookup::Found { mut reader, .. } => {
                let mut read = Vec::new();
                reader.read_to_end(&mut read).unwrap();
                assert_eq!(read, payload);
            }
            _ => panic!("blob not found"),
        }
        assert_eq!(container.get(b"blob").wait().unwrap().value().map(<[u8]>::len), Some(200_000));
    }
}

// ============================================================================
// Persistence
// ============================================================================

mod persistence {
    use super::*;

    #[test]
    fn test_close_and_reopen_preserves_blocks_and_data() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let stats_before = {
            let store = AsyncContainers::open_with_config(dir.path(), config()).unwrap();
            let container = store.create_container("durable", ContainerMeta::new(4)).unwrap();
            for i in 0..50u32 {
                container
                    .put(format!("key-{}", i).as_bytes(), &vec![i as u8; 100 + i as usize * 20], PutOptions::new())
                    .wait()
                    .unwrap();
            }
            container.remove(b"key-7").wait().unwrap();
            drop(container);
            store.flush().unwrap();
            let stats = store.stats().unwrap();
            store.close().unwrap();
            stats
        };

        let store = AsyncContainers::open(dir.path()).unwrap();
        let stats_after = store.stats().unwrap();
        assert_eq!(stats_after.free_blocks, stats_before.free_blocks);
        assert_eq!(stats_after.used_bytes, stats_before.used_bytes);
        assert_eq!(store.container_names().unwrap(), vec!["durable"]);

        let container = store.container("durable").unwrap();
        assert_eq!(container.meta().shard_number, 4);
        assert_eq!(container.get(b"key-7").wait().unwrap(), ValueLookup::NotFound);
        for i in (0..50u32).filter(|i| *i != 7) {
            let value = container.get(format!("key-{}", i).as_bytes()).wait().unwrap();
            assert_eq!(value.value(), Some(&vec![i as u8; 100 + i as usize * 20][..]));
        }
    }

    #[test]
    fn test_removed_container_stays_removed() {
        let dir = TempDir::new().unwrap();
        {
            let store = AsyncContainers::open_with_config(dir.path(), config()).unwrap();
            store.create_container("keep", ContainerMeta::new(1)).unwrap();
            store.create_container("drop", ContainerMeta::new(2)).unwrap();
            assert!(store.remove_container("drop").unwrap());
        }
        let store = AsyncContainers::open(dir.path()).unwrap();
        assert_eq!(store.container_names().unwrap(), vec!["keep"]);
        assert!(!store.contains_container("drop").unwrap());
    }
}
