//! Tests for attaching multiple cache handles to one shared store.
//!
//! Each attachment gets its own mapping, usually at a different base
//! address, so these tests exercise the offset-only discipline: writes
//! through one handle must be readable through another, and the lock in
//! the shared header must serialize them.

use shmcache::{CacheConfig, CacheError, ShmCache, StoreType};
use std::sync::Arc;

fn file_config(path: &std::path::Path) -> CacheConfig {
    CacheConfig::builder()
        .filename(path.to_str().unwrap())
        .store(StoreType::File)
        .max_memory(2 * 1024 * 1024)
        .segment_size(64 * 1024)
        .max_key_count(1024)
        .max_value_size(4096)
        .build()
        .expect("config")
}

#[test]
fn test_second_attachment_sees_writes() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(&dir.path().join("cache.bin"));

    let writer = ShmCache::new(config.clone()).unwrap();
    writer.set(b"shared", b"across mappings", 0).unwrap();

    let reader = ShmCache::new(config).unwrap();
    assert_eq!(
        reader.get(b"shared").unwrap().as_deref(),
        Some(&b"across mappings"[..])
    );

    // And the other direction.
    reader.set(b"reply", b"ack", 0).unwrap();
    assert_eq!(writer.get(b"reply").unwrap().as_deref(), Some(&b"ack"[..]));

    // Counters live in the shared header, so both handles agree.
    assert_eq!(writer.stats().ops.sets, reader.stats().ops.sets);
}

#[test]
fn test_attach_with_mismatched_config_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.bin");
    let _cache = ShmCache::new(file_config(&path)).unwrap();

    let mut other = file_config(&path);
    other.max_key_count = 2048;
    assert!(matches!(
        ShmCache::new(other),
        Err(CacheError::InvalidConfig(_))
    ));
}

#[test]
fn test_store_survives_detach() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(&dir.path().join("cache.bin"));

    {
        let cache = ShmCache::new(config.clone()).unwrap();
        cache.set(b"persistent", b"still here", 0).unwrap();
    }

    let cache = ShmCache::new(config).unwrap();
    assert_eq!(
        cache.get(b"persistent").unwrap().as_deref(),
        Some(&b"still here"[..])
    );
}

#[test]
fn test_remove_store_deletes_backing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.bin");
    let config = file_config(&path);

    let cache = ShmCache::new(config.clone()).unwrap();
    cache.set(b"k", b"v", 0).unwrap();
    drop(cache);

    assert!(path.exists());
    ShmCache::remove_store(&config).unwrap();
    assert!(!path.exists());

    // A fresh open starts from scratch.
    let cache = ShmCache::new(config).unwrap();
    assert_eq!(cache.get(b"k").unwrap(), None);
}

#[test]
fn test_racing_creation_initializes_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(&dir.path().join("cache.bin"));

    // All openers race on the same store; exactly one may initialize
    // it. A second initialization would wipe entries already written
    // through the winner's handle.
    let mut handles = Vec::new();
    for t in 0..4u32 {
        let config = config.clone();
        handles.push(std::thread::spawn(move || {
            let cache = ShmCache::new(config).unwrap();
            let key = format!("creator:{t}");
            cache.set(key.as_bytes(), b"present", 0).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let cache = ShmCache::new(config).unwrap();
    for t in 0..4u32 {
        let key = format!("creator:{t}");
        assert_eq!(
            cache.get(key.as_bytes()).unwrap().as_deref(),
            Some(&b"present"[..]),
            "entry lost to a duplicate initialization: {key}"
        );
    }
    let stats = cache.stats();
    assert_eq!(stats.ops.sets, 4);
    assert_eq!(stats.hash_table.current_key_count, 4);
}

#[test]
fn test_concurrent_writers_through_shared_handle() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(&dir.path().join("cache.bin"));
    let cache = Arc::new(ShmCache::new(config).unwrap());

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let cache = Arc::clone(&cache);
        handles.push(std::thread::spawn(move || {
            for i in 0..100u32 {
                let key = format!("t{t}:k{i}");
                let value = format!("t{t}:v{i}");
                cache.set(key.as_bytes(), value.as_bytes(), 0).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..4u32 {
        for i in 0..100u32 {
            let key = format!("t{t}:k{i}");
            let expect = format!("t{t}:v{i}");
            assert_eq!(
                cache.get(key.as_bytes()).unwrap().as_deref(),
                Some(expect.as_bytes()),
                "lost or corrupted {key}"
            );
        }
    }
    let stats = cache.stats();
    assert_eq!(stats.ops.sets, 400);
    assert_eq!(stats.hash_table.current_key_count, 400);
}
