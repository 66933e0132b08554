#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::Arc;

use common::clock::FakeClock;
use tempfile::TempDir;

use gcsfs::cache::fs_backed::FileSystemBackedDirectoryListCache;
use gcsfs::cache::{CacheConfig, CacheError, DirectoryListCache};
use gcsfs::resource_id::ResourceId;

fn obj(bucket: &str, object: &str) -> ResourceId {
    ResourceId::Object {
        bucket: bucket.to_owned(),
        object: object.to_owned(),
    }
}

fn mirror(
    dir: &TempDir,
    config: CacheConfig,
    clock: &FakeClock,
) -> FileSystemBackedDirectoryListCache {
    FileSystemBackedDirectoryListCache::with_clock(
        dir.path().to_path_buf(),
        config,
        Arc::new(clock.clone()),
    )
}

#[test]
fn mirrors_files_and_directories() {
    let dir = TempDir::new().unwrap();
    let clock = FakeClock::from_system_time();
    let cache = mirror(&dir, CacheConfig::default(), &clock);

    cache.put_resource(&obj("b", "data/f.txt")).unwrap();
    cache.put_resource(&obj("b", "data/sub/")).unwrap();

    assert!(dir.path().join("b/data/f.txt").is_file());
    assert!(dir.path().join("b/data/sub").is_dir());

    assert!(cache.get_entry(&obj("b", "data/f.txt")).unwrap().is_some());
    assert!(cache.get_entry(&obj("b", "data/sub/")).unwrap().is_some());
    assert!(cache.get_entry(&obj("b", "ghost")).unwrap().is_none());
}

#[test]
fn existence_is_shared_through_the_mount() {
    let dir = TempDir::new().unwrap();
    let clock = FakeClock::from_system_time();
    // Two cache instances over the same base path, as two processes would.
    let writer = mirror(&dir, CacheConfig::default(), &clock);
    let reader = mirror(&dir, CacheConfig::default(), &clock);

    writer.put_resource(&obj("b", "shared")).unwrap();
    assert!(reader.get_entry(&obj("b", "shared")).unwrap().is_some());
}

#[test]
fn object_list_walks_the_hierarchy() {
    let dir = TempDir::new().unwrap();
    let clock = FakeClock::from_system_time();
    let cache = mirror(&dir, CacheConfig::default(), &clock);

    cache.put_resource(&obj("b", "a")).unwrap();
    cache.put_resource(&obj("b", "d/")).unwrap();
    cache.put_resource(&obj("b", "d/inner")).unwrap();

    let mut names: Vec<String> = cache
        .object_list("b")
        .unwrap()
        .iter()
        .filter_map(|e| e.id().object_name().map(str::to_owned))
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["a".to_owned(), "d/".to_owned(), "d/inner".to_owned()]
    );

    let buckets: Vec<String> = cache
        .bucket_list()
        .unwrap()
        .iter()
        .filter_map(|e| e.id().bucket_name().map(str::to_owned))
        .collect();
    assert_eq!(buckets, vec!["b".to_owned()]);
}

#[test]
fn remove_resource_unlinks_the_mirror() {
    let dir = TempDir::new().unwrap();
    let clock = FakeClock::from_system_time();
    let cache = mirror(&dir, CacheConfig::default(), &clock);

    cache.put_resource(&obj("b", "f")).unwrap();
    cache.remove_resource(&obj("b", "f")).unwrap();
    assert!(cache.get_entry(&obj("b", "f")).unwrap().is_none());

    // Removing a directory entry with children leaves the children; the
    // directory is still implied by them.
    cache.put_resource(&obj("b", "d/")).unwrap();
    cache.put_resource(&obj("b", "d/child")).unwrap();
    cache.remove_resource(&obj("b", "d/")).unwrap();
    assert!(cache.get_entry(&obj("b", "d/child")).unwrap().is_some());

    // Removing a bucket takes the whole subtree.
    cache
        .remove_resource(&ResourceId::Bucket("b".into()))
        .unwrap();
    assert!(cache.object_list("b").unwrap().is_empty());
}

#[test]
fn entries_expire_against_the_injected_clock() {
    let dir = TempDir::new().unwrap();
    let clock = FakeClock::from_system_time();
    let config = CacheConfig {
        max_entry_age_ms: 60_000,
        max_info_age_ms: 1_000,
    };
    let cache = mirror(&dir, config, &clock);

    cache.put_resource(&obj("b", "f")).unwrap();
    assert!(cache.get_entry(&obj("b", "f")).unwrap().is_some());

    clock.advance_millis(120_000);
    assert!(cache.get_entry(&obj("b", "f")).unwrap().is_none());
}

#[test]
fn sweep_removes_expired_mirrors_and_empty_buckets() {
    let dir = TempDir::new().unwrap();
    let clock = FakeClock::from_system_time();
    let config = CacheConfig {
        max_entry_age_ms: 60_000,
        max_info_age_ms: 1_000,
    };
    let cache = mirror(&dir, config, &clock);

    cache.put_resource(&obj("b", "d/f")).unwrap();
    clock.advance_millis(120_000);
    cache.sweep().unwrap();

    assert!(cache.object_list("b").unwrap().is_empty());
    assert!(cache.bucket_list().unwrap().is_empty());
    assert!(!dir.path().join("b").exists());
}

#[test]
fn sweep_keeps_fresh_entries() {
    let dir = TempDir::new().unwrap();
    let clock = FakeClock::from_system_time();
    let config = CacheConfig {
        max_entry_age_ms: 60_000,
        max_info_age_ms: 1_000,
    };
    let cache = mirror(&dir, config, &clock);

    cache.put_resource(&obj("b", "keep")).unwrap();
    cache.sweep().unwrap();

    assert_eq!(cache.object_list("b").unwrap().len(), 1);
}

#[test]
fn path_escapes_are_rejected() {
    let dir = TempDir::new().unwrap();
    let clock = FakeClock::from_system_time();
    let cache = mirror(&dir, CacheConfig::default(), &clock);

    let err = cache.put_resource(&obj("b", "../escape")).unwrap_err();
    assert!(matches!(err, CacheError::UnmirrorableName(_)), "got {err:?}");
}
