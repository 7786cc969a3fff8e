//! Integration tests for volumes on real files.
//!
//! Readers on other threads follow the published index while a single
//! owner writes, wraps and syncs.

use objcache_common::{CacheKey, VolumeConfig};
use objcache_storage::{FileSlots, Volume, VolumeMetadata};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tempfile::TempDir;

fn config() -> VolumeConfig {
    VolumeConfig {
        capacity: 256 * 1024,
        max_entries: 256,
        ..VolumeConfig::default()
    }
}

#[test]
fn test_volume_file_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.vol");
    let config = config();
    let geometry = VolumeMetadata::geometry(&config).unwrap();

    let id = {
        let slots = FileSlots::create(&path, geometry, config.direct_io).unwrap();
        let mut volume = Volume::open(slots, geometry, config.max_entries).unwrap();
        for n in 0..10u64 {
            volume
                .write(CacheKey::digest(format!("obj-{n}")), 0, 1000)
                .unwrap();
        }
        assert!(volume.sync().unwrap());
        volume.metadata().volume_id()
    };

    let slots = FileSlots::open(&path, geometry, config.direct_io).unwrap();
    let volume = Volume::open(slots, geometry, config.max_entries).unwrap();
    assert_eq!(volume.metadata().volume_id(), id);
    assert_eq!(volume.metadata().sync_serial(), 2);
    let snapshot = volume.snapshots().read().unwrap();
    assert_eq!(snapshot.len(), 10);
    assert!(snapshot.find(&CacheKey::digest("obj-3"), 999).is_some());
}

#[test]
fn test_wrap_evicts_oldest_data() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.vol");
    let config = config();
    let geometry = VolumeMetadata::geometry(&config).unwrap();
    let slots = FileSlots::create(&path, geometry, false).unwrap();
    let mut volume = Volume::open(slots, geometry, config.max_entries).unwrap();

    let chunk = geometry.data_capacity() / 4;
    for n in 0..4u8 {
        let a = volume.write(CacheKey::from_bytes([n; 16]), 0, chunk).unwrap();
        assert!(!a.wrapped);
    }
    // Fifth write wraps and lands on top of the first chunk
    let a = volume.write(CacheKey::from_bytes([4; 16]), 0, chunk).unwrap();
    assert!(a.wrapped);
    assert_eq!(a.offset, geometry.data_start());

    assert!(volume.lookup(&CacheKey::from_bytes([0; 16])).is_empty());
    // Starts exactly at the new cursor, so it counts as overwritten too
    assert!(volume.lookup(&CacheKey::from_bytes([1; 16])).is_empty());
    for n in 2..5u8 {
        assert_eq!(volume.lookup(&CacheKey::from_bytes([n; 16])).len(), 1, "key {n}");
    }
}

#[test]
fn test_readers_follow_published_snapshots() {
    let config = config();
    let geometry = VolumeMetadata::geometry(&config).unwrap();
    let slots = objcache_storage::MemorySlots::new(geometry.slot_size() as usize);
    let mut volume = Volume::open(slots, geometry, config.max_entries).unwrap();
    let cell = volume.snapshots();
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let mut last_serial = 0;
                while !done.load(Ordering::Acquire) {
                    let snapshot = cell.read().unwrap();
                    // Every entry of a snapshot is fully formed
                    for key in 0..8u8 {
                        for entry in snapshot.lookup(&CacheKey::from_bytes([key; 16])) {
                            assert_eq!(entry.key, CacheKey::from_bytes([key; 16]));
                            assert!(entry.span.length > 0);
                        }
                    }
                    assert!(snapshot.sync_serial() >= last_serial);
                    last_serial = snapshot.sync_serial();
                }
            });
        }

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let key = CacheKey::from_bytes([rng.gen_range(0..8u8); 16]);
            let offset = rng.gen_range(0..16u64) * 512;
            volume.write(key, offset, 512).unwrap();
            if rng.gen_bool(0.2) {
                volume.evict(&key);
            }
            volume.sync().unwrap();
        }
        done.store(true, Ordering::Release);
    });

    let final_snapshot = cell.read().unwrap();
    assert_eq!(final_snapshot.sync_serial(), volume.metadata().sync_serial());
}
