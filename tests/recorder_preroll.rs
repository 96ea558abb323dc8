//! End-to-end pre-roll: frames buffered in a FrameCache ring while stopped
//! commit to the main store, in order, once recording switches to fast.

use tempfile::tempdir;
use vtbus::filestore::{ext_for_type, EpochTime, FileStore};
use vtbus::framecache::{CacheConfig, FrameCache};

#[test]
fn stopped_ring_commits_in_order_on_fast() {
    let dir = tempdir().expect("tempdir");
    let store = FileStore::new(dir.path(), "cam0", 0);
    let mut cache = FrameCache::new(dir.path(), CacheConfig { capacity: 5 }).expect("cache");

    for i in 0..10u8 {
        let epoch = EpochTime { secs: 1_700_000_000 + i as i64, micros: 0 };
        let eventual = store.path_for(epoch, "jpg", true).expect("path");
        cache.store(&[i], &eventual, None).expect("store");
    }

    let stats = cache.commit(false).expect("commit");
    assert_eq!(stats.committed, 5);
    assert_eq!(stats.failed, 0);

    let mut entries: Vec<_> = walk_files(dir.path());
    entries.sort();
    assert_eq!(entries.len(), 5);

    let mut contents: Vec<u8> = entries.iter().map(|p| std::fs::read(p).unwrap()[0]).collect();
    contents.sort();
    assert_eq!(contents, vec![5, 6, 7, 8, 9]);
}

#[test]
fn ext_for_type_maps_known_and_unknown_types() {
    assert_eq!(ext_for_type("jpeg"), "jpg");
    assert_eq!(ext_for_type("png"), "png");
    assert_eq!(ext_for_type("pnm"), "ppm");
    assert_eq!(ext_for_type("raw"), "raw");
    assert_eq!(ext_for_type("whatever"), "raw");
}

fn walk_files(base: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    for entry in walkdir(base) {
        if entry.is_file() {
            out.push(entry);
        }
    }
    out
}

fn walkdir(base: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(base) else { return out };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walkdir(&path));
        } else {
            out.push(path);
        }
    }
    out
}
