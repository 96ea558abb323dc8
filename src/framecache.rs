//! Bounded ring of recent frames held on disk under a scratch sub-tree,
//! ready for an atomic-by-rename "pre-roll" commit into the main store.
//!
//! Grounded on the teacher's `lifecycle::{LifecycleConfig, StorageLifecycleManager}`
//! shape (config struct + `Default`, manager holding root + config + state,
//! a `run_once`-style entry point returning a stats value) and on
//! `lifecycle::policy::should_compress`'s match-on-policy style, repurposed
//! from "should this sealed segment be compressed" to "has this ring slot
//! aged out".

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::Result;

const CACHE_SUBDIR: &str = ".cache";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Ring capacity, `K` in the data model. `0` disables caching entirely.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 0 }
    }
}

struct CacheEntry {
    /// `None` once the bytes already live at `eventual_path` (the
    /// `same_as_path` case, or after a successful `commit`).
    scratch_path: Option<PathBuf>,
    eventual_path: PathBuf,
}

#[derive(Debug, Default)]
pub struct CommitStats {
    pub committed: usize,
    pub failed: usize,
}

/// Single-owner ring (the recorder process); see the crate-level
/// shared-resource policy.
pub struct FrameCache {
    base: PathBuf,
    config: CacheConfig,
    ring: VecDeque<CacheEntry>,
    next_scratch_id: u64,
}

impl FrameCache {
    pub fn new(base: impl Into<PathBuf>, config: CacheConfig) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(base.join(CACHE_SUBDIR))?;
        Ok(Self { base, config, ring: VecDeque::new(), next_scratch_id: 0 })
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Adds a frame to the ring. If `same_as_path` names a file already
    /// written to the main store, the cache only records the reference;
    /// otherwise `bytes` is persisted under `<base>/.cache/` first. If the
    /// ring is already at capacity, the oldest entry is evicted and its
    /// scratch file (if any) unlinked.
    pub fn store(&mut self, bytes: &[u8], eventual_path: &Path, same_as_path: Option<&Path>) -> Result<()> {
        if self.config.capacity == 0 {
            return Ok(());
        }

        let scratch_path = match same_as_path {
            Some(_) => None,
            None => {
                let scratch = self.next_scratch_path(eventual_path);
                if let Some(parent) = scratch.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&scratch, bytes)?;
                Some(scratch)
            }
        };

        self.ring.push_back(CacheEntry { scratch_path, eventual_path: eventual_path.to_path_buf() });
        if self.ring.len() > self.config.capacity {
            if let Some(evicted) = self.ring.pop_front() {
                if let Some(scratch) = evicted.scratch_path {
                    let _ = std::fs::remove_file(scratch);
                }
            }
        }
        Ok(())
    }

    /// Renames every ring entry's scratch file to its eventual path in the
    /// main store, in ring order. A failed rename is logged and skipped —
    /// the rest of the ring still commits. When `keep_slow` is true,
    /// successfully committed entries stay in the ring (their scratch
    /// pointer cleared) so they remain eligible for further demotion;
    /// otherwise the ring is emptied regardless of per-entry outcome.
    pub fn commit(&mut self, keep_slow: bool) -> Result<CommitStats> {
        let mut stats = CommitStats::default();
        for entry in self.ring.iter_mut() {
            let Some(scratch) = entry.scratch_path.take() else {
                stats.committed += 1;
                continue;
            };
            if let Some(parent) = entry.eventual_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            match std::fs::rename(&scratch, &entry.eventual_path) {
                Ok(()) => stats.committed += 1,
                Err(err) => {
                    log::warn!(
                        "framecache: commit rename {} -> {} failed: {err}",
                        scratch.display(),
                        entry.eventual_path.display()
                    );
                    entry.scratch_path = Some(scratch);
                    stats.failed += 1;
                }
            }
        }
        if !keep_slow {
            self.ring.clear();
        }
        Ok(stats)
    }

    fn next_scratch_path(&mut self, eventual_path: &Path) -> PathBuf {
        let id = self.next_scratch_id;
        self.next_scratch_id += 1;
        let name = eventual_path.file_name().and_then(|n| n.to_str()).unwrap_or("frame");
        self.base.join(CACHE_SUBDIR).join(format!("{id:020}-{name}"))
    }
}

/// Startup sweep: scratch files left over from a crash are reclaimable by
/// simply deleting everything under `<base>/.cache/` before the cache is
/// used again.
pub fn sweep_startup(base: &Path) -> Result<usize> {
    let cache_dir = base.join(CACHE_SUBDIR);
    let mut removed = 0;
    let entries = match std::fs::read_dir(&cache_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_cache_never_persists_scratch() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cache = FrameCache::new(tmp.path(), CacheConfig { capacity: 0 }).unwrap();
        cache.store(b"hi", &tmp.path().join("out.jpg"), None).unwrap();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn eviction_unlinks_oldest_scratch_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cache = FrameCache::new(tmp.path(), CacheConfig { capacity: 2 }).unwrap();
        cache.store(b"a", &tmp.path().join("a.jpg"), None).unwrap();
        cache.store(b"b", &tmp.path().join("b.jpg"), None).unwrap();
        cache.store(b"c", &tmp.path().join("c.jpg"), None).unwrap();
        assert_eq!(cache.len(), 2);
        let leftover = std::fs::read_dir(tmp.path().join(CACHE_SUBDIR)).unwrap().count();
        assert_eq!(leftover, 2);
    }

    #[test]
    fn commit_moves_scratch_files_into_place() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cache = FrameCache::new(tmp.path(), CacheConfig { capacity: 4 }).unwrap();
        let eventual = tmp.path().join("2026/07/26/12").join("cam-120000.jpg");
        cache.store(b"hello", &eventual, None).unwrap();
        let stats = cache.commit(false).unwrap();
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.failed, 0);
        assert!(eventual.exists());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn keep_slow_retains_entries_after_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cache = FrameCache::new(tmp.path(), CacheConfig { capacity: 4 }).unwrap();
        cache.store(b"hello", &tmp.path().join("out.jpg"), None).unwrap();
        cache.commit(true).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn startup_sweep_clears_leftover_scratch_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(CACHE_SUBDIR)).unwrap();
        std::fs::write(tmp.path().join(CACHE_SUBDIR).join("00000000000000000000-leftover.jpg"), b"x").unwrap();
        let removed = sweep_startup(tmp.path()).unwrap();
        assert_eq!(removed, 1);
    }
}
