//! Last-known state of recently seen filesystem entries.
//!
//! Native notification streams can merge several actions into one flag set,
//! and the entry may be gone by the time it is examined. The cache remembers
//! enough of each entry's stat to classify those ambiguous notifications by
//! diffing remembered against observed state, and to recover the kind and
//! inode of an entry that no longer exists.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::message::EntryKind;

const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub kind: EntryKind,
    pub inode: u64,
    pub size: u64,
    pub modified: Option<SystemTime>,
    generation: u64,
}

#[derive(Debug)]
pub struct RecentFileCache {
    entries: HashMap<PathBuf, CacheEntry>,
    generation: u64,
    capacity: usize,
}

impl Default for RecentFileCache {
    fn default() -> RecentFileCache {
        RecentFileCache::with_capacity(DEFAULT_CAPACITY)
    }
}

impl RecentFileCache {
    pub fn with_capacity(capacity: usize) -> RecentFileCache {
        RecentFileCache {
            entries: HashMap::new(),
            generation: 0,
            capacity,
        }
    }

    /// What the cache remembers about `path`, without touching the disk.
    pub fn remembered(&self, path: &Path) -> Option<&CacheEntry> {
        self.entries.get(path)
    }

    /// Stat `path` and remember the result. Returns the fresh entry, or
    /// `None` when the path no longer exists, in which case any stale record
    /// is dropped.
    pub fn record(&mut self, path: &Path) -> Option<CacheEntry> {
        match fs::symlink_metadata(path) {
            Ok(metadata) => {
                let entry = CacheEntry {
                    kind: EntryKind::of_metadata(&metadata),
                    inode: inode_of(&metadata),
                    size: metadata.len(),
                    modified: metadata.modified().ok(),
                    generation: self.generation,
                };
                self.entries.insert(path.to_path_buf(), entry.clone());
                Some(entry)
            }
            Err(_) => {
                self.entries.remove(path);
                None
            }
        }
    }

    /// Drop and return the record for a path that went away.
    pub fn forget(&mut self, path: &Path) -> Option<CacheEntry> {
        self.entries.remove(path)
    }

    /// Close out one notification batch. Entries untouched for a few
    /// generations are evicted once the cache outgrows its capacity.
    pub fn advance_generation(&mut self) {
        self.generation += 1;
        if self.entries.len() > self.capacity {
            let cutoff = self.generation.saturating_sub(2);
            self.entries.retain(|_, entry| entry.generation >= cutoff);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(unix)]
fn inode_of(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode_of(_metadata: &fs::Metadata) -> u64 {
    0
}
