//! Directory-tree snapshots and their diffs.
//!
//! The polling backend keeps one snapshot per registered root and compares
//! consecutive scans. Entries live in a sorted map so diffs come out in a
//! deterministic order regardless of directory iteration order.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::message::EntryKind;

/// Stat fingerprint of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub inode: u64,
}

impl EntryRecord {
    fn of(metadata: &fs::Metadata) -> EntryRecord {
        EntryRecord {
            kind: EntryKind::of_metadata(metadata),
            size: metadata.len(),
            modified: metadata.modified().ok(),
            inode: inode_of(metadata),
        }
    }
}

/// One scan's view of a root.
#[derive(Debug, Clone, Default)]
pub struct TreeSnapshot {
    entries: BTreeMap<PathBuf, EntryRecord>,
}

/// Changes between two snapshots, in deterministic path order.
#[derive(Debug, Default)]
pub struct SnapshotDiff {
    pub created: Vec<(PathBuf, EntryKind)>,
    pub deleted: Vec<(PathBuf, EntryKind)>,
    pub modified: Vec<(PathBuf, EntryKind)>,
    /// (old path, new path, kind), matched by inode within one scan.
    pub renamed: Vec<(PathBuf, PathBuf, EntryKind)>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.deleted.is_empty()
            && self.modified.is_empty()
            && self.renamed.is_empty()
    }
}

/// Scan a root. A directory root records its entries, recursively when asked;
/// a file root records just the file, so single files can be polled.
pub fn scan(root: &Path, recursive: bool) -> io::Result<TreeSnapshot> {
    let mut snapshot = TreeSnapshot::default();

    let root_metadata = fs::symlink_metadata(root)?;
    snapshot
        .entries
        .insert(root.to_path_buf(), EntryRecord::of(&root_metadata));

    if !root_metadata.is_dir() {
        return Ok(snapshot);
    }

    if recursive {
        for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
            // Entries that vanish or deny access mid-scan show up next time.
            let Ok(entry) = entry else { continue };
            if let Ok(metadata) = fs::symlink_metadata(entry.path()) {
                snapshot
                    .entries
                    .insert(entry.path().to_path_buf(), EntryRecord::of(&metadata));
            }
        }
    } else {
        for entry in fs::read_dir(root)? {
            let Ok(entry) = entry else { continue };
            if let Ok(metadata) = fs::symlink_metadata(entry.path()) {
                snapshot.entries.insert(entry.path(), EntryRecord::of(&metadata));
            }
        }
    }

    Ok(snapshot)
}

impl TreeSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Diff this snapshot against its successor.
    pub fn diff(&self, next: &TreeSnapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();
        let mut appeared: Vec<(PathBuf, EntryRecord)> = Vec::new();
        let mut vanished: Vec<(PathBuf, EntryRecord)> = Vec::new();

        for (path, record) in &self.entries {
            match next.entries.get(path) {
                None => vanished.push((path.clone(), record.clone())),
                Some(current) if current.kind != record.kind => {
                    // The path was reused by a different kind of entry.
                    vanished.push((path.clone(), record.clone()));
                    appeared.push((path.clone(), current.clone()));
                }
                Some(current) => {
                    // Directory stamps track child churn, which is reported
                    // through the children themselves.
                    let content_changed =
                        current.size != record.size || current.modified != record.modified;
                    if record.kind != EntryKind::Directory && content_changed {
                        diff.modified.push((path.clone(), current.kind));
                    }
                }
            }
        }

        for (path, record) in &next.entries {
            if !self.entries.contains_key(path) {
                appeared.push((path.clone(), record.clone()));
            }
        }

        // An entry that left one path and surfaced at another in the same
        // scan moved; the inode is the witness.
        let mut unmatched_vanished = Vec::new();
        for (old_path, old_record) in vanished {
            let matched = if old_record.inode != 0 {
                appeared.iter().position(|(_, record)| {
                    record.inode == old_record.inode && record.kind == old_record.kind
                })
            } else {
                None
            };
            match matched {
                Some(index) => {
                    let (new_path, record) = appeared.remove(index);
                    diff.renamed.push((old_path, new_path, record.kind));
                }
                _ => unmatched_vanished.push((old_path, old_record)),
            }
        }

        diff.created = appeared
            .into_iter()
            .map(|(path, record)| (path, record.kind))
            .collect();
        diff.deleted = unmatched_vanished
            .into_iter()
            .map(|(path, record)| (path, record.kind))
            .collect();
        diff
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
