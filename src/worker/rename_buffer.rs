//! Pairs the two halves of a rename across notification batches.
//!
//! Linux-style streams tag both halves with a shared cookie inside one
//! batch; FSEvents-style streams deliver the halves in adjacent batches and
//! only the inode ties them together. Halves are buffered under whichever
//! key is available and survive exactly two flush cycles; a shorter window
//! turns real renames into spurious create/delete pairs.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::message::EntryKind;

/// Identity that links the two halves of one rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenameKey {
    /// Cookie/tracker id shared by both notifications.
    Cookie(usize),
    /// Inode of the entry, when the stream carries no cookie.
    Inode(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameSide {
    /// The entry vanished from this path.
    Source,
    /// The entry appeared at this path.
    Target,
}

/// One observed half of a rename.
#[derive(Debug, Clone)]
pub struct RenameHalf {
    pub side: RenameSide,
    pub path: PathBuf,
    pub kind: EntryKind,
}

#[derive(Debug)]
struct BufferedHalf {
    half: RenameHalf,
    age: u8,
}

/// What observing a half produced.
#[derive(Debug)]
pub enum RenameObservation {
    /// Both halves are known; emit one rename.
    Paired {
        old_path: PathBuf,
        path: PathBuf,
        kind: EntryKind,
    },
    /// Waiting for the other half.
    Buffered,
}

#[derive(Debug, Default)]
pub struct RenameBuffer {
    observed: HashMap<RenameKey, BufferedHalf>,
}

impl RenameBuffer {
    pub fn new() -> RenameBuffer {
        RenameBuffer::default()
    }

    /// Observe one half of a rename.
    pub fn observe(&mut self, key: RenameKey, half: RenameHalf) -> RenameObservation {
        match self.observed.remove(&key) {
            Some(buffered) if buffered.half.side != half.side => {
                let (source, target) = match half.side {
                    RenameSide::Target => (buffered.half, half),
                    RenameSide::Source => (half, buffered.half),
                };
                RenameObservation::Paired {
                    old_path: source.path,
                    path: target.path.clone(),
                    // The target half saw the entry as it now exists.
                    kind: target.kind,
                }
            }
            Some(_stale) => {
                // Same side twice under one key: the older observation lost
                // its partner; keep the newer one.
                self.observed.insert(key, BufferedHalf { half, age: 0 });
                RenameObservation::Buffered
            }
            None => {
                self.observed.insert(key, BufferedHalf { half, age: 0 });
                RenameObservation::Buffered
            }
        }
    }

    /// Age every buffered half and return the ones that stayed unpaired for
    /// two consecutive flushes. Sources become deletions, targets creations.
    pub fn flush_unmatched(&mut self) -> Vec<RenameHalf> {
        let mut expired = Vec::new();
        self.observed.retain(|_, buffered| {
            buffered.age += 1;
            if buffered.age >= 2 {
                expired.push(buffered.half.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.observed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }
}
