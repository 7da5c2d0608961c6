//! Watch registry for the native backend.
//!
//! The OS layer watches single directories; recursion is this registry's
//! job. Each channel's recursive root is expanded into one registered
//! directory per subdirectory, and the registry answers the reverse
//! question during translation: which channels care about an event at a
//! given path. Subtrees the native layer cannot cover (symlinked or
//! unreadable) are reported back so the caller can delegate them to the
//! polling backend.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

use crate::logline;
use crate::message::ChannelId;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot watch {path}: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot watch {0}: not a directory")]
    NotADirectory(PathBuf),
}

/// One channel's interest in one registered directory.
#[derive(Debug, Clone)]
struct Watch {
    channel: ChannelId,
    root: PathBuf,
    recursive: bool,
}

/// Directories the caller must act on after a registry mutation.
#[derive(Debug, Default)]
pub struct AddOutcome {
    /// Directories that need a fresh OS watch.
    pub to_watch: Vec<PathBuf>,
    /// Subtrees to delegate to the polling backend.
    pub poll_roots: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct RemoveOutcome {
    /// Directories no channel cares about any more.
    pub to_unwatch: Vec<PathBuf>,
}

/// Result of covering a freshly discovered subdirectory.
#[derive(Debug, Default)]
pub struct SubdirectoryCover {
    /// Recursive channels whose trees contain the subdirectory.
    pub channels: Vec<ChannelId>,
    pub to_watch: Vec<PathBuf>,
    pub poll_roots: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct WatchRegistry {
    /// Registered directory -> channels interested in its direct entries.
    watchers: HashMap<PathBuf, Vec<Watch>>,
    /// Channel -> directories registered on its behalf.
    by_channel: HashMap<ChannelId, HashSet<PathBuf>>,
}

impl WatchRegistry {
    pub fn new() -> WatchRegistry {
        WatchRegistry::default()
    }

    /// Register a channel's root, expanding recursion into per-subdirectory
    /// watches.
    pub fn add(
        &mut self,
        channel: ChannelId,
        root: &Path,
        recursive: bool,
    ) -> Result<AddOutcome, RegistryError> {
        let metadata = fs::symlink_metadata(root).map_err(|source| RegistryError::RootUnreadable {
            path: root.to_path_buf(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(RegistryError::NotADirectory(root.to_path_buf()));
        }

        let mut outcome = AddOutcome::default();
        self.register(channel, root, root.to_path_buf(), recursive, &mut outcome.to_watch);

        if recursive {
            self.expand(channel, root, root, &mut outcome);
        }

        Ok(outcome)
    }

    /// Register every subdirectory of `dir` for a channel whose root
    /// contains it. Unreachable or symlinked subtrees land in `poll_roots`.
    fn expand(&mut self, channel: ChannelId, root: &Path, dir: &Path, outcome: &mut AddOutcome) {
        for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    if let Some(path) = error.path() {
                        logline!("Delegating unreadable subtree {} to polling.", path.display());
                        outcome.poll_roots.push(path.to_path_buf());
                    } else {
                        logline!("Unreadable entry under {}: {}.", dir.display(), error);
                    }
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                self.register(
                    channel,
                    root,
                    entry.path().to_path_buf(),
                    true,
                    &mut outcome.to_watch,
                );
            } else if file_type.is_symlink() {
                // A symlink that leads to a directory escapes the native
                // watch; the polling backend follows it instead.
                if fs::metadata(entry.path()).map(|m| m.is_dir()).unwrap_or(false) {
                    outcome.poll_roots.push(entry.path().to_path_buf());
                }
            }
        }
    }

    fn register(
        &mut self,
        channel: ChannelId,
        root: &Path,
        dir: PathBuf,
        recursive: bool,
        to_watch: &mut Vec<PathBuf>,
    ) {
        let watches = self.watchers.entry(dir.clone()).or_default();
        let already_watched = !watches.is_empty();
        let duplicate = watches
            .iter()
            .any(|watch| watch.channel == channel && watch.root == root);
        if !duplicate {
            watches.push(Watch {
                channel,
                root: root.to_path_buf(),
                recursive,
            });
        }
        self.by_channel.entry(channel).or_default().insert(dir.clone());
        if !already_watched {
            to_watch.push(dir);
        }
    }

    /// Drop everything registered for a channel.
    pub fn remove(&mut self, channel: ChannelId) -> RemoveOutcome {
        let mut outcome = RemoveOutcome::default();
        let Some(dirs) = self.by_channel.remove(&channel) else {
            return outcome;
        };

        for dir in dirs {
            if let Some(watches) = self.watchers.get_mut(&dir) {
                watches.retain(|watch| watch.channel != channel);
                if watches.is_empty() {
                    self.watchers.remove(&dir);
                    outcome.to_unwatch.push(dir);
                }
            }
        }
        outcome.to_unwatch.sort();
        outcome
    }

    /// Back out one directory registration, after the OS refused the watch.
    pub fn forget_watch(&mut self, channel: ChannelId, dir: &Path) {
        if let Some(watches) = self.watchers.get_mut(dir) {
            watches.retain(|watch| watch.channel != channel);
            if watches.is_empty() {
                self.watchers.remove(dir);
            }
        }
        if let Some(dirs) = self.by_channel.get_mut(&channel) {
            dirs.remove(dir);
            if dirs.is_empty() {
                self.by_channel.remove(&channel);
            }
        }
    }

    /// Drop bookkeeping for a directory that disappeared, and for everything
    /// beneath it. The OS forgets its own watches when a directory goes; the
    /// registry has to follow suit. Returns the forgotten directories.
    pub fn forget_subtree(&mut self, prefix: &Path) -> Vec<PathBuf> {
        let forgotten: Vec<PathBuf> = self
            .watchers
            .keys()
            .filter(|dir| dir.as_path() == prefix || dir.starts_with(prefix))
            .cloned()
            .collect();
        for dir in &forgotten {
            if let Some(watches) = self.watchers.remove(dir) {
                for watch in watches {
                    if let Some(dirs) = self.by_channel.get_mut(&watch.channel) {
                        dirs.remove(dir);
                        if dirs.is_empty() {
                            self.by_channel.remove(&watch.channel);
                        }
                    }
                }
            }
        }
        forgotten
    }

    /// Register a newly created subdirectory for every recursive channel
    /// whose tree contains it.
    pub fn cover_subdirectory(&mut self, dir: &Path) -> SubdirectoryCover {
        let mut cover = SubdirectoryCover::default();

        let covering: Vec<(ChannelId, PathBuf)> = {
            let mut seen = HashSet::new();
            let mut covering = Vec::new();
            for watches in self.watchers.values() {
                for watch in watches {
                    if watch.recursive && dir.starts_with(&watch.root) && seen.insert(watch.channel)
                    {
                        covering.push((watch.channel, watch.root.clone()));
                    }
                }
            }
            covering
        };

        for (channel, root) in covering {
            let mut outcome = AddOutcome::default();
            self.register(channel, &root, dir.to_path_buf(), true, &mut outcome.to_watch);
            // Entries may already exist inside a directory by the time its
            // creation is observed; sweep it like a root.
            self.expand(channel, &root, dir, &mut outcome);
            cover.to_watch.extend(outcome.to_watch);
            cover.poll_roots.extend(outcome.poll_roots);
            cover.channels.push(channel);
        }

        cover.to_watch.sort();
        cover.to_watch.dedup();
        cover
    }

    /// Channels that should hear about an event at `path`: those watching
    /// its parent directory, plus those watching the path itself when the
    /// event concerns a registered directory.
    pub fn channels_for(&self, path: &Path) -> Vec<ChannelId> {
        let mut channels = Vec::new();
        if let Some(parent) = path.parent() {
            if let Some(watches) = self.watchers.get(parent) {
                channels.extend(watches.iter().map(|watch| watch.channel));
            }
        }
        if let Some(watches) = self.watchers.get(path) {
            for watch in watches {
                if !channels.contains(&watch.channel) {
                    channels.push(watch.channel);
                }
            }
        }
        channels
    }

    /// Whether any recursive channel's tree contains `dir`.
    pub fn has_recursive_cover(&self, dir: &Path) -> bool {
        self.watchers.values().flatten().any(|watch| watch.recursive && dir.starts_with(&watch.root))
    }

    pub fn is_empty(&self) -> bool {
        self.by_channel.is_empty()
    }

    pub fn watched_directory_count(&self) -> usize {
        self.watchers.len()
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.by_channel.keys().copied().collect()
    }
}
