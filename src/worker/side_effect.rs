//! Deferred registration actions discovered while translating a batch of
//! native notifications.
//!
//! Registering watches mid-translation would mutate the registry under the
//! iteration that is consulting it, so subdirectory discoveries accumulate
//! here and are enacted once the batch is done.

use std::path::PathBuf;

use crate::message::{ChannelId, CommandBuilder, MessageBuffer};

use super::registry::WatchRegistry;

/// A directory to register, with the recursive channels interested in it.
#[derive(Debug)]
pub struct Registration {
    pub dir: PathBuf,
    pub channels: Vec<ChannelId>,
}

#[derive(Debug, Default)]
pub struct SideEffect {
    subdirectories: Vec<PathBuf>,
}

impl SideEffect {
    pub fn new() -> SideEffect {
        SideEffect::default()
    }

    /// Recursively watch a newly created subdirectory.
    pub fn track_subdirectory(&mut self, subdir: PathBuf) {
        self.subdirectories.push(subdir);
    }

    pub fn is_empty(&self) -> bool {
        self.subdirectories.is_empty()
    }

    /// Perform all enqueued registrations against the registry.
    ///
    /// Subtrees the registry cannot cover natively are pushed into `out` as
    /// polling `add` commands for the hub to forward. Returns the
    /// directories that still need an OS watch, so the caller can apply
    /// them and delegate any that the OS refuses.
    pub fn enact_in(self, registry: &mut WatchRegistry, out: &mut MessageBuffer) -> Vec<Registration> {
        let mut registrations = Vec::new();

        for subdir in self.subdirectories {
            let cover = registry.cover_subdirectory(&subdir);
            if cover.channels.is_empty() {
                continue;
            }

            for poll_root in &cover.poll_roots {
                for &channel in &cover.channels {
                    out.message(CommandBuilder::add(channel, poll_root.clone(), true).build());
                }
            }

            for dir in cover.to_watch {
                registrations.push(Registration {
                    dir,
                    channels: cover.channels.clone(),
                });
            }
        }

        registrations
    }
}
