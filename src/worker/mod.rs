//! OS-native worker backend.
//!
//! The worker owns the platform notification stream and turns its
//! heterogeneous notifications into canonical per-channel events: it keeps
//! the recursive watch registry, pairs rename halves, classifies ambiguous
//! flag sets against a recent-file cache, and delegates subtrees the native
//! layer cannot cover to the polling backend. Notifications and hub wakeups
//! arrive on one internal channel, so the blocking wait has a single
//! suspension point.

pub mod recent_cache;
pub mod registry;
pub mod rename_buffer;
pub mod side_effect;

use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use notify::event::{CreateKind, EventKind, ModifyKind, RenameMode};
use notify::{Config, Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};

use crate::logline;
use crate::message::{CommandAction, CommandBuilder, CommandPayload, EntryKind, MessageBuffer};
use crate::thread::{handle_unknown_command, Backend, CommandOutcome, ThreadContext, ThreadHandle};

use recent_cache::RecentFileCache;
use registry::WatchRegistry;
use rename_buffer::{RenameBuffer, RenameHalf, RenameKey, RenameObservation, RenameSide};
use side_effect::SideEffect;

/// Upper bound on notifications drained per cycle, so command wakeups are
/// not starved by a storm of events.
const MAX_BATCH: usize = 1024;

/// How long the blocking wait is shortened while rename halves are buffered;
/// unpaired halves must age against wall time, not just traffic.
const RENAME_FLUSH_INTERVAL: Duration = Duration::from_millis(50);

enum SourceEvent {
    /// A command is waiting on the input queue.
    Wake,
    /// A raw notification from the platform layer.
    Notification(notify::Result<NotifyEvent>),
}

/// Build the handle for the worker thread.
pub fn worker_thread(hub_signal: Sender<()>) -> ThreadHandle {
    let (source_tx, source_rx) = mpsc::channel();
    let source = Arc::new(Mutex::new(source_rx));

    let waker_tx = source_tx.clone();
    let waker = Box::new(move || {
        let _ = waker_tx.send(SourceEvent::Wake);
    });

    let factory = Box::new(move || {
        let stream_tx = source_tx.clone();
        let watcher = RecommendedWatcher::new(
            move |notification: notify::Result<NotifyEvent>| {
                let _ = stream_tx.send(SourceEvent::Notification(notification));
            },
            Config::default(),
        )
        .context("unable to initialize the native notification backend")?;

        Ok(Box::new(WorkerBackend {
            watcher,
            source: Arc::clone(&source),
            registry: WatchRegistry::new(),
            cache: RecentFileCache::default(),
            renames: RenameBuffer::new(),
        }) as Box<dyn Backend>)
    });

    ThreadHandle::new("worker thread", hub_signal, waker, factory)
}

struct WorkerBackend {
    watcher: RecommendedWatcher,
    source: Arc<Mutex<Receiver<SourceEvent>>>,
    registry: WatchRegistry,
    cache: RecentFileCache,
    renames: RenameBuffer,
}

impl Backend for WorkerBackend {
    fn run(&mut self, ctx: &ThreadContext) -> Result<()> {
        while !ctx.is_stopping() {
            let Some(batch) = self.next_batch() else {
                // The handle and its waker are gone; nobody can reach this
                // thread any more.
                return Ok(());
            };

            let mut out = MessageBuffer::new();
            let mut side = SideEffect::new();
            let mut woken = false;

            for event in batch {
                match event {
                    SourceEvent::Wake => woken = true,
                    SourceEvent::Notification(Ok(event)) => {
                        self.translate(event, &mut out, &mut side)
                    }
                    SourceEvent::Notification(Err(error)) => {
                        self.handle_stream_error(error, &mut out)
                    }
                }
            }

            if !side.is_empty() {
                self.enact_side_effects(side, &mut out);
            }
            self.flush_renames(&mut out);
            self.cache.advance_generation();
            ctx.emit_all(out.take());

            if woken {
                let sweep = ctx.process_commands(self);
                if sweep.stop {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn handle_command(
        &mut self,
        _ctx: &ThreadContext,
        command: &CommandPayload,
        out: &mut MessageBuffer,
    ) -> Result<CommandOutcome> {
        match command.action() {
            CommandAction::Add => self.handle_add(command, out),
            CommandAction::Remove => self.handle_remove(command),
            _ => handle_unknown_command(command),
        }
    }
}

impl WorkerBackend {
    /// Block for the next notification cycle. `None` means the source
    /// channel is gone and the thread should wind down.
    fn next_batch(&mut self) -> Option<Vec<SourceEvent>> {
        let source = self.source.lock().unwrap();
        let mut batch = Vec::new();

        if self.renames.is_empty() {
            match source.recv() {
                Ok(event) => batch.push(event),
                Err(_) => return None,
            }
        } else {
            match source.recv_timeout(RENAME_FLUSH_INTERVAL) {
                Ok(event) => batch.push(event),
                Err(RecvTimeoutError::Timeout) => return Some(batch),
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }

        while batch.len() < MAX_BATCH {
            match source.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        Some(batch)
    }

    fn handle_add(&mut self, command: &CommandPayload, out: &mut MessageBuffer) -> Result<CommandOutcome> {
        let channel = command.channel();
        let Some(root) = command.root() else {
            anyhow::bail!("add command carries no root path");
        };
        let root = root.to_path_buf();
        let recursive = command.recursive();

        let outcome = self.registry.add(channel, &root, recursive)?;

        for dir in outcome.to_watch {
            if let Err(error) = self.watcher.watch(&dir, RecursiveMode::NonRecursive) {
                if dir == root {
                    // Without the root there is no watch to speak of.
                    self.registry.remove(channel);
                    return Err(error).with_context(|| format!("cannot watch {}", root.display()));
                }
                // A subdirectory the OS refuses is still reachable by
                // polling; hand it over and keep the rest of the tree.
                logline!(
                    "Delegating {} to polling after a watch failure: {}.",
                    dir.display(),
                    error
                );
                self.registry.forget_watch(channel, &dir);
                out.message(CommandBuilder::add(channel, dir, true).build());
            }
        }

        for poll_root in outcome.poll_roots {
            out.message(CommandBuilder::add(channel, poll_root, recursive).build());
        }

        logline!(
            "Channel {} now watches {} ({}).",
            channel,
            root.display(),
            if recursive { "recursive" } else { "flat" }
        );
        Ok(CommandOutcome::PreventStop)
    }

    fn handle_remove(&mut self, command: &CommandPayload) -> Result<CommandOutcome> {
        let removed = self.registry.remove(command.channel());
        for dir in removed.to_unwatch {
            // The directory may already be gone; nothing to do about it.
            let _ = self.watcher.unwatch(&dir);
        }

        if self.registry.is_empty() {
            logline!("Last channel removed; stopping the worker thread.");
            Ok(CommandOutcome::TriggerStop)
        } else {
            Ok(CommandOutcome::Ack)
        }
    }

    fn translate(&mut self, event: NotifyEvent, out: &mut MessageBuffer, side: &mut SideEffect) {
        if event.need_rescan() {
            // Notifications were dropped; anything could have happened. The
            // channels on this backend cannot be trusted any more.
            for channel in self.registry.channel_ids() {
                out.error(
                    channel,
                    "native notification queue overflowed; events were lost".to_string(),
                    true,
                );
            }
            return;
        }

        match event.kind {
            EventKind::Access(_) => {}
            EventKind::Create(create_kind) => {
                for path in &event.paths {
                    let kind = match create_kind {
                        CreateKind::File => EntryKind::File,
                        CreateKind::Folder => EntryKind::Directory,
                        _ => self.observed_kind(path),
                    };
                    self.entry_created(path, kind, out, side);
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.entry_deleted(path, out);
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => self.translate_rename(&event, mode, out, side),
            EventKind::Modify(_) => {
                for path in &event.paths {
                    self.entry_modified(path, out);
                }
            }
            EventKind::Any | EventKind::Other => {
                // No usable flags; classify by diffing remembered against
                // observed state.
                for path in &event.paths {
                    let remembered = self.cache.remembered(path).is_some();
                    match (remembered, path.symlink_metadata().is_ok()) {
                        (false, true) => {
                            let kind = self.observed_kind(path);
                            self.entry_created(path, kind, out, side);
                        }
                        (true, false) => self.entry_deleted(path, out),
                        (true, true) => self.entry_modified(path, out),
                        (false, false) => {}
                    }
                }
            }
        }
    }

    fn translate_rename(
        &mut self,
        event: &NotifyEvent,
        mode: RenameMode,
        out: &mut MessageBuffer,
        side: &mut SideEffect,
    ) {
        let tracker = event.attrs.tracker();
        match mode {
            RenameMode::Both if event.paths.len() >= 2 => {
                let from = event.paths[0].clone();
                let to = event.paths[1].clone();
                self.entry_renamed(&from, &to, out, side);
            }
            RenameMode::From => {
                for path in &event.paths {
                    self.observe_rename_half(RenameSide::Source, path, tracker, out, side);
                }
            }
            RenameMode::To => {
                for path in &event.paths {
                    self.observe_rename_half(RenameSide::Target, path, tracker, out, side);
                }
            }
            _ => {
                // Side unspecified: an entry present at the path is the
                // destination of its rename, an absent one the source.
                for path in &event.paths {
                    let side_guess = if path.symlink_metadata().is_ok() {
                        RenameSide::Target
                    } else {
                        RenameSide::Source
                    };
                    self.observe_rename_half(side_guess, path, tracker, out, side);
                }
            }
        }
    }

    fn observe_rename_half(
        &mut self,
        half_side: RenameSide,
        path: &Path,
        tracker: Option<usize>,
        out: &mut MessageBuffer,
        side: &mut SideEffect,
    ) {
        let (kind, inode) = match half_side {
            RenameSide::Source => {
                let remembered = self.cache.forget(path);
                (
                    remembered.as_ref().map_or(EntryKind::Unknown, |e| e.kind),
                    remembered.map(|e| e.inode),
                )
            }
            RenameSide::Target => {
                let recorded = self.cache.record(path);
                (
                    recorded.as_ref().map_or(EntryKind::Unknown, |e| e.kind),
                    recorded.map(|e| e.inode),
                )
            }
        };

        let key = match (tracker, inode) {
            (Some(cookie), _) => Some(RenameKey::Cookie(cookie)),
            (None, Some(inode)) if inode != 0 => Some(RenameKey::Inode(inode)),
            _ => None,
        };

        let Some(key) = key else {
            // Nothing ties this half to a partner; report it as the plain
            // action it implies.
            match half_side {
                RenameSide::Source => self.entry_deleted(path, out),
                RenameSide::Target => self.entry_created(path, kind, out, side),
            }
            return;
        };

        let half = RenameHalf {
            side: half_side,
            path: path.to_path_buf(),
            kind,
        };
        if let RenameObservation::Paired { old_path, path, kind } = self.renames.observe(key, half) {
            self.emit_renamed(&old_path, &path, kind, out, side);
        }
    }

    fn entry_created(&mut self, path: &Path, kind: EntryKind, out: &mut MessageBuffer, side: &mut SideEffect) {
        self.cache.record(path);
        for channel in self.registry.channels_for(path) {
            out.created(channel, path.to_path_buf(), kind);
        }
        if kind == EntryKind::Directory && self.registry.has_recursive_cover(path) {
            side.track_subdirectory(path.to_path_buf());
        }
    }

    fn entry_deleted(&mut self, path: &Path, out: &mut MessageBuffer) {
        let kind = self
            .cache
            .forget(path)
            .map_or(EntryKind::Unknown, |entry| entry.kind);
        for channel in self.registry.channels_for(path) {
            out.deleted(channel, path.to_path_buf(), kind);
        }
        if kind == EntryKind::Directory {
            self.registry.forget_subtree(path);
        }
    }

    fn entry_modified(&mut self, path: &Path, out: &mut MessageBuffer) {
        match self.cache.record(path) {
            Some(entry) => {
                for channel in self.registry.channels_for(path) {
                    out.modified(channel, path.to_path_buf(), entry.kind);
                }
            }
            // Already gone again; the removal notification says the rest.
            None => {}
        }
    }

    fn entry_renamed(&mut self, from: &Path, to: &Path, out: &mut MessageBuffer, side: &mut SideEffect) {
        self.cache.forget(from);
        let kind = self
            .cache
            .record(to)
            .map_or(EntryKind::Unknown, |entry| entry.kind);
        self.emit_renamed(from, to, kind, out, side);
    }

    /// Fan a paired rename out to the interested channels. Channels that see
    /// only one end of the move get the half they can observe.
    fn emit_renamed(
        &mut self,
        from: &Path,
        to: &Path,
        kind: EntryKind,
        out: &mut MessageBuffer,
        side: &mut SideEffect,
    ) {
        let from_channels = self.registry.channels_for(from);
        let to_channels = self.registry.channels_for(to);

        for &channel in &to_channels {
            if from_channels.contains(&channel) {
                out.renamed(channel, from.to_path_buf(), to.to_path_buf(), kind);
            } else {
                out.created(channel, to.to_path_buf(), kind);
            }
        }
        for &channel in &from_channels {
            if !to_channels.contains(&channel) {
                out.deleted(channel, from.to_path_buf(), kind);
            }
        }

        if kind == EntryKind::Directory {
            // Watches on the old subtree are stale, and the new location may
            // need coverage.
            let forgotten = self.registry.forget_subtree(from);
            for dir in forgotten {
                let _ = self.watcher.unwatch(&dir);
            }
            if self.registry.has_recursive_cover(to) {
                side.track_subdirectory(to.to_path_buf());
            }
        }
    }

    fn enact_side_effects(&mut self, side: SideEffect, out: &mut MessageBuffer) {
        let registrations = side.enact_in(&mut self.registry, out);
        for registration in registrations {
            if let Err(error) = self
                .watcher
                .watch(&registration.dir, RecursiveMode::NonRecursive)
            {
                logline!(
                    "Delegating {} to polling after a watch failure: {}.",
                    registration.dir.display(),
                    error
                );
                for &channel in &registration.channels {
                    self.registry.forget_watch(channel, &registration.dir);
                    out.message(
                        CommandBuilder::add(channel, registration.dir.clone(), true).build(),
                    );
                }
            }
        }
    }

    fn flush_renames(&mut self, out: &mut MessageBuffer) {
        for half in self.renames.flush_unmatched() {
            match half.side {
                RenameSide::Source => {
                    for channel in self.registry.channels_for(&half.path) {
                        out.deleted(channel, half.path.clone(), half.kind);
                    }
                }
                RenameSide::Target => {
                    for channel in self.registry.channels_for(&half.path) {
                        out.created(channel, half.path.clone(), half.kind);
                    }
                }
            }
        }
    }

    fn handle_stream_error(&mut self, error: notify::Error, out: &mut MessageBuffer) {
        if error.paths.is_empty() {
            // Retryable on the next cycle; nothing to attribute it to.
            logline!("Transient native backend error: {}.", error);
            return;
        }
        for path in &error.paths {
            for channel in self.registry.channels_for(path) {
                out.error(channel, format!("{} ({})", error, path.display()), false);
            }
        }
    }

    fn observed_kind(&self, path: &Path) -> EntryKind {
        match path.symlink_metadata() {
            Ok(metadata) => EntryKind::of_metadata(&metadata),
            Err(_) => EntryKind::Unknown,
        }
    }
}
