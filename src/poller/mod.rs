//! Polling backend.
//!
//! The fallback for roots the native layer cannot cover and for channels
//! that request it outright. Each registered root keeps a snapshot of its
//! tree; scans run on a configurable interval, with a per-root throttle
//! bounding how often any one root is re-read. Changes finer than the scan
//! cadence are out of reach by design.

pub mod snapshot;

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::logline;
use crate::message::{
    ChannelId, CommandAction, CommandPayload, MessageBuffer, NULL_COMMAND_ID,
};
use crate::thread::{handle_unknown_command, Backend, CommandOutcome, ThreadContext, ThreadHandle};

use snapshot::TreeSnapshot;

const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_THROTTLE: Duration = Duration::from_millis(100);

/// Grace applied to the throttle check so timer jitter cannot double the
/// effective cadence.
const SCAN_SLACK: Duration = Duration::from_millis(5);

/// Build the handle for the polling thread.
pub fn polling_thread(hub_signal: Sender<()>) -> ThreadHandle {
    let (wake_tx, wake_rx) = mpsc::channel();
    let wake = Arc::new(Mutex::new(wake_rx));

    let waker = Box::new(move || {
        let _ = wake_tx.send(());
    });

    let factory = Box::new(move || {
        Ok(Box::new(PollingBackend {
            wake: Arc::clone(&wake),
            interval: DEFAULT_INTERVAL,
            throttle: DEFAULT_THROTTLE,
            roots: Vec::new(),
        }) as Box<dyn Backend>)
    });

    ThreadHandle::new("polling thread", hub_signal, waker, factory)
}

#[derive(Debug)]
struct PolledRoot {
    channel: ChannelId,
    root: PathBuf,
    recursive: bool,
    snapshot: TreeSnapshot,
    last_scan: Option<Instant>,
}

struct PollingBackend {
    wake: Arc<Mutex<Receiver<()>>>,
    interval: Duration,
    throttle: Duration,
    roots: Vec<PolledRoot>,
}

impl Backend for PollingBackend {
    fn run(&mut self, ctx: &ThreadContext) -> Result<()> {
        while !ctx.is_stopping() {
            let woken = {
                let wake = self.wake.lock().unwrap();
                match wake.recv_timeout(self.interval) {
                    Ok(()) => {
                        // Collapse a burst of wakeups into one sweep.
                        while wake.try_recv().is_ok() {}
                        true
                    }
                    Err(RecvTimeoutError::Timeout) => false,
                    Err(RecvTimeoutError::Disconnected) => return Ok(()),
                }
            };

            if woken {
                let sweep = ctx.process_commands(self);
                if sweep.stop {
                    return Ok(());
                }
            }

            let mut out = MessageBuffer::new();
            self.scan_roots(&mut out);
            ctx.emit_all(out.take());
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
            CommandAction::PollingInterval => {
                self.interval = Duration::from_millis(command.arg().max(1));
                logline!("Polling interval is now {:?}.", self.interval);
                Ok(CommandOutcome::Ack)
            }
            CommandAction::PollingThrottle => {
                self.throttle = Duration::from_millis(command.arg());
                logline!("Polling throttle is now {:?}.", self.throttle);
                Ok(CommandOutcome::Ack)
            }
            _ => handle_unknown_command(command),
        }
    }
}

impl PollingBackend {
    fn handle_add(&mut self, command: &CommandPayload, out: &mut MessageBuffer) -> Result<CommandOutcome> {
        let channel = command.channel();
        let Some(root) = command.root() else {
            anyhow::bail!("add command carries no root path");
        };
        let root = root.to_path_buf();

        // The first scan is the baseline; only changes against it become
        // events.
        match snapshot::scan(&root, command.recursive()) {
            Ok(baseline) => {
                logline!(
                    "Channel {} now polls {} ({} entries).",
                    channel,
                    root.display(),
                    baseline.len()
                );
                self.roots.push(PolledRoot {
                    channel,
                    root,
                    recursive: command.recursive(),
                    snapshot: baseline,
                    last_scan: Some(Instant::now()),
                });
                Ok(CommandOutcome::PreventStop)
            }
            Err(error) => {
                let reason = format!("cannot poll {}: {}", root.display(), error);
                if command.id() == NULL_COMMAND_ID {
                    // A delegated registration has no ack to fail; the error
                    // message is how the subscriber hears about it.
                    out.error(channel, reason, false);
                    Ok(CommandOutcome::Nothing)
                } else {
                    Err(anyhow::anyhow!(reason))
                }
            }
        }
    }

    fn handle_remove(&mut self, command: &CommandPayload) -> Result<CommandOutcome> {
        let channel = command.channel();
        self.roots.retain(|polled| polled.channel != channel);

        if self.roots.is_empty() {
            logline!("Last channel removed; stopping the polling thread.");
            Ok(CommandOutcome::TriggerStop)
        } else {
            Ok(CommandOutcome::Ack)
        }
    }

    fn scan_roots(&mut self, out: &mut MessageBuffer) {
        let now = Instant::now();
        for polled in &mut self.roots {
            let due = polled.last_scan.map_or(true, |last| {
                now.saturating_duration_since(last) + SCAN_SLACK >= self.throttle
            });
            if !due {
                continue;
            }
            polled.last_scan = Some(now);

            let next = match snapshot::scan(&polled.root, polled.recursive) {
                Ok(next) => next,
                Err(error) => {
                    // The tree is unreachable; everything previously seen is
                    // reported gone and the root keeps being polled in case
                    // it comes back.
                    logline!("Scan of {} failed: {}.", polled.root.display(), error);
                    TreeSnapshot::default()
                }
            };

            let diff = polled.snapshot.diff(&next);
            polled.snapshot = next;
            if diff.is_empty() {
                continue;
            }

            for (old_path, new_path, kind) in diff.renamed {
                out.renamed(polled.channel, old_path, new_path, kind);
            }
            for (path, kind) in diff.created {
                out.created(polled.channel, path, kind);
            }
            for (path, kind) in diff.deleted {
                out.deleted(polled.channel, path, kind);
            }
            for (path, kind) in diff.modified {
                out.modified(polled.channel, path, kind);
            }
        }
    }
}
