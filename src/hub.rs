//! The embedder-facing coordinator.
//!
//! The hub owns both backend threads, allocates command and channel ids,
//! routes commands to the backend each channel lives on, and fans events and
//! acks back to embedder callbacks. All callbacks run on the thread that
//! drives the hub; backends never touch them directly. Cross-thread wakeups
//! arrive on the hub's signal channel, the embedder-loop analog of an async
//! handle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::health::combine_errors;
use crate::logger;
use crate::logline;
use crate::message::{
    ChannelId, CommandAction, CommandBuilder, CommandId, Event, Message, NULL_CHANNEL_ID,
    NULL_COMMAND_ID,
};
use crate::poller::polling_thread;
use crate::status::Status;
use crate::thread::ThreadHandle;
use crate::worker::worker_thread;

/// Completion callback for one command.
///
/// `Ok(Some(id))` delivers the channel id a `watch` produced; `Ok(None)`
/// acknowledges a command with no channel to report.
pub type AckCallback = Box<dyn FnOnce(Result<Option<ChannelId>, String>) + Send + 'static>;

/// What a channel's event callback receives on each invocation.
#[derive(Debug)]
pub enum ChannelDelivery {
    /// One batch of events, in production order.
    Events(Vec<Event>),
    /// A channel-scoped failure. A fatal one is followed by an automatic
    /// unwatch.
    Error { message: String, fatal: bool },
}

pub type EventCallback = Box<dyn FnMut(ChannelDelivery) + Send + 'static>;

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// Use the polling backend instead of the native one.
    pub poll: bool,
    pub recursive: bool,
}

/// Options accepted by [`Hub::configure`].
#[derive(Debug, Clone, Default)]
pub struct ConfigureOptions {
    pub main_log_file: Option<PathBuf>,
    pub worker_log_file: Option<PathBuf>,
    pub polling_log_file: Option<PathBuf>,
    pub polling_interval: Option<u64>,
    pub polling_throttle: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Worker,
    Polling,
}

impl Target {
    fn name(self) -> &'static str {
        match self {
            Target::Worker => "worker thread",
            Target::Polling => "polling thread",
        }
    }
}

/// Reference-counted coordinator that fires one terminal callback after all
/// of its sub-callbacks have reported, combining their failures into a
/// single diagnostic.
pub struct AllCallback {
    state: Arc<Mutex<AllState>>,
}

struct AllState {
    done: Option<AckCallback>,
    remaining: usize,
    errors: Vec<String>,
}

impl AllCallback {
    pub fn new(done: AckCallback) -> AllCallback {
        AllCallback {
            state: Arc::new(Mutex::new(AllState {
                done: Some(done),
                remaining: 0,
                errors: Vec::new(),
            })),
        }
    }

    /// Create one sub-callback. Every sub-callback must be created before
    /// the first of them can complete, or the terminal callback fires early.
    pub fn callback(&self) -> AckCallback {
        self.state.lock().unwrap().remaining += 1;
        let state = Arc::clone(&self.state);
        Box::new(move |result| {
            let mut guard = state.lock().unwrap();
            if let Err(message) = result {
                guard.errors.push(message);
            }
            guard.remaining -= 1;
            if guard.remaining == 0 {
                if let Some(done) = guard.done.take() {
                    let errors = std::mem::take(&mut guard.errors);
                    drop(guard);
                    match combine_errors(&errors) {
                        None => done(Ok(None)),
                        Some(message) => done(Err(message)),
                    }
                }
            }
        })
    }

    /// Fire the terminal callback immediately when no sub-callbacks were
    /// issued at all.
    pub fn fire_if_empty(&self) {
        let mut guard = self.state.lock().unwrap();
        if guard.remaining == 0 {
            if let Some(done) = guard.done.take() {
                drop(guard);
                done(Ok(None));
            }
        }
    }
}

/// The channel registry and event router.
///
/// One hub per pipeline; instantiate it explicitly and drive
/// [`Hub::handle_events`] from the embedder's scheduler whenever the signal
/// channel fires, or use [`Hub::handle_events_timeout`] as a ready-made
/// loop body.
pub struct Hub {
    worker: ThreadHandle,
    polling: ThreadHandle,
    signal_rx: Receiver<()>,
    next_command_id: CommandId,
    next_channel_id: ChannelId,
    pending_callbacks: HashMap<CommandId, AckCallback>,
    channel_callbacks: HashMap<ChannelId, EventCallback>,
}

impl Default for Hub {
    fn default() -> Hub {
        Hub::new()
    }
}

impl Hub {
    pub fn new() -> Hub {
        let (signal_tx, signal_rx) = mpsc::channel();
        Hub {
            worker: worker_thread(signal_tx.clone()),
            polling: polling_thread(signal_tx),
            signal_rx,
            next_command_id: NULL_COMMAND_ID + 1,
            next_channel_id: NULL_CHANNEL_ID + 1,
            pending_callbacks: HashMap::new(),
            channel_callbacks: HashMap::new(),
        }
    }

    /// Apply logging and polling configuration. The callback fires once
    /// every affected thread has acknowledged.
    pub fn configure(&mut self, options: ConfigureOptions, callback: AckCallback) -> Result<()> {
        if let Some(path) = &options.main_log_file {
            logger::to_file(path)?;
        }

        let mut plan: Vec<(Target, CommandBuilder)> = Vec::new();
        if let Some(path) = options.worker_log_file {
            plan.push((Target::Worker, CommandBuilder::log_file(path)));
        }
        if let Some(path) = options.polling_log_file {
            plan.push((Target::Polling, CommandBuilder::log_file(path)));
        }
        if let Some(ms) = options.polling_interval {
            plan.push((Target::Polling, CommandBuilder::polling_interval(ms)));
        }
        if let Some(ms) = options.polling_throttle {
            plan.push((Target::Polling, CommandBuilder::polling_throttle(ms)));
        }

        let all = AllCallback::new(callback);
        // Issue every sub-callback before the first send; a command answered
        // offline completes synchronously and must not fire the terminal
        // callback while later sends are still pending.
        let plan: Vec<(Target, CommandBuilder, AckCallback)> = plan
            .into_iter()
            .map(|(target, builder)| (target, builder, all.callback()))
            .collect();

        let mut failures = Vec::new();
        for (target, builder, sub_callback) in plan {
            if let Err(error) = self.send_command(target, builder, sub_callback) {
                failures.push(format!("{:#}", error));
            }
        }
        all.fire_if_empty();

        match combine_errors(&failures) {
            None => Ok(()),
            Some(message) => Err(anyhow!(message)),
        }
    }

    /// Register a new channel watching `root`. The ack callback receives the
    /// channel id; the event callback receives every batch the channel
    /// produces until it is unwatched.
    pub fn watch(
        &mut self,
        root: impl Into<PathBuf>,
        options: WatchOptions,
        ack_callback: AckCallback,
        event_callback: EventCallback,
    ) -> Result<()> {
        let channel_id = self.next_channel_id;
        self.next_channel_id += 1;
        self.channel_callbacks.insert(channel_id, event_callback);

        let builder = CommandBuilder::add(channel_id, root.into(), options.recursive);
        let target = if options.poll {
            Target::Polling
        } else {
            Target::Worker
        };

        let result = self.send_command(target, builder, ack_callback);
        if result.is_err() {
            self.channel_callbacks.remove(&channel_id);
        }
        result
    }

    /// Tear a channel down. Removal goes to both backends, because a channel
    /// may have been split across them; the callback fires once after both
    /// have acknowledged. Unknown channels acknowledge cleanly.
    pub fn unwatch(&mut self, channel_id: ChannelId, ack_callback: AckCallback) -> Result<()> {
        let all = AllCallback::new(ack_callback);
        let worker_ack = all.callback();
        let polling_ack = all.callback();

        let mut failures = Vec::new();
        if let Err(error) =
            self.send_command(Target::Worker, CommandBuilder::remove(channel_id), worker_ack)
        {
            failures.push(format!("{:#}", error));
        }
        if let Err(error) =
            self.send_command(Target::Polling, CommandBuilder::remove(channel_id), polling_ack)
        {
            failures.push(format!("{:#}", error));
        }

        if self.channel_callbacks.remove(&channel_id).is_none() {
            logline!("Channel {} already has no event callback.", channel_id);
        }

        match combine_errors(&failures) {
            None => Ok(()),
            Some(message) => Err(anyhow!(message)),
        }
    }

    /// Drain both backends' output queues and dispatch everything found.
    pub fn handle_events(&mut self) {
        self.handle_events_from(Target::Worker);
        self.handle_events_from(Target::Polling);
    }

    /// Wait up to `timeout` for a cross-thread signal, then drain. Returns
    /// whether a signal arrived; a sweep happens either way, since a signal
    /// may have been consumed by an earlier synchronous drain.
    pub fn handle_events_timeout(&mut self, timeout: Duration) -> bool {
        let signalled = match self.signal_rx.recv_timeout(timeout) {
            Ok(()) => {
                while self.signal_rx.try_recv().is_ok() {}
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        };
        self.handle_events();
        signalled
    }

    /// Snapshot of queue depths, callback counts, and thread states.
    pub fn status(&self) -> Status {
        Status {
            pending_callback_count: self.pending_callbacks.len(),
            channel_callback_count: self.channel_callbacks.len(),
            worker: self.worker.collect_status(),
            polling: self.polling.collect_status(),
        }
    }

    fn thread(&self, target: Target) -> &ThreadHandle {
        match target {
            Target::Worker => &self.worker,
            Target::Polling => &self.polling,
        }
    }

    fn send_command(
        &mut self,
        target: Target,
        builder: CommandBuilder,
        callback: AckCallback,
    ) -> Result<()> {
        let command_id = self.next_command_id;
        self.next_command_id += 1;

        let message = builder.id(command_id).build();
        self.pending_callbacks.insert(command_id, callback);
        logline!("Sending command {} to the {}.", message, target.name());

        let send_result = self.thread(target).send(message);
        match send_result {
            Ok(true) => {
                // Answered without the thread running; the reply is already
                // on the output queue.
                self.handle_events();
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(error) => {
                // Complete the callback rather than leaking it.
                if let Some(callback) = self.pending_callbacks.remove(&command_id) {
                    callback(Err(format!("{:#}", error)));
                }
                Err(error)
            }
        }
    }

    fn handle_events_from(&mut self, target: Target) {
        loop {
            let Some(batch) = self.thread(target).receive_all() else {
                return;
            };

            let mut pending_events: HashMap<ChannelId, Vec<Event>> = HashMap::new();
            let mut errors: Vec<(ChannelId, String, bool)> = Vec::new();
            let mut to_unwatch: Vec<ChannelId> = Vec::new();

            for message in batch {
                match message {
                    Message::FileSystem(payload) => {
                        pending_events
                            .entry(payload.channel())
                            .or_default()
                            .push(payload.to_event());
                    }
                    Message::Ack(ack) => {
                        // Events this backend produced before the ack belong
                        // in front of it.
                        self.deliver_events(&mut pending_events);

                        logline!("Received ack message {}.", ack);
                        let Some(callback) = self.pending_callbacks.remove(&ack.key()) else {
                            logline!("Ignoring unexpected ack {}.", ack);
                            continue;
                        };

                        if ack.was_successful() {
                            if ack.channel() != NULL_CHANNEL_ID {
                                callback(Ok(Some(ack.channel())));
                            } else {
                                callback(Ok(None));
                            }
                        } else {
                            if ack.channel() != NULL_CHANNEL_ID {
                                // A failed registration leaves no channel
                                // behind.
                                self.channel_callbacks.remove(&ack.channel());
                            }
                            callback(Err(ack
                                .message()
                                .unwrap_or("unknown error")
                                .to_string()));
                        }
                    }
                    Message::Command(command) => match command.action() {
                        CommandAction::Drain => {
                            match self.thread(target).drain() {
                                // Redelivery put fresh messages on some
                                // queue; the enclosing loop picks them up.
                                Ok(_) => {}
                                Err(error) => logline!(
                                    "Unable to drain the dead letter office: {:#}.",
                                    error
                                ),
                            }
                        }
                        CommandAction::Add if target == Target::Worker => {
                            // Subtrees the native backend cannot cover are
                            // re-routed to polling.
                            logline!("Forwarding {} to the polling thread.", command);
                            if let Err(error) = self.polling.send(Message::Command(command)) {
                                logline!("Unable to forward to polling: {:#}.", error);
                            }
                        }
                        _ => logline!("Ignoring unexpected command {}.", command),
                    },
                    Message::Error(error) => {
                        logline!("Received error message {}.", error);
                        if error.was_fatal() {
                            to_unwatch.push(error.channel());
                        }
                        errors.push((
                            error.channel(),
                            error.message().to_string(),
                            error.was_fatal(),
                        ));
                    }
                }
            }

            self.deliver_events(&mut pending_events);

            for (channel, message, fatal) in errors {
                match self.channel_callbacks.get_mut(&channel) {
                    Some(callback) => callback(ChannelDelivery::Error { message, fatal }),
                    None => logline!("Error reported for unknown channel {}.", channel),
                }
            }

            for channel in to_unwatch {
                logline!("Unwatching channel {} after a fatal error.", channel);
                if let Err(error) = self.unwatch(channel, Box::new(|_| {})) {
                    logline!(
                        "Unable to unwatch fatally errored channel {}: {:#}.",
                        channel,
                        error
                    );
                }
            }
        }
    }

    fn deliver_events(&mut self, pending: &mut HashMap<ChannelId, Vec<Event>>) {
        if pending.is_empty() {
            return;
        }
        for (channel, events) in pending.drain() {
            match self.channel_callbacks.get_mut(&channel) {
                Some(callback) => {
                    logline!("Dispatching {} event(s) on channel {}.", events.len(), channel);
                    callback(ChannelDelivery::Events(events));
                }
                // The channel may have been unwatched while events were in
                // flight; they are dropped silently.
                None => logline!("Ignoring {} event(s) for unwatched channel {}.", events.len(), channel),
            }
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("pending_callbacks", &self.pending_callbacks.len())
            .field("channel_callbacks", &self.channel_callbacks.len())
            .field("worker", &self.worker)
            .field("polling", &self.polling)
            .finish()
    }
}
