//! Backend thread lifecycle: state machine, command dispatch, and
//! dead-letter handling.
//!
//! A backend thread owns two queues. Commands arrive on the input queue and
//! are dispatched in batches; acks, events, and errors leave on the output
//! queue, each flush followed by a wakeup signal to the hub. The state
//! machine is `Stopped -> Starting -> Running -> Stopping -> Stopped`,
//! monotone within a run, with transitions performed by compare-exchange.
//!
//! Messages that race a stop are captured into the dead letter office and
//! re-sent on the next contact with the thread, so a registered command is
//! acknowledged exactly once even across a stop/send race.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, Result};

use crate::health::Health;
use crate::logger;
use crate::logline;
use crate::message::{
    CommandAction, CommandBuilder, CommandPayload, Message, MessageBuffer, NULL_COMMAND_ID,
};
use crate::queue::Queue;
use crate::status::ThreadStatus;

/// Lifecycle state of a backend thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ThreadState {
    fn from_u8(raw: u8) -> ThreadState {
        match raw {
            1 => ThreadState::Starting,
            2 => ThreadState::Running,
            3 => ThreadState::Stopping,
            _ => ThreadState::Stopped,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ThreadState::Stopped => "stopped",
            ThreadState::Starting => "starting",
            ThreadState::Running => "running",
            ThreadState::Stopping => "stopping",
        }
    }
}

/// What a command handler wants done after it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Acknowledge the command.
    Ack,
    /// The handler produced its own reply; do not ack.
    Nothing,
    /// Acknowledge, then stop the thread once the sweep completes.
    TriggerStop,
    /// Acknowledge and cancel a stop requested earlier in the same sweep.
    PreventStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OfflineOutcome {
    /// Apply immediately and ack without starting the thread.
    Ack,
    /// Enqueue the command and start the thread.
    TriggerRun,
}

/// Result of one command sweep.
#[derive(Debug, Clone, Copy)]
pub struct CommandSweep {
    pub handled: usize,
    pub stop: bool,
}

/// Configuration captured while a thread is stopped, replayed as messages at
/// the head of every run. Thread-local log sinks die with their thread, so
/// the replay is what makes log redirection survive a restart.
#[derive(Debug, Default)]
struct Starter {
    logging: Option<Message>,
    polling_interval: Option<Message>,
    polling_throttle: Option<Message>,
}

impl Starter {
    fn set(&mut self, command: &CommandPayload) {
        let replay = Message::Command(command.for_replay());
        match command.action() {
            CommandAction::LogFile
            | CommandAction::LogStdout
            | CommandAction::LogStderr
            | CommandAction::LogDisable => self.logging = Some(replay),
            CommandAction::PollingInterval => self.polling_interval = Some(replay),
            CommandAction::PollingThrottle => self.polling_throttle = Some(replay),
            _ => {}
        }
    }

    fn messages(&self) -> Vec<Message> {
        [&self.logging, &self.polling_interval, &self.polling_throttle]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// State shared between a thread handle and the thread body.
#[derive(Debug)]
struct ThreadShared {
    name: String,
    state: AtomicU8,
    health: Health,
    input: Queue,
    output: Queue,
    hub_signal: Sender<()>,
    starter: Mutex<Starter>,
    dead_letters: Mutex<Option<Vec<Message>>>,
}

impl ThreadShared {
    fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn mark_stopping(&self) {
        if !self.transition(ThreadState::Running, ThreadState::Stopping) {
            logline!("Unexpected stop request while {}.", self.state().name());
        }
    }

    fn mark_stopped(&self) {
        // Error paths may stop straight out of Running.
        let _ = self.transition(ThreadState::Running, ThreadState::Stopping);
        if !self.transition(ThreadState::Stopping, ThreadState::Stopped) {
            self.state.store(ThreadState::Stopped as u8, Ordering::SeqCst);
        }
    }

    fn signal_hub(&self) {
        // The hub may already be gone during teardown.
        let _ = self.hub_signal.send(());
    }

    fn classify_offline(&self, command: &CommandPayload) -> OfflineOutcome {
        match command.action() {
            CommandAction::Add => OfflineOutcome::TriggerRun,
            CommandAction::LogFile
            | CommandAction::LogStdout
            | CommandAction::LogStderr
            | CommandAction::LogDisable
            | CommandAction::PollingInterval
            | CommandAction::PollingThrottle => {
                self.starter.lock().unwrap().set(command);
                OfflineOutcome::Ack
            }
            // Nothing to remove or drain on a stopped thread.
            CommandAction::Remove | CommandAction::Drain => OfflineOutcome::Ack,
        }
    }

    fn stash_dead_letters(&self, messages: Vec<Message>) {
        let mut office = self.dead_letters.lock().unwrap();
        match office.as_mut() {
            Some(existing) => existing.extend(messages),
            None => *office = Some(messages),
        }
    }

    fn take_dead_letters(&self) -> Option<Vec<Message>> {
        self.dead_letters.lock().unwrap().take()
    }
}

/// The thread-side face of the machinery, handed to a [`Backend`].
#[derive(Debug)]
pub struct ThreadContext {
    shared: Arc<ThreadShared>,
}

impl ThreadContext {
    pub fn is_stopping(&self) -> bool {
        self.shared.state() == ThreadState::Stopping
    }

    /// Push one message onto the output queue and wake the hub.
    pub fn emit(&self, message: Message) {
        self.shared.output.enqueue(message);
        self.shared.signal_hub();
    }

    /// Push a batch onto the output queue and wake the hub once.
    pub fn emit_all(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        self.shared.output.enqueue_all(messages);
        self.shared.signal_hub();
    }

    /// Dispatch every command currently in the input queue.
    ///
    /// Logging commands are applied here; everything else goes to the
    /// backend. Acks are flushed as one batch. When a handler triggers a
    /// stop, messages that arrived since the batch was accepted move to the
    /// dead letter office and a `drain` command is emitted so the hub will
    /// re-send them on next contact.
    pub fn process_commands<B>(&self, backend: &mut B) -> CommandSweep
    where
        B: Backend + ?Sized,
    {
        let Some(accepted) = self.shared.input.accept_all() else {
            return CommandSweep {
                handled: 0,
                stop: false,
            };
        };

        let mut out = MessageBuffer::new();
        let mut should_stop = false;

        for message in &accepted {
            let Some(command) = message.as_command() else {
                logline!("Received unexpected non-command message {}.", message);
                continue;
            };

            let result = match command.action() {
                CommandAction::LogFile
                | CommandAction::LogStdout
                | CommandAction::LogStderr
                | CommandAction::LogDisable => self.handle_log_command(command),
                action => {
                    // Polling cadence persists across restarts like logging does.
                    if matches!(
                        action,
                        CommandAction::PollingInterval | CommandAction::PollingThrottle
                    ) {
                        self.shared.starter.lock().unwrap().set(command);
                    }
                    backend.handle_command(self, command, &mut out)
                }
            };

            match result {
                Err(error) => {
                    if command.id() != NULL_COMMAND_ID {
                        out.ack(command, Err(format!("{:#}", error)));
                    } else {
                        logline!("Command {} failed: {:#}.", command, error);
                    }
                }
                Ok(outcome) => {
                    if outcome == CommandOutcome::TriggerStop {
                        should_stop = true;
                    }
                    if outcome == CommandOutcome::PreventStop {
                        should_stop = false;
                    }
                    if outcome != CommandOutcome::Nothing && command.id() != NULL_COMMAND_ID {
                        out.ack(command, Ok(()));
                    }
                }
            }
        }

        if should_stop {
            self.shared.mark_stopping();

            // Anything enqueued since this batch was accepted would be lost
            // with the thread; preserve it for redelivery.
            if let Some(dead) = self.shared.input.accept_all() {
                logline!(
                    "{} message(s) are now waiting in the dead letter office.",
                    dead.len()
                );
                self.shared.stash_dead_letters(dead);
                out.message(CommandBuilder::drain().build());
            }
        }

        self.emit_all(out.take());

        CommandSweep {
            handled: accepted.len(),
            stop: should_stop,
        }
    }

    fn handle_log_command(&self, command: &CommandPayload) -> Result<CommandOutcome> {
        match command.action() {
            CommandAction::LogFile => {
                let Some(path) = command.root() else {
                    bail!("log_file command carries no path");
                };
                logger::to_file(path)?;
            }
            CommandAction::LogStdout => logger::to_stdout(),
            CommandAction::LogStderr => logger::to_stderr(),
            CommandAction::LogDisable => logger::disable(),
            action => bail!("{} is not a logging command", action),
        }
        self.shared.starter.lock().unwrap().set(command);
        Ok(CommandOutcome::Ack)
    }
}

/// A backend body run by a [`ThreadHandle`].
pub trait Backend: Send {
    /// The blocking event loop. Must call [`ThreadContext::process_commands`]
    /// whenever woken and return once a sweep reports `stop`, or with an
    /// error on an unrecoverable failure.
    fn run(&mut self, ctx: &ThreadContext) -> Result<()>;

    /// Handle one backend-specific command. Messages pushed into `out` are
    /// flushed together with the sweep's acks.
    fn handle_command(
        &mut self,
        ctx: &ThreadContext,
        command: &CommandPayload,
        out: &mut MessageBuffer,
    ) -> Result<CommandOutcome>;
}

/// Log-and-ack fallback for actions a backend does not implement.
pub fn handle_unknown_command(command: &CommandPayload) -> Result<CommandOutcome> {
    logline!("Received command with unexpected action {}.", command);
    Ok(CommandOutcome::Ack)
}

/// Builds a fresh backend for each run of a thread; a stopped thread
/// restarts with new backend state but the same handle.
pub type BackendFactory = Box<dyn Fn() -> Result<Box<dyn Backend>> + Send + Sync>;

/// Embedder-side handle to one backend thread.
///
/// The handle outlives any individual run: a stopped thread restarts when a
/// command that needs it arrives, with its starter configuration replayed.
pub struct ThreadHandle {
    shared: Arc<ThreadShared>,
    waker: Box<dyn Fn() + Send + Sync>,
    factory: BackendFactory,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("name", &self.shared.name)
            .field("state", &self.shared.state().name())
            .finish()
    }
}

impl ThreadHandle {
    pub fn new(
        name: &str,
        hub_signal: Sender<()>,
        waker: Box<dyn Fn() + Send + Sync>,
        factory: BackendFactory,
    ) -> ThreadHandle {
        ThreadHandle {
            shared: Arc::new(ThreadShared {
                name: name.to_string(),
                state: AtomicU8::new(ThreadState::Stopped as u8),
                health: Health::new(),
                input: Queue::new(),
                output: Queue::new(),
                hub_signal,
                starter: Mutex::new(Starter::default()),
                dead_letters: Mutex::new(None),
            }),
            waker,
            factory,
            join_handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ThreadState {
        self.shared.state()
    }

    /// Start the backend thread.
    pub fn run(&self) -> Result<()> {
        if !self.shared.transition(ThreadState::Stopped, ThreadState::Starting) {
            bail!("{} is already running", self.shared.name);
        }

        let backend = match (self.factory)() {
            Ok(backend) => backend,
            Err(error) => {
                self.shared.health.fail(format!("{:#}", error));
                return Err(error);
            }
        };

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || run_thread(shared, backend));

        match spawned {
            Ok(handle) => {
                *self.join_handle.lock().unwrap() = Some(handle);
                Ok(())
            }
            Err(error) => {
                self.shared.health.fail(error.to_string());
                Err(error.into())
            }
        }
    }

    /// Send one message to the thread.
    ///
    /// Returns `true` when the caller should immediately drain the output
    /// queue, which happens when the message was answered without the thread
    /// running.
    pub fn send(&self, message: Message) -> Result<bool> {
        self.shared.health.check()?;

        if self.shared.state() == ThreadState::Stopping {
            self.join_thread();

            if let Some(mut dead_letters) = self.shared.take_dead_letters() {
                dead_letters.push(message);
                return self.send_all(dead_letters);
            }
        }

        if self.shared.state() == ThreadState::Stopped {
            let Some(command) = message.as_command() else {
                let reason = format!("Non-command message {} sent to a stopped thread", message);
                logline!("{}.", reason);
                self.shared.output.enqueue(Message::reject(&message, reason));
                return Ok(true);
            };

            logline!("Processing offline command {}.", command);
            match self.shared.classify_offline(command) {
                OfflineOutcome::Ack => {
                    self.shared.output.enqueue(Message::ack(command, Ok(())));
                    return Ok(true);
                }
                OfflineOutcome::TriggerRun => {
                    self.shared.input.enqueue(message);
                    self.run()?;
                    return Ok(false);
                }
            }
        }

        self.shared.input.enqueue(message);
        // Re-check after the enqueue: a thread observed as starting may have
        // finished its initial sweep by now and needs an explicit wake.
        if self.shared.state() == ThreadState::Running {
            (self.waker)();
        }
        Ok(false)
    }

    /// Send many messages in order, preserving each message's send semantics.
    pub fn send_all(&self, messages: Vec<Message>) -> Result<bool> {
        let mut should_drain = false;
        for message in messages {
            should_drain |= self.send(message)?;
        }
        Ok(should_drain)
    }

    /// Take the current output batch.
    ///
    /// Deliberately not gated on health: the terminal failure acks of a dead
    /// thread still have to reach the hub.
    pub fn receive_all(&self) -> Option<Vec<Message>> {
        self.shared.output.accept_all()
    }

    /// Re-send any dead-lettered messages. Returns `true` when the re-send
    /// produced output the caller should drain.
    pub fn drain(&self) -> Result<bool> {
        if self.shared.state() == ThreadState::Stopping {
            self.join_thread();
        }

        if self.shared.state() == ThreadState::Stopped {
            if let Some(dead_letters) = self.shared.take_dead_letters() {
                logline!(
                    "Re-sending {} message(s) from the dead letter office.",
                    dead_letters.len()
                );
                return self.send_all(dead_letters);
            }
        }

        Ok(false)
    }

    pub fn collect_status(&self) -> ThreadStatus {
        ThreadStatus {
            state: self.shared.state().name().to_string(),
            health: self.shared.health.failure(),
            in_queue_size: self.shared.input.len(),
            out_queue_size: self.shared.output.len(),
            dead_letter_count: self
                .shared
                .dead_letters
                .lock()
                .unwrap()
                .as_ref()
                .map_or(0, Vec::len),
        }
    }

    fn join_thread(&self) {
        if let Some(handle) = self.join_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run_thread(shared: Arc<ThreadShared>, mut backend: Box<dyn Backend>) {
    if !shared.transition(ThreadState::Starting, ThreadState::Running) {
        logline!("Thread body entered while {}.", shared.state().name());
    }

    let ctx = ThreadContext {
        shared: Arc::clone(&shared),
    };

    // Replay configuration captured while the thread was stopped.
    let starter_messages = shared.starter.lock().unwrap().messages();
    if !starter_messages.is_empty() {
        shared.input.enqueue_all(starter_messages);
    }

    // Commands enqueued during startup, including the one that triggered the
    // run, are handled before the body blocks.
    let sweep = ctx.process_commands(&mut *backend);

    let result = if sweep.stop { Ok(()) } else { backend.run(&ctx) };

    match &result {
        Ok(()) => logline!("Thread stopping normally."),
        Err(error) => logline!("Thread stopping because of an error: {:#}.", error),
    }

    if let Err(error) = result {
        let diagnostic = format!("{} failed: {:#}", shared.name, error);
        shared.health.fail(&diagnostic);

        // Commands stranded in the input queue will never run; complete
        // their acks with the failure so no registered callback leaks.
        let mut failures = Vec::new();
        if let Some(stranded) = shared.input.accept_all() {
            for message in &stranded {
                if let Some(command) = message.as_command() {
                    if command.id() != NULL_COMMAND_ID {
                        failures.push(Message::ack(command, Err(diagnostic.clone())));
                    }
                }
            }
        }
        if !failures.is_empty() {
            shared.output.enqueue_all(failures);
        }
        shared.signal_hub();
    } else if let Some(stragglers) = shared.input.accept_all() {
        // A send can race the stop sweep; preserve late arrivals too.
        logline!(
            "{} late message(s) moved to the dead letter office.",
            stragglers.len()
        );
        shared.stash_dead_letters(stragglers);
        shared.output.enqueue(CommandBuilder::drain().build());
        shared.signal_hub();
    }

    logger::disable();
    shared.mark_stopped();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChannelId, NULL_CHANNEL_ID};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    /// Scripted backend: watches a wake channel, records the commands it
    /// sees, stops when its channel set empties, like the real backends.
    struct StubBackend {
        wake: Arc<Mutex<mpsc::Receiver<()>>>,
        seen: Arc<Mutex<Vec<(CommandAction, ChannelId)>>>,
        channels: Vec<ChannelId>,
        remove_delay: Duration,
        fail_on_run: bool,
    }

    impl Backend for StubBackend {
        fn run(&mut self, ctx: &ThreadContext) -> Result<()> {
            if self.fail_on_run {
                bail!("scripted failure");
            }
            while !ctx.is_stopping() {
                let woken = {
                    let wake = self.wake.lock().unwrap();
                    wake.recv_timeout(Duration::from_millis(20)).is_ok()
                };
                if woken {
                    let sweep = ctx.process_commands(self);
                    if sweep.stop {
                        break;
                    }
                }
            }
            Ok(())
        }

        fn handle_command(
            &mut self,
            _ctx: &ThreadContext,
            command: &CommandPayload,
            _out: &mut MessageBuffer,
        ) -> Result<CommandOutcome> {
            self.seen
                .lock()
                .unwrap()
                .push((command.action(), command.channel()));
            match command.action() {
                CommandAction::Add => {
                    self.channels.push(command.channel());
                    Ok(CommandOutcome::PreventStop)
                }
                CommandAction::Remove => {
                    // A window for racing sends, exercised by the
                    // dead-letter test below.
                    std::thread::sleep(self.remove_delay);
                    self.channels.retain(|&id| id != command.channel());
                    if self.channels.is_empty() {
                        Ok(CommandOutcome::TriggerStop)
                    } else {
                        Ok(CommandOutcome::Ack)
                    }
                }
                _ => handle_unknown_command(command),
            }
        }
    }

    struct Fixture {
        handle: ThreadHandle,
        hub_rx: mpsc::Receiver<()>,
        seen: Arc<Mutex<Vec<(CommandAction, ChannelId)>>>,
    }

    fn fixture_with(remove_delay: Duration, fail_on_run: bool) -> Fixture {
        let (hub_tx, hub_rx) = mpsc::channel();
        let (wake_tx, wake_rx) = mpsc::channel();
        let wake = Arc::new(Mutex::new(wake_rx));
        let seen: Arc<Mutex<Vec<(CommandAction, ChannelId)>>> = Arc::new(Mutex::new(Vec::new()));

        let factory_seen = Arc::clone(&seen);
        let handle = ThreadHandle::new(
            "stub thread",
            hub_tx,
            Box::new(move || {
                let _ = wake_tx.send(());
            }),
            Box::new(move || {
                Ok(Box::new(StubBackend {
                    wake: Arc::clone(&wake),
                    seen: Arc::clone(&factory_seen),
                    channels: Vec::new(),
                    remove_delay,
                    fail_on_run,
                }) as Box<dyn Backend>)
            }),
        );

        Fixture {
            handle,
            hub_rx,
            seen,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Duration::ZERO, false)
    }

    fn add(channel: ChannelId, id: u64) -> Message {
        CommandBuilder::add(channel, std::path::PathBuf::from("/tmp/w"), false)
            .id(id)
            .build()
    }

    fn remove(channel: ChannelId, id: u64) -> Message {
        CommandBuilder::remove(channel).id(id).build()
    }

    fn wait_for_state(handle: &ThreadHandle, state: ThreadState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.state() != state {
            assert!(Instant::now() < deadline, "timed out waiting for {:?}", state);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn drain_output(fixture: &Fixture, wanted: usize) -> Vec<Message> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut collected = Vec::new();
        while collected.len() < wanted {
            assert!(Instant::now() < deadline, "timed out draining output");
            let _ = fixture.hub_rx.recv_timeout(Duration::from_millis(50));
            if let Some(batch) = fixture.handle.receive_all() {
                collected.extend(batch);
            }
        }
        collected
    }

    #[test]
    fn test_offline_logging_command_acks_without_starting() {
        let fixture = fixture();
        let should_drain = fixture
            .handle
            .send(CommandBuilder::log_disable().id(1).build())
            .unwrap();
        assert!(should_drain);
        assert_eq!(fixture.handle.state(), ThreadState::Stopped);

        let batch = fixture.handle.receive_all().unwrap();
        let ack = batch[0].as_ack().unwrap();
        assert_eq!(ack.key(), 1);
        assert!(ack.was_successful());
    }

    #[test]
    fn test_non_command_to_stopped_thread_is_rejected() {
        let fixture = fixture();
        let message = Message::error(4, "stray".to_string(), false);
        let should_drain = fixture.handle.send(message).unwrap();
        assert!(should_drain);

        let batch = fixture.handle.receive_all().unwrap();
        let ack = batch[0].as_ack().unwrap();
        assert!(!ack.was_successful());
        assert_eq!(ack.key(), NULL_COMMAND_ID);
        assert_eq!(ack.channel(), NULL_CHANNEL_ID);
    }

    #[test]
    fn test_add_triggers_run_and_remove_stops() {
        let fixture = fixture();
        assert!(!fixture.handle.send(add(1, 10)).unwrap());

        let batch = drain_output(&fixture, 1);
        assert!(batch[0].as_ack().unwrap().was_successful());
        assert_eq!(fixture.handle.state(), ThreadState::Running);

        assert!(!fixture.handle.send(remove(1, 11)).unwrap());
        let batch = drain_output(&fixture, 1);
        assert_eq!(batch[0].as_ack().unwrap().key(), 11);

        wait_for_state(&fixture.handle, ThreadState::Stopped);
        let seen = fixture.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![(CommandAction::Add, 1), (CommandAction::Remove, 1)]
        );
    }

    #[test]
    fn test_restart_replays_starter_configuration() {
        let fixture = fixture();

        // Recorded while stopped.
        fixture
            .handle
            .send(CommandBuilder::polling_interval(42).id(1).build())
            .unwrap();
        let _ = fixture.handle.receive_all();

        fixture.handle.send(add(1, 2)).unwrap();
        drain_output(&fixture, 1);

        // The triggering command rides ahead of the replayed starter, which
        // carries no ack id.
        let seen = fixture.seen.lock().unwrap().clone();
        assert_eq!(seen[0], (CommandAction::Add, 1));
        assert_eq!(seen[1], (CommandAction::PollingInterval, 0));
    }

    #[test]
    fn test_dead_letters_are_redelivered_after_drain() {
        // The slow remove handler holds the sweep open long enough for a
        // racing send to land behind the accepted batch.
        let fixture = fixture_with(Duration::from_millis(150), false);

        fixture.handle.send(add(1, 1)).unwrap();
        drain_output(&fixture, 1);

        fixture.handle.send(remove(1, 2)).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        fixture.handle.send(add(2, 3)).unwrap();

        // The stop sweep acks the remove and reports the dead letter.
        let batch = drain_output(&fixture, 2);
        assert_eq!(batch[0].as_ack().unwrap().key(), 2);
        let drain_cmd = batch[1].as_command().unwrap();
        assert_eq!(drain_cmd.action(), CommandAction::Drain);

        // Drain re-sends the captured add, which restarts the thread.
        fixture.handle.drain().unwrap();
        let batch = drain_output(&fixture, 1);
        let ack = batch[0].as_ack().unwrap();
        assert_eq!(ack.key(), 3);
        assert!(ack.was_successful());

        let seen = fixture.seen.lock().unwrap().clone();
        assert_eq!(seen.last().unwrap(), &(CommandAction::Add, 2));
        assert_eq!(fixture.handle.state(), ThreadState::Running);
    }

    #[test]
    fn test_body_failure_poisons_health_and_fails_acks() {
        let fixture = fixture_with(Duration::ZERO, true);

        fixture.handle.send(add(1, 7)).unwrap();
        wait_for_state(&fixture.handle, ThreadState::Stopped);

        let status = fixture.handle.collect_status();
        assert!(status.health.is_some());

        // The command processed by the initial sweep was acked before the
        // body failed; later sends are refused with the health error.
        let error = fixture.handle.send(add(2, 8)).unwrap_err();
        assert!(error.to_string().contains("scripted failure"));
    }

    #[test]
    fn test_status_reports_queue_depths() {
        let fixture = fixture();
        let status = fixture.handle.collect_status();
        assert_eq!(status.state, "stopped");
        assert_eq!(status.in_queue_size, 0);
        assert_eq!(status.out_queue_size, 0);
        assert_eq!(status.dead_letter_count, 0);
        assert!(status.health.is_none());
    }
}
