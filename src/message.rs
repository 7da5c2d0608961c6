//! Message protocol shared by every thread in the pipeline.
//!
//! A single concrete `Message` type flows through the inter-thread queues:
//! commands travelling toward a backend, and acks, filesystem events, and
//! errors travelling back toward the hub. Keeping the queue element a closed
//! tagged enum bounds its size and makes dispatch an exhaustive match.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Serialize, Serializer};

/// Monotonically increasing command identifier. Never reused in-process.
pub type CommandId = u64;

/// Monotonically increasing channel identifier. Never reused in-process.
pub type ChannelId = u64;

/// Sentinel command id meaning "no ack requested".
pub const NULL_COMMAND_ID: CommandId = 0;

/// Sentinel channel id meaning "no channel".
pub const NULL_CHANNEL_ID: ChannelId = 0;

/// Requests a thread understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandAction {
    Add,
    Remove,
    LogFile,
    LogStdout,
    LogStderr,
    LogDisable,
    PollingInterval,
    PollingThrottle,
    Drain,
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandAction::Add => "add",
            CommandAction::Remove => "remove",
            CommandAction::LogFile => "log_file",
            CommandAction::LogStdout => "log_stdout",
            CommandAction::LogStderr => "log_stderr",
            CommandAction::LogDisable => "log_disable",
            CommandAction::PollingInterval => "polling_interval",
            CommandAction::PollingThrottle => "polling_throttle",
            CommandAction::Drain => "drain",
        };
        write!(f, "{}", name)
    }
}

/// What happened to a filesystem entry.
///
/// The numeric codes are the wire shape delivered to the embedder:
/// 0=created, 1=deleted, 2=modified, 3=renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileAction {
    Created,
    Deleted,
    Modified,
    Renamed,
}

impl FileAction {
    pub fn code(self) -> u8 {
        match self {
            FileAction::Created => 0,
            FileAction::Deleted => 1,
            FileAction::Modified => 2,
            FileAction::Renamed => 3,
        }
    }
}

impl Serialize for FileAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileAction::Created => "created",
            FileAction::Deleted => "deleted",
            FileAction::Modified => "modified",
            FileAction::Renamed => "renamed",
        };
        write!(f, "{}", name)
    }
}

/// What kind of entry an event refers to.
///
/// Wire codes: 0=file, 1=directory, 2=symlink, 3=unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

impl EntryKind {
    pub fn code(self) -> u8 {
        match self {
            EntryKind::File => 0,
            EntryKind::Directory => 1,
            EntryKind::Symlink => 2,
            EntryKind::Unknown => 3,
        }
    }

    /// Classify a stat result without following symlinks.
    pub fn of_metadata(metadata: &std::fs::Metadata) -> EntryKind {
        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Unknown
        }
    }
}

impl Serialize for EntryKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
            EntryKind::Symlink => "symlink",
            EntryKind::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// A request sent to a backend thread.
#[derive(Debug, Clone)]
pub struct CommandPayload {
    id: CommandId,
    action: CommandAction,
    channel: ChannelId,
    root: Option<PathBuf>,
    recursive: bool,
    split_count: usize,
    arg: u64,
}

impl CommandPayload {
    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn action(&self) -> CommandAction {
        self.action
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn recursive(&self) -> bool {
        self.recursive
    }

    pub fn split_count(&self) -> usize {
        self.split_count
    }

    pub fn arg(&self) -> u64 {
        self.arg
    }

    /// Copy of this command with the ack id cleared, for replay from a
    /// thread's starter configuration.
    pub fn for_replay(&self) -> CommandPayload {
        let mut copy = self.clone();
        copy.id = NULL_COMMAND_ID;
        copy
    }
}

impl fmt::Display for CommandPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command[{} #{}", self.action, self.id)?;
        if self.channel != NULL_CHANNEL_ID {
            write!(f, " channel {}", self.channel)?;
        }
        if let Some(root) = &self.root {
            write!(f, " root {}", root.display())?;
            if self.recursive {
                write!(f, " (recursive)")?;
            }
        }
        if self.arg != 0 {
            write!(f, " arg {}", self.arg)?;
        }
        write!(f, "]")
    }
}

/// Reply to a previously issued command.
#[derive(Debug, Clone)]
pub struct AckPayload {
    key: CommandId,
    channel: ChannelId,
    success: bool,
    message: Option<String>,
}

impl AckPayload {
    pub fn key(&self) -> CommandId {
        self.key
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn was_successful(&self) -> bool {
        self.success
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for AckPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ack[#{} channel {}", self.key, self.channel)?;
        if self.success {
            write!(f, " ok]")
        } else {
            write!(f, " failed: {}]", self.message.as_deref().unwrap_or("unknown error"))
        }
    }
}

/// A canonical filesystem event attributed to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemPayload {
    channel: ChannelId,
    action: FileAction,
    kind: EntryKind,
    old_path: Option<PathBuf>,
    path: PathBuf,
}

impl FileSystemPayload {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn action(&self) -> FileAction {
        self.action
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn old_path(&self) -> Option<&Path> {
        self.old_path.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Strip the channel attribution and produce the embedder-facing event.
    pub fn to_event(&self) -> Event {
        Event {
            action: self.action,
            kind: self.kind,
            old_path: self.old_path.clone().unwrap_or_default(),
            path: self.path.clone(),
        }
    }
}

impl fmt::Display for FileSystemPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileSystemEvent[channel {} {} {}", self.channel, self.action, self.kind)?;
        if let Some(old) = &self.old_path {
            write!(f, " {} ->", old.display())?;
        }
        write!(f, " {}]", self.path.display())
    }
}

/// A failure attributed to a channel.
#[derive(Debug, Clone)]
pub struct ErrorPayload {
    channel: ChannelId,
    message: String,
    fatal: bool,
}

impl ErrorPayload {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn was_fatal(&self) -> bool {
        self.fatal
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Error[channel {}{}: {}]",
            self.channel,
            if self.fatal { " fatal" } else { "" },
            self.message
        )
    }
}

/// The single element type of every inter-thread queue.
#[derive(Debug, Clone)]
pub enum Message {
    Command(CommandPayload),
    Ack(AckPayload),
    FileSystem(FileSystemPayload),
    Error(ErrorPayload),
}

impl Message {
    pub fn as_command(&self) -> Option<&CommandPayload> {
        match self {
            Message::Command(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn as_ack(&self) -> Option<&AckPayload> {
        match self {
            Message::Ack(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn as_filesystem(&self) -> Option<&FileSystemPayload> {
        match self {
            Message::FileSystem(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorPayload> {
        match self {
            Message::Error(payload) => Some(payload),
            _ => None,
        }
    }

    /// Ack for a command, success or failure.
    pub fn ack(command: &CommandPayload, result: Result<(), String>) -> Message {
        let (success, message) = match result {
            Ok(()) => (true, None),
            Err(text) => (false, Some(text)),
        };
        Message::Ack(AckPayload {
            key: command.id(),
            channel: command.channel(),
            success,
            message,
        })
    }

    /// Failure ack for a message that turned out not to be a command.
    pub fn reject(message: &Message, reason: String) -> Message {
        let (key, channel) = match message.as_command() {
            Some(command) => (command.id(), command.channel()),
            None => (NULL_COMMAND_ID, NULL_CHANNEL_ID),
        };
        Message::Ack(AckPayload {
            key,
            channel,
            success: false,
            message: Some(reason),
        })
    }

    pub fn error(channel: ChannelId, message: String, fatal: bool) -> Message {
        Message::Error(ErrorPayload {
            channel,
            message,
            fatal,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Command(payload) => payload.fmt(f),
            Message::Ack(payload) => payload.fmt(f),
            Message::FileSystem(payload) => payload.fmt(f),
            Message::Error(payload) => payload.fmt(f),
        }
    }
}

/// Builder for command payloads. The hub assigns the id last, immediately
/// before the send, so each dispatch gets a fresh one.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    id: CommandId,
    action: CommandAction,
    channel: ChannelId,
    root: Option<PathBuf>,
    recursive: bool,
    split_count: usize,
    arg: u64,
}

impl CommandBuilder {
    fn new(action: CommandAction) -> CommandBuilder {
        CommandBuilder {
            id: NULL_COMMAND_ID,
            action,
            channel: NULL_CHANNEL_ID,
            root: None,
            recursive: false,
            split_count: 1,
            arg: 0,
        }
    }

    pub fn add(channel: ChannelId, root: PathBuf, recursive: bool) -> CommandBuilder {
        let mut builder = CommandBuilder::new(CommandAction::Add);
        builder.channel = channel;
        builder.root = Some(root);
        builder.recursive = recursive;
        builder
    }

    pub fn remove(channel: ChannelId) -> CommandBuilder {
        let mut builder = CommandBuilder::new(CommandAction::Remove);
        builder.channel = channel;
        builder
    }

    pub fn log_file(path: PathBuf) -> CommandBuilder {
        let mut builder = CommandBuilder::new(CommandAction::LogFile);
        builder.root = Some(path);
        builder
    }

    pub fn log_stdout() -> CommandBuilder {
        CommandBuilder::new(CommandAction::LogStdout)
    }

    pub fn log_stderr() -> CommandBuilder {
        CommandBuilder::new(CommandAction::LogStderr)
    }

    pub fn log_disable() -> CommandBuilder {
        CommandBuilder::new(CommandAction::LogDisable)
    }

    pub fn polling_interval(ms: u64) -> CommandBuilder {
        let mut builder = CommandBuilder::new(CommandAction::PollingInterval);
        builder.arg = ms;
        builder
    }

    pub fn polling_throttle(ms: u64) -> CommandBuilder {
        let mut builder = CommandBuilder::new(CommandAction::PollingThrottle);
        builder.arg = ms;
        builder
    }

    pub fn drain() -> CommandBuilder {
        CommandBuilder::new(CommandAction::Drain)
    }

    pub fn id(mut self, id: CommandId) -> CommandBuilder {
        self.id = id;
        self
    }

    pub fn build(self) -> Message {
        Message::Command(CommandPayload {
            id: self.id,
            action: self.action,
            channel: self.channel,
            root: self.root,
            recursive: self.recursive,
            split_count: self.split_count,
            arg: self.arg,
        })
    }
}

/// Event record delivered to an embedder callback.
///
/// `old_path` is empty except for renames, where it carries the source path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub action: FileAction,
    pub kind: EntryKind,
    pub old_path: PathBuf,
    pub path: PathBuf,
}

/// Accumulates messages produced within one notification cycle so they can
/// be flushed to the out-queue as a single batch.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    messages: Vec<Message>,
}

impl MessageBuffer {
    pub fn new() -> MessageBuffer {
        MessageBuffer::default()
    }

    pub fn created(&mut self, channel: ChannelId, path: PathBuf, kind: EntryKind) {
        self.messages.push(Message::FileSystem(FileSystemPayload {
            channel,
            action: FileAction::Created,
            kind,
            old_path: None,
            path,
        }));
    }

    pub fn deleted(&mut self, channel: ChannelId, path: PathBuf, kind: EntryKind) {
        self.messages.push(Message::FileSystem(FileSystemPayload {
            channel,
            action: FileAction::Deleted,
            kind,
            old_path: None,
            path,
        }));
    }

    pub fn modified(&mut self, channel: ChannelId, path: PathBuf, kind: EntryKind) {
        self.messages.push(Message::FileSystem(FileSystemPayload {
            channel,
            action: FileAction::Modified,
            kind,
            old_path: None,
            path,
        }));
    }

    pub fn renamed(&mut self, channel: ChannelId, old_path: PathBuf, path: PathBuf, kind: EntryKind) {
        self.messages.push(Message::FileSystem(FileSystemPayload {
            channel,
            action: FileAction::Renamed,
            kind,
            old_path: Some(old_path),
            path,
        }));
    }

    pub fn error(&mut self, channel: ChannelId, message: String, fatal: bool) {
        self.messages.push(Message::error(channel, message, fatal));
    }

    pub fn ack(&mut self, command: &CommandPayload, result: Result<(), String>) {
        self.messages.push(Message::ack(command, result));
    }

    pub fn message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn take(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.messages)
    }
}

/// A message buffer bound to one channel, used by translation helpers that
/// only ever speak for a single subscriber.
#[derive(Debug)]
pub struct ChannelMessageBuffer<'a> {
    buffer: &'a mut MessageBuffer,
    channel: ChannelId,
}

impl<'a> ChannelMessageBuffer<'a> {
    pub fn new(buffer: &'a mut MessageBuffer, channel: ChannelId) -> ChannelMessageBuffer<'a> {
        ChannelMessageBuffer { buffer, channel }
    }

    pub fn created(&mut self, path: PathBuf, kind: EntryKind) {
        self.buffer.created(self.channel, path, kind);
    }

    pub fn deleted(&mut self, path: PathBuf, kind: EntryKind) {
        self.buffer.deleted(self.channel, path, kind);
    }

    pub fn modified(&mut self, path: PathBuf, kind: EntryKind) {
        self.buffer.modified(self.channel, path, kind);
    }

    pub fn renamed(&mut self, old_path: PathBuf, path: PathBuf, kind: EntryKind) {
        self.buffer.renamed(self.channel, old_path, path, kind);
    }

    pub fn error(&mut self, message: String, fatal: bool) {
        self.buffer.error(self.channel, message, fatal);
    }
}
