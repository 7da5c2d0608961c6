//! Vigil: native core of a cross-platform filesystem watcher.
//!
//! Vigil observes directory trees on behalf of independent subscriber
//! channels, normalizes heterogeneous platform notification streams into one
//! canonical event schema, and delivers events in order to the embedder that
//! drives it. Two backends feed the pipeline: a native worker over the
//! platform notification layer, and a polling scanner for everything the
//! native layer cannot cover.

pub mod health;
pub mod hub;
pub mod logger;
pub mod message;
pub mod poller;
pub mod queue;
pub mod status;
pub mod thread;
pub mod worker;

pub use hub::{
    AckCallback, AllCallback, ChannelDelivery, ConfigureOptions, EventCallback, Hub, WatchOptions,
};
pub use message::{
    ChannelId, CommandId, EntryKind, Event, FileAction, Message, NULL_CHANNEL_ID, NULL_COMMAND_ID,
};
pub use status::{Status, ThreadStatus};
pub use thread::ThreadState;
