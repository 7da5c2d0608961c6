//! Point-in-time diagnostics snapshot: queue depths, callback counts, and
//! thread states, collected without disturbing the pipeline.

use serde::Serialize;

/// State of one backend thread.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ThreadStatus {
    /// Lifecycle state name: stopped, starting, running, stopping.
    pub state: String,
    /// Stored health failure, `None` while the thread is healthy.
    pub health: Option<String>,
    pub in_queue_size: usize,
    pub out_queue_size: usize,
    pub dead_letter_count: usize,
}

/// Snapshot of the whole pipeline.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Status {
    pub pending_callback_count: usize,
    pub channel_callback_count: usize,
    pub worker: ThreadStatus,
    pub polling: ThreadStatus,
}
