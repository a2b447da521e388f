use std::sync::Arc;

use tracing::trace;

use crate::pool::WorkerPool;
use crate::ssh::session::SessionHandle;

/// Delivers a sender's line to every other live session.
pub struct Broadcaster {
    pool: Arc<WorkerPool>,
}

impl Broadcaster {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    /// The line every recipient sees.
    pub fn format(sender: &str, message: &str) -> String {
        format!("{}: {}\r\n", sender, message)
    }

    /// Send `message` from `sender` to every other session with an open
    /// channel. Recipients are taken from a snapshot of the pool, so a slow
    /// or closed recipient never holds the registry. Delivery failures are
    /// per recipient and are not reported to the sender. Returns the number
    /// of sessions the message was queued for.
    pub fn fanout(&self, sender: &SessionHandle, message: &str) -> usize {
        if message.is_empty() {
            return 0;
        }

        let line = Self::format(sender.username().unwrap_or_default(), message);
        let mut delivered = 0;
        for recipient in self.pool.snapshot() {
            if recipient.id() == sender.id() || !recipient.is_channel_open() {
                continue;
            }
            match recipient.send(line.as_bytes()) {
                Ok(()) => delivered += 1,
                Err(e) => trace!(session_id = %recipient.id(), error = %e, "Broadcast skipped"),
            }
        }
        trace!(delivered = delivered, "Broadcast");
        delivered
    }
}
