//! What a session does once it is interactive.
//!
//! A [`Behavior`] is chosen at startup and shared by every session. The
//! line protocol in [`line`] drives it.

pub mod broadcast;
pub mod echo;
pub mod line;

use std::sync::Arc;

use crate::config::types::{ChatConfig, ChatMode};
use crate::pool::WorkerPool;
use crate::ssh::session::SessionHandle;
use broadcast::Broadcaster;
use echo::EchoBehavior;

/// Output meant for the session's own client is returned, not sent, so the
/// line loop can batch it and wait for outbox space.
pub trait Behavior: Send + Sync {
    /// Shown once when the shell opens, before the first prompt.
    fn greeting(&self, session: &SessionHandle) -> String;

    fn prompt(&self, session: &SessionHandle) -> String;

    /// A completed, trimmed, valid UTF-8 line. Returns what to show the
    /// sender, if anything.
    fn on_line(&self, session: &SessionHandle, line: &str) -> Option<String>;

    fn on_close(&self, _session: &SessionHandle) {}
}

/// Multi-user chat: every line is broadcast to everyone else.
pub struct ChatBehavior {
    motd: String,
    broadcaster: Broadcaster,
}

impl ChatBehavior {
    pub fn new(motd: impl Into<String>, broadcaster: Broadcaster) -> Self {
        Self {
            motd: motd.into(),
            broadcaster,
        }
    }
}

impl Behavior for ChatBehavior {
    fn greeting(&self, _session: &SessionHandle) -> String {
        format!("{}\r\n", self.motd)
    }

    fn prompt(&self, session: &SessionHandle) -> String {
        format!("[{}] ", session.username().unwrap_or_default())
    }

    fn on_line(&self, session: &SessionHandle, line: &str) -> Option<String> {
        if !line.is_empty() && line != "exit" {
            self.broadcaster.fanout(session, line);
        }
        None
    }
}

/// Build the behavior selected by `config.mode`.
pub fn build_behavior(config: &ChatConfig, pool: Arc<WorkerPool>) -> Arc<dyn Behavior> {
    match config.mode {
        ChatMode::Chat => Arc::new(ChatBehavior::new(
            config.motd.clone(),
            Broadcaster::new(pool),
        )),
        ChatMode::Echo => Arc::new(EchoBehavior),
    }
}
