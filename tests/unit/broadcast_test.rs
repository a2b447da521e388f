use sshchat::chat::broadcast::Broadcaster;
use sshchat::chat::{Behavior, ChatBehavior};
use sshchat::pool::WorkerPool;
use sshchat::ssh::session::SessionHandle;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Member {
    handle: Arc<SessionHandle>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Member {
    fn received(&mut self) -> String {
        let mut out = Vec::new();
        while let Ok(chunk) = self.rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8(out).unwrap()
    }
}

/// Register an interactive session that runs until cancelled.
fn join(pool: &WorkerPool, name: &str, capacity: usize) -> Member {
    let handle = Arc::new(SessionHandle::new(
        "127.0.0.1:40000".parse().unwrap(),
        CancellationToken::new(),
    ));
    handle.set_username(name);
    let (tx, rx) = mpsc::channel(capacity);
    handle.attach_outbox(tx);

    let token = handle.cancellation_token().clone();
    pool.admit(handle.clone(), async move { token.cancelled().await })
        .unwrap();
    Member { handle, rx }
}

fn setup() -> (Arc<WorkerPool>, Broadcaster) {
    let pool = Arc::new(WorkerPool::new(10, CancellationToken::new()));
    let broadcaster = Broadcaster::new(pool.clone());
    (pool, broadcaster)
}

#[tokio::test]
async fn fanout_reaches_everyone_but_sender() {
    let (pool, broadcaster) = setup();
    let mut alice = join(&pool, "alice", 16);
    let mut bob = join(&pool, "bob", 16);
    let mut carol = join(&pool, "carol", 16);

    assert_eq!(broadcaster.fanout(&alice.handle, "hello"), 2);
    assert_eq!(bob.received(), "alice: hello\r\n");
    assert_eq!(carol.received(), "alice: hello\r\n");
    assert_eq!(alice.received(), "");

    pool.cleanup(1, true).await;
}

#[tokio::test]
async fn closed_recipient_does_not_block_others() {
    let (pool, broadcaster) = setup();
    let alice = join(&pool, "alice", 16);
    let bob = join(&pool, "bob", 16);
    let mut carol = join(&pool, "carol", 16);

    // Bob's channel went away without the pool noticing yet.
    drop(bob.rx);
    assert!(!bob.handle.is_channel_open());

    assert_eq!(broadcaster.fanout(&alice.handle, "hello"), 1);
    assert_eq!(carol.received(), "alice: hello\r\n");

    pool.cleanup(1, true).await;
}

#[tokio::test]
async fn detached_recipient_is_skipped() {
    let (pool, broadcaster) = setup();
    let alice = join(&pool, "alice", 16);
    let mut bob = join(&pool, "bob", 16);
    bob.handle.detach_outbox();

    assert_eq!(broadcaster.fanout(&alice.handle, "anyone?"), 0);
    assert_eq!(bob.received(), "");

    pool.cleanup(1, true).await;
}

#[tokio::test]
async fn full_outbox_drops_only_that_delivery() {
    let (pool, broadcaster) = setup();
    let alice = join(&pool, "alice", 16);
    let mut slow = join(&pool, "slow", 1);
    let mut fast = join(&pool, "fast", 16);

    slow.handle.send(b"backlog").unwrap();
    assert_eq!(broadcaster.fanout(&alice.handle, "one"), 1);
    assert_eq!(fast.received(), "alice: one\r\n");
    assert_eq!(slow.received(), "backlog");

    pool.cleanup(1, true).await;
}

#[tokio::test]
async fn empty_message_is_not_sent() {
    let (pool, broadcaster) = setup();
    let alice = join(&pool, "alice", 16);
    let mut bob = join(&pool, "bob", 16);

    assert_eq!(broadcaster.fanout(&alice.handle, ""), 0);
    assert_eq!(bob.received(), "");

    pool.cleanup(1, true).await;
}

#[tokio::test]
async fn chat_behavior_broadcasts_lines_but_not_exit() {
    let (pool, broadcaster) = setup();
    let behavior = ChatBehavior::new("motd", broadcaster);
    let mut alice = join(&pool, "alice", 16);
    let mut bob = join(&pool, "bob", 16);

    assert_eq!(behavior.greeting(&alice.handle), "motd\r\n");
    assert_eq!(behavior.prompt(&alice.handle), "[alice] ");

    assert_eq!(behavior.on_line(&alice.handle, "exit"), None);
    assert_eq!(behavior.on_line(&alice.handle, ""), None);
    assert_eq!(behavior.on_line(&alice.handle, "hi bob"), None);
    assert_eq!(bob.received(), "alice: hi bob\r\n");
    assert_eq!(alice.received(), "");

    pool.cleanup(1, true).await;
}

#[test]
fn format_matches_wire_layout() {
    assert_eq!(Broadcaster::format("alice", "hello"), "alice: hello\r\n");
}
