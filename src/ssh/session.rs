use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::Result;
use russh::server::Msg;
use russh::Channel;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::chat::line::{self, Ending};
use crate::context::AppContext;
use crate::ssh::handler::{SessionEvent, SessionHandler};
use crate::utils::generate_session_id;

/// How long teardown waits for the transport and writer tasks to finish.
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of one accepted connection. `Closed` is terminal and reachable
/// from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Handshaking = 0,
    Authorizing = 1,
    AwaitingChannel = 2,
    Interactive = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Handshaking,
            1 => SessionState::Authorizing,
            2 => SessionState::AwaitingChannel,
            3 => SessionState::Interactive,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Handshaking => write!(f, "handshaking"),
            SessionState::Authorizing => write!(f, "authorizing"),
            SessionState::AwaitingChannel => write!(f, "awaiting-channel"),
            SessionState::Interactive => write!(f, "interactive"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("channel closed")]
    Closed,
    #[error("outbox full")]
    Full,
}

/// Shared view of a session: what the pool, the broadcaster and the
/// transport callbacks see of it.
#[derive(Debug)]
pub struct SessionHandle {
    id: String,
    peer: SocketAddr,
    accepted_at: Instant,
    username: OnceLock<String>,
    fingerprint: OnceLock<String>,
    state: AtomicU8,
    started: AtomicBool,
    running: AtomicBool,
    cancel: CancellationToken,
    outbox: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl SessionHandle {
    pub fn new(peer: SocketAddr, cancel: CancellationToken) -> Self {
        Self::with_id(generate_session_id(), peer, cancel)
    }

    pub fn with_id(id: impl Into<String>, peer: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            id: id.into(),
            peer,
            accepted_at: Instant::now(),
            username: OnceLock::new(),
            fingerprint: OnceLock::new(),
            state: AtomicU8::new(SessionState::Handshaking as u8),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            cancel,
            outbox: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// When the connection was handed to the pool.
    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    pub fn username(&self) -> Option<&str> {
        self.username.get().map(String::as_str)
    }

    /// Record the authenticated identity. The first call wins.
    pub fn set_username(&self, username: &str) {
        let _ = self.username.set(username.to_string());
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.get().map(String::as_str)
    }

    pub fn set_fingerprint(&self, fingerprint: String) {
        let _ = self.fingerprint.set(fingerprint);
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn mark_started(&self) {
        self.running.store(true, Ordering::Release);
        self.started.store(true, Ordering::Release);
    }

    /// Clear the cooperative running flag; the interactive loop exits after
    /// the current iteration.
    pub fn clear_running(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Request a stop that also interrupts any blocked read or wait.
    pub fn stop(&self) {
        self.clear_running();
        self.cancel.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Mark the session ended: not running, state `Closed`, outbox gone.
    pub fn mark_finished(&self) {
        self.clear_running();
        self.set_state(SessionState::Closed);
        self.detach_outbox();
    }

    pub fn attach_outbox(&self, tx: mpsc::Sender<Vec<u8>>) {
        if let Ok(mut outbox) = self.outbox.lock() {
            *outbox = Some(tx);
        }
    }

    pub fn detach_outbox(&self) {
        if let Ok(mut outbox) = self.outbox.lock() {
            outbox.take();
        }
    }

    pub fn is_channel_open(&self) -> bool {
        self.outbox
            .lock()
            .map(|outbox| outbox.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    /// Queue bytes for the client without waiting. Used for traffic from
    /// other sessions, which must never block on a slow recipient.
    pub fn send(&self, data: &[u8]) -> Result<(), DeliveryError> {
        let outbox = self.outbox.lock().map_err(|_| DeliveryError::Closed)?;
        let tx = outbox.as_ref().ok_or(DeliveryError::Closed)?;
        tx.try_send(data.to_vec()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Queue the session's own output, waiting for outbox space. Only the
    /// session's own loop calls this, so a slow client stalls nobody else.
    pub async fn deliver(&self, data: Vec<u8>) -> Result<(), DeliveryError> {
        let tx = {
            let outbox = self.outbox.lock().map_err(|_| DeliveryError::Closed)?;
            outbox.clone().ok_or(DeliveryError::Closed)?
        };
        tx.send(data).await.map_err(|_| DeliveryError::Closed)
    }
}

/// One accepted connection, driven from handshake to teardown.
pub struct Session {
    stream: TcpStream,
    handle: Arc<SessionHandle>,
    ctx: Arc<AppContext>,
}

impl Session {
    pub fn new(stream: TcpStream, handle: Arc<SessionHandle>, ctx: Arc<AppContext>) -> Self {
        Self {
            stream,
            handle,
            ctx,
        }
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    /// Run the session to completion. Errors end this session only.
    pub async fn run(self) {
        let span = info_span!(
            "session",
            session_id = %self.handle.id(),
            peer = %self.handle.peer()
        );
        async move {
            let handle = self.handle.clone();
            match self.drive().await {
                Ok(ending) => info!(user = ?handle.username(), ending = %ending, "Session closed"),
                Err(e) => warn!(user = ?handle.username(), error = %e, "Session ended with error"),
            }
            handle.mark_finished();
        }
        .instrument(span)
        .await
    }

    async fn drive(self) -> Result<Ending> {
        let Session {
            stream,
            handle,
            ctx,
        } = self;
        let cancel = handle.cancellation_token().clone();

        handle.set_state(SessionState::Handshaking);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let handler = SessionHandler::new(ctx.policy.clone(), handle.clone(), events_tx);

        // One deadline from accept covers both the handshake and authentication.
        let auth_deadline = handle.accepted_at() + ctx.config.session.handshake_timeout();
        let running = tokio::select! {
            _ = cancel.cancelled() => return Ok(Ending::Cancelled),
            r = tokio::time::timeout_at(
                auth_deadline,
                russh::server::run_stream(ctx.ssh_config.clone(), stream, handler),
            ) => match r {
                Ok(running) => running?,
                Err(_) => anyhow::bail!("handshake timed out"),
            },
        };
        let transport = running.handle();
        let mut transport_task = Some(tokio::spawn(running));

        let result =
            match wait_for_channel(&handle, &ctx, auth_deadline, &mut events, &mut transport_task, &cancel).await {
                Ok(Some(channel)) => interact(channel, &handle, &ctx, &cancel).await,
                Ok(None) => Ok(Ending::TransportClosed),
                Err(e) => Err(e),
            };

        // Closed: release the transport on every path.
        handle.set_state(SessionState::Closed);
        handle.detach_outbox();
        if let Some(task) = transport_task {
            if !task.is_finished() {
                let _ = transport
                    .disconnect(
                        russh::Disconnect::ByApplication,
                        "session closed".to_string(),
                        "en".to_string(),
                    )
                    .await;
            }
            join_or_abort(task, "transport").await;
        }
        result
    }
}

type TransportTask = JoinHandle<Result<(), anyhow::Error>>;

/// Resolve when the transport task ends, leaving `None` behind so the
/// handle is never polled again. Pending forever once consumed.
async fn transport_finished(
    task: &mut Option<TransportTask>,
) -> Result<Result<(), anyhow::Error>, tokio::task::JoinError> {
    let Some(running) = task.as_mut() else {
        return std::future::pending().await;
    };
    let finished = running.await;
    *task = None;
    finished
}

/// Wait through `Authorizing` and `AwaitingChannel`. `None` means the
/// transport ended before a shell was requested.
async fn wait_for_channel(
    handle: &SessionHandle,
    ctx: &AppContext,
    auth_deadline: Instant,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    transport_task: &mut Option<TransportTask>,
    cancel: &CancellationToken,
) -> Result<Option<Channel<Msg>>> {
    let auth_deadline = tokio::time::sleep_until(auth_deadline);
    tokio::pin!(auth_deadline);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("stopped before channel was ready"),
            _ = &mut auth_deadline => anyhow::bail!("authentication timed out"),
            finished = transport_finished(transport_task) => {
                return match finished {
                    Ok(Ok(())) => Ok(None),
                    Ok(Err(e)) => Err(e.context("transport failed before channel was ready")),
                    Err(e) => Err(anyhow::anyhow!("transport task failed: {}", e)),
                };
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => return Ok(None),
            },
        };

        match event {
            SessionEvent::Authenticated => {
                handle.set_state(SessionState::AwaitingChannel);
                let timeout = ctx.config.session.channel_timeout();
                return tokio::select! {
                    _ = cancel.cancelled() => anyhow::bail!("stopped before channel was ready"),
                    _ = tokio::time::sleep(timeout) => {
                        warn!(
                            user = ?handle.username(),
                            timeout_secs = timeout.as_secs(),
                            "Channel wait timed out"
                        );
                        anyhow::bail!("no shell request within {}s", timeout.as_secs())
                    }
                    finished = transport_finished(transport_task) => {
                        if let Ok(Err(e)) = finished {
                            debug!(error = %e, "Transport ended while awaiting channel");
                        }
                        Ok(None)
                    }
                    ready = next_shell(events) => Ok(ready),
                };
            }
            SessionEvent::ShellReady(_) => {
                // The handler refuses channels until a key is accepted.
                debug!("Ignoring shell request before authentication");
            }
        }
    }
}

async fn next_shell(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Option<Channel<Msg>> {
    while let Some(event) = events.recv().await {
        if let SessionEvent::ShellReady(channel) = event {
            return Some(channel);
        }
    }
    None
}

async fn interact(
    channel: Channel<Msg>,
    handle: &Arc<SessionHandle>,
    ctx: &AppContext,
    cancel: &CancellationToken,
) -> Result<Ending> {
    handle.set_state(SessionState::Interactive);
    info!(user = ?handle.username(), "Shell ready");

    let (reader, writer) = tokio::io::split(channel.into_stream());
    let (tx, rx) = mpsc::channel(ctx.config.session.outbox_capacity);
    handle.attach_outbox(tx);
    let writer_task = tokio::spawn(pump_outbox(rx, writer));

    let result = line::run(reader, handle, ctx.behavior.as_ref(), cancel).await;
    ctx.behavior.on_close(handle);

    // Dropping the sender lets the writer flush what is queued and exit.
    handle.detach_outbox();
    join_or_abort(writer_task, "writer").await;
    result
}

/// Drain a session's outbox into its channel.
pub async fn pump_outbox<W>(mut rx: mpsc::Receiver<Vec<u8>>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = writer.write_all(&chunk).await {
            debug!(error = %e, "Channel write failed");
            return;
        }
        if let Err(e) = writer.flush().await {
            debug!(error = %e, "Channel flush failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn join_or_abort<T>(mut task: JoinHandle<T>, what: &str) {
    if tokio::time::timeout(TEARDOWN_GRACE, &mut task).await.is_err() {
        debug!(task = what, "Task did not finish in time, aborting");
        task.abort();
    }
}
