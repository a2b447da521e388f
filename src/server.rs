use crate::auth::AuthPolicy;
use crate::chat;
use crate::config::types::AppConfig;
use crate::context::AppContext;
use crate::pool::{PoolError, WorkerPool};
use crate::ssh::keys::HostKey;

use anyhow::{Context, Result};
use russh::keys::PrivateKey;
use russh::{MethodKind, MethodSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Transport settings shared by every session.
pub fn build_ssh_config(config: &AppConfig, host_key: PrivateKey) -> russh::server::Config {
    let mut ssh_config = russh::server::Config::default();
    ssh_config.keys.push(host_key);
    ssh_config.server_id = russh::SshId::Standard(config.server.server_id.clone());
    ssh_config.methods = MethodSet::from([MethodKind::PublicKey].as_slice());
    ssh_config.auth_rejection_time = Duration::from_millis(config.server.auth_rejection_time_ms);
    ssh_config.auth_rejection_time_initial = Some(Duration::from_secs(0));
    ssh_config.inactivity_timeout = config.session.inactivity_timeout();
    ssh_config
}

/// Listening socket polled with a bounded wait, so the accept loop gets to
/// run pool maintenance even when nobody connects.
pub struct Acceptor {
    listener: TcpListener,
    poll_interval: Duration,
}

impl Acceptor {
    pub async fn bind(addr: &str, poll_interval: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        Ok(Self {
            listener,
            poll_interval,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait up to one poll interval for a connection. Accept failures are
    /// logged and reported as no connection.
    pub async fn poll(&self) -> Option<(TcpStream, SocketAddr)> {
        match tokio::time::timeout(self.poll_interval, self.listener.accept()).await {
            Err(_) => None,
            Ok(Ok((stream, peer))) => {
                let _ = stream.set_nodelay(true);
                Some((stream, peer))
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Accept failed");
                // Back off so a persistent error (e.g. fd exhaustion) does not spin.
                tokio::time::sleep(self.poll_interval).await;
                None
            }
        }
    }

    /// Accept loop: poll, reclaim finished sessions, admit the new
    /// connection. Runs until `shutdown`, then force-cleans the pool.
    pub async fn serve(
        self,
        pool: Arc<WorkerPool>,
        ctx: Arc<AppContext>,
        shutdown: CancellationToken,
    ) {
        let passes = ctx.config.server.cleanup_passes;

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.poll() => accepted,
            };

            pool.cleanup(passes, false).await;

            let Some((stream, peer)) = accepted else {
                continue;
            };
            match pool.spawn(stream, peer, ctx.clone()) {
                Ok(session) => {
                    debug!(peer = %peer, session_id = %session.id(), active = pool.len(), "Connection accepted");
                }
                Err(PoolError::Full { capacity }) => {
                    warn!(peer = %peer, capacity = capacity, "Connection refused: pool full");
                }
            }
        }

        let stopped = pool.cleanup(passes, true).await;
        info!(
            stopped = stopped,
            uptime_secs = ctx.start_time.elapsed().as_secs(),
            "Server stopped"
        );
    }
}

/// A running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    pool: Arc<WorkerPool>,
    ctx: Arc<AppContext>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait for the accept loop to finish.
    pub async fn wait(self) -> Result<()> {
        self.task.await.context("accept loop failed")
    }

    /// Stop accepting, stop every session and wait for the pool to drain.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.wait().await
    }
}

/// Start the server using the host key at `server.host_key_path`.
pub async fn start(config: AppConfig) -> Result<ServerHandle> {
    let host_key = HostKey::load_or_create(&config.server.host_key_path)?;
    start_with_key(config, host_key.into_private_key()).await
}

/// Start the server with an already loaded host key.
pub async fn start_with_key(config: AppConfig, host_key: PrivateKey) -> Result<ServerHandle> {
    let config = Arc::new(config);
    let policy = Arc::new(AuthPolicy::from_config(&config.auth)?);
    let shutdown = CancellationToken::new();
    let pool = Arc::new(WorkerPool::new(config.server.instances, shutdown.clone()));

    let ctx = Arc::new(AppContext {
        config: config.clone(),
        policy,
        ssh_config: Arc::new(build_ssh_config(&config, host_key)),
        behavior: chat::build_behavior(&config.chat, pool.clone()),
        start_time: Instant::now(),
    });

    let acceptor = Acceptor::bind(&config.server.listen_addr(), config.server.poll_interval()).await?;
    let local_addr = acceptor.local_addr()?;

    let task = tokio::spawn(
        acceptor
            .serve(pool.clone(), ctx.clone(), shutdown.clone())
            .instrument(tracing::info_span!("acceptor", addr = %local_addr)),
    );

    Ok(ServerHandle {
        local_addr,
        pool,
        ctx,
        shutdown,
        task,
    })
}

/// Run until SIGINT or SIGTERM.
pub async fn run(config: AppConfig) -> Result<()> {
    let verbose = config.server.verbose;
    let server = start(config).await?;
    let port = server.local_addr().port();
    if verbose {
        info!(port = port, mode = %server.context().config.chat.mode, "Serving on port {}", port);
    } else {
        debug!(port = port, "Serving on port {}", port);
    }

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        handle_signals(shutdown).await;
    });

    server.wait().await
}

#[cfg(unix)]
async fn handle_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

#[cfg(not(unix))]
async fn handle_signals(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}
