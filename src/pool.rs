use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::AppContext;
use crate::ssh::session::{Session, SessionHandle};

/// How long cleanup waits for a session task before aborting it.
const JOIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool full ({capacity} sessions)")]
    Full { capacity: usize },
}

struct Worker {
    handle: Arc<SessionHandle>,
    task: Option<JoinHandle<()>>,
}

/// Bounded registry of live sessions.
///
/// A session is registered when it is spawned and stays registered until a
/// cleanup pass has joined its task. The registry lock is only held to copy
/// or edit membership, never across an `.await`.
pub struct WorkerPool {
    instances: usize,
    workers: Mutex<Vec<Worker>>,
    cleanup_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(instances: usize, shutdown: CancellationToken) -> Self {
        Self {
            instances,
            workers: Mutex::new(Vec::new()),
            cleanup_lock: tokio::sync::Mutex::new(()),
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Worker>> {
        // A poisoned registry is still structurally valid.
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.instances
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Current members, in spawn order.
    pub fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        self.lock().iter().map(|w| w.handle.clone()).collect()
    }

    /// Start a session for an accepted connection. When the pool is full the
    /// connection is dropped, which closes it.
    pub fn spawn(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        ctx: Arc<AppContext>,
    ) -> Result<Arc<SessionHandle>, PoolError> {
        let handle = Arc::new(SessionHandle::new(peer, self.shutdown.child_token()));
        let session = Session::new(stream, handle.clone(), ctx);
        self.admit(handle, session.run())
    }

    /// Register `handle` and run `fut` as its task, unless the pool is at
    /// capacity. The capacity check and the insert happen under one lock.
    pub fn admit<F>(&self, handle: Arc<SessionHandle>, fut: F) -> Result<Arc<SessionHandle>, PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut workers = self.lock();
        if workers.len() >= self.instances {
            return Err(PoolError::Full {
                capacity: self.instances,
            });
        }

        handle.mark_started();
        let finished = handle.clone();
        let task = tokio::spawn(async move {
            fut.await;
            finished.mark_finished();
        });
        workers.push(Worker {
            handle: handle.clone(),
            task: Some(task),
        });
        Ok(handle)
    }

    /// Remove sessions whose task has ended, or every session when `force`
    /// is set. Each removal joins the session task first.
    ///
    /// Without `force`, rescans while a pass still removed something, up to
    /// `passes` scans. With `force`, every session is asked to stop and the
    /// loop runs until the registry is empty. Returns the number removed.
    pub async fn cleanup(&self, passes: usize, force: bool) -> usize {
        let _serial = self.cleanup_lock.lock().await;
        let mut removed = 0;
        let mut scans = 0;

        loop {
            if !force && scans >= passes.max(1) {
                break;
            }
            scans += 1;

            let candidates = self.candidates(force);
            if candidates.is_empty() {
                break;
            }
            for handle in candidates {
                if self.remove(&handle, force).await {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(removed = removed, active = self.len(), forced = force, "Pool cleanup");
        }
        removed
    }

    fn candidates(&self, force: bool) -> Vec<Arc<SessionHandle>> {
        self.lock()
            .iter()
            .filter(|w| force || (w.handle.has_started() && !w.handle.is_running()))
            .map(|w| w.handle.clone())
            .collect()
    }

    /// Workers are matched by handle identity; ids are for logs only.
    async fn remove(&self, handle: &Arc<SessionHandle>, force: bool) -> bool {
        let task = {
            let mut workers = self.lock();
            let Some(worker) = workers.iter_mut().find(|w| Arc::ptr_eq(&w.handle, handle)) else {
                return false;
            };
            worker.task.take()
        };
        let id = handle.id();

        if force {
            handle.stop();
        }

        if let Some(mut task) = task {
            match tokio::time::timeout(JOIN_GRACE, &mut task).await {
                Ok(Err(e)) if e.is_panic() => {
                    warn!(session_id = %id, error = %e, "Session task panicked");
                }
                Ok(_) => {}
                Err(_) => {
                    warn!(session_id = %id, "Session did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        let mut workers = self.lock();
        let before = workers.len();
        workers.retain(|w| !Arc::ptr_eq(&w.handle, handle));
        workers.len() < before
    }
}
