//! Server lifecycle and session registry.
//!
//! One `PgServer` owns at most one listening socket at a time. `start` binds
//! it and spawns the accept loop; `stop` shuts the loop down, signals every
//! live session to terminate and waits for the drain, with forced socket
//! closure as the backstop so `stop` always completes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{lookup_host, TcpListener, TcpSocket};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use super::auth::Credentials;
use super::connection::{SessionRunner, SessionSettings};
use crate::backend::Backend;
use crate::config::Config;
use crate::error::PgFeError;

#[derive(Error, Debug)]
pub enum StartError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("can't create a server at the specified address {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum StopError {
    #[error("server is not running")]
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Non-owning registry entry for a live session: its cancel flag and task
/// handle. Session internals are never touched through it.
struct SessionHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct SessionTable {
    entries: Mutex<HashMap<u32, SessionHandle>>,
}

impl SessionTable {
    fn insert(&self, id: u32, handle: SessionHandle) {
        self.entries.lock().unwrap().insert(id, handle);
    }

    fn remove(&self, id: u32) {
        self.entries.lock().unwrap().remove(&id);
    }

    fn drain(&self) -> Vec<(u32, SessionHandle)> {
        self.entries.lock().unwrap().drain().collect()
    }

    fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

struct ListenerState {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct PgServer {
    settings: Arc<SessionSettings>,
    backend: Arc<dyn Backend>,
    drain_timeout: Duration,
    state: Mutex<Lifecycle>,
    sessions: Arc<SessionTable>,
    next_session_id: Arc<AtomicU32>,
    listener: Mutex<Option<ListenerState>>,
}

impl PgServer {
    pub fn new(config: &Config, backend: Arc<dyn Backend>) -> Self {
        let settings = Arc::new(SessionSettings {
            max_auth_attempts: config.max_auth_attempts.max(1),
            server_version: config.server_version.clone(),
            credentials: Credentials::new(config.users.clone()),
        });
        Self {
            settings,
            backend,
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
            state: Mutex::new(Lifecycle::Stopped),
            sessions: Arc::new(SessionTable::default()),
            next_session_id: Arc::new(AtomicU32::new(1)),
            listener: Mutex::new(None),
        }
    }

    /// Bind `host:service` and start accepting connections. Fails with
    /// AlreadyRunning unless the server is fully stopped; on a bind failure
    /// the server stays stopped. Returns the bound address.
    pub async fn start(&self, host: &str, service: &str) -> Result<SocketAddr, StartError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != Lifecycle::Stopped {
                return Err(StartError::AlreadyRunning);
            }
            *state = Lifecycle::Starting;
        }

        // Loop-back address if the host is not specified.
        let host = if host.is_empty() { "127.0.0.1" } else { host };
        let addr = format!("{host}:{service}");

        let listener = match bind_listener(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.lock().unwrap() = Lifecycle::Stopped;
                return Err(StartError::Bind { addr, source: e });
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(e) => {
                *self.state.lock().unwrap() = Lifecycle::Stopped;
                return Err(StartError::Bind { addr, source: e });
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            stop_rx,
            Arc::clone(&self.sessions),
            Arc::clone(&self.settings),
            Arc::clone(&self.backend),
            Arc::clone(&self.next_session_id),
        ));

        *self.listener.lock().unwrap() = Some(ListenerState {
            stop: stop_tx,
            task,
            local_addr,
        });
        *self.state.lock().unwrap() = Lifecycle::Running;
        info!("server has been started on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop accepting, cancel every live session and wait for the drain.
    /// Sessions still alive at the drain deadline are forcibly closed at the
    /// socket level, so `stop` always completes.
    pub async fn stop(&self) -> Result<(), StopError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != Lifecycle::Running {
                return Err(StopError::NotRunning);
            }
            *state = Lifecycle::Stopping;
        }

        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .expect("running server has a listener");

        // Stop accepting first so no new session can appear mid-drain.
        let _ = listener.stop.send(true);
        if let Err(e) = listener.task.await {
            if !e.is_cancelled() {
                error!("accept loop failed: {}", e);
            }
        }

        let handles = self.sessions.drain();
        if !handles.is_empty() {
            info!("draining {} active session(s)", handles.len());
        }

        let mut tasks = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            let _ = handle.cancel.send(true);
            tasks.push((id, handle.task));
        }

        let deadline = Instant::now() + self.drain_timeout;
        for (id, mut task) in tasks {
            match timeout_at(deadline, &mut task).await {
                Ok(join) => {
                    if let Err(e) = join {
                        if !e.is_cancelled() {
                            error!("session {} task failed: {}", id, e);
                        }
                    }
                }
                Err(_) => {
                    warn!(
                        "session {}: still alive at the drain deadline, closing its socket",
                        id
                    );
                    task.abort();
                    let _ = task.await;
                }
            }
        }
        // Aborted tasks never ran their own deregistration.
        self.sessions.clear();

        *self.state.lock().unwrap() = Lifecycle::Stopped;
        info!("server was stopped");
        Ok(())
    }

    /// The address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().unwrap().as_ref().map(|l| l.local_addr)
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock().unwrap() == Lifecycle::Running
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

const LISTEN_BACKLOG: u32 = 1024;

/// Resolve `host:service` and bind a listener with SO_REUSEADDR, so the
/// address can be taken again right after a stop despite lingering
/// TIME_WAIT sockets from drained sessions.
async fn bind_listener(addr: &str) -> std::io::Result<TcpListener> {
    let mut last_err = None;
    for resolved in lookup_host(addr).await? {
        let socket = if resolved.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        };
        let socket = match socket {
            Ok(socket) => socket,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        if let Err(e) = socket.set_reuseaddr(true) {
            last_err = Some(e);
            continue;
        }
        if let Err(e) = socket.bind(resolved) {
            last_err = Some(e);
            continue;
        }
        match socket.listen(LISTEN_BACKLOG) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "address did not resolve to any socket address",
        )
    }))
}

async fn accept_loop(
    listener: TcpListener,
    mut stop: watch::Receiver<bool>,
    sessions: Arc<SessionTable>,
    settings: Arc<SessionSettings>,
    backend: Arc<dyn Backend>,
    session_ids: Arc<AtomicU32>,
) {
    loop {
        tokio::select! {
            changed = stop.changed() => {
                let _ = changed;
                break;
            }
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    let id = session_ids.fetch_add(1, Ordering::SeqCst);
                    info!("session {}: connected from {}", id, peer);

                    let (cancel_tx, cancel_rx) = watch::channel(false);
                    let runner = SessionRunner::new(
                        stream,
                        id,
                        Arc::clone(&settings),
                        Arc::clone(&backend),
                        cancel_rx,
                    );
                    let table = Arc::clone(&sessions);
                    let (registered_tx, registered_rx) = oneshot::channel();
                    let task = tokio::spawn(async move {
                        // Hold the runner until the registry entry exists;
                        // a session that ends immediately would otherwise
                        // deregister before it was ever registered and
                        // leave a stale entry behind.
                        let _ = registered_rx.await;
                        match runner.run().await {
                            Ok(()) => info!("session {}: disconnected", id),
                            Err(PgFeError::ConnectionClosed) => {
                                debug!("session {}: connection closed by peer", id)
                            }
                            Err(e) => warn!("session {}: {}", id, e),
                        }
                        table.remove(id);
                    });
                    sessions.insert(id, SessionHandle { cancel: cancel_tx, task });
                    let _ = registered_tx.send(());
                }
                Err(e) => {
                    // A connection reset between accept and first read is not
                    // the server's problem; drop it and keep accepting.
                    warn!("failed to accept connection: {}", e);
                }
            }
        }
    }
    // The listening socket is released when the listener drops here.
    info!("server stopped accepting connections");
}
