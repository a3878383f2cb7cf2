//! Lifecycle of the wrapped gateway process
//!
//! The manager owns at most one gateway child. Requests call
//! [`GatewayManager::ensure_running`], which spawns the process on demand and
//! waits until its port answers. Concurrent callers share one startup attempt
//! so a burst of requests produces a single spawn.
//!
//! Failed starts are not retried in the background: the next caller simply
//! runs the same logic again.

use crate::config::{GatewayConfig, GatewayTarget};
use crate::error::GatewayError;
use crate::runner::cli_env;
use futures::future::{BoxFuture, FutureExt, Shared};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

/// Externally visible lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    /// No process
    Absent,
    /// A startup attempt is in flight
    Starting,
    /// Process is live
    Running,
    /// Termination signal sent, grace period running
    Stopping,
}

/// Exit event reported by the task that owns the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayExit {
    /// Spawn generation the event belongs to
    pub generation: u64,
    pub pid: Option<u32>,
    /// Exit code, `None` when killed by a signal or unknown
    pub code: Option<i32>,
}

/// Snapshot for the setup status endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub configured: bool,
    pub state: GatewayState,
    pub pid: Option<u32>,
    pub spawn_count: u64,
    pub target: String,
}

/// The live gateway process as seen by the manager
struct GatewayHandle {
    generation: u64,
    pid: Option<u32>,
    /// Asks the supervising task to terminate the child. Taken once
    /// termination has begun.
    stop_tx: Option<oneshot::Sender<()>>,
}

impl GatewayHandle {
    fn is_terminating(&self) -> bool {
        self.stop_tx.is_none()
    }
}

type AttemptFuture = Shared<BoxFuture<'static, Result<(), GatewayError>>>;

/// A startup in flight, shared by every caller that arrives meanwhile
#[derive(Clone)]
struct StartupAttempt {
    id: u64,
    outcome: AttemptFuture,
}

/// Owns the gateway process.
///
/// Construct once at startup; [`new`](GatewayManager::new) returns `Arc<Self>`
/// because the proxy, the setup API and spawned supervisor tasks all hold it.
///
/// Both check-then-act sequences (handle check before spawn, attempt check
/// before creating one) run inside a mutex that is never held across an
/// await. Lock order is attempt slot, then handle.
pub struct GatewayManager {
    config: GatewayConfig,
    config_path: PathBuf,
    target: GatewayTarget,
    handle: Mutex<Option<GatewayHandle>>,
    attempt: Mutex<Option<StartupAttempt>>,
    /// Number of stop/restart calls inside their grace period
    stopping: AtomicUsize,
    /// Woken when a terminated handle has been cleared
    cleared: Notify,
    /// Number of successful spawns, also the generation of the latest one
    generations: AtomicU64,
    attempt_ids: AtomicU64,
    probe_client: Client<HttpConnector, Empty<Bytes>>,
}

impl GatewayManager {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        // No pooling: every probe should reflect the current listener
        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Arc::new(Self {
            config_path: config.config_path(),
            target: config.target(),
            config,
            handle: Mutex::new(None),
            attempt: Mutex::new(None),
            stopping: AtomicUsize::new(0),
            cleared: Notify::new(),
            generations: AtomicU64::new(0),
            attempt_ids: AtomicU64::new(0),
            probe_client,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn target(&self) -> GatewayTarget {
        self.target
    }

    /// Whether onboarding has produced the configuration artifact.
    /// Reads the filesystem every time.
    pub fn is_configured(&self) -> bool {
        self.config_path.exists()
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.lock().as_ref().and_then(|h| h.pid)
    }

    /// Total number of successful spawns since construction
    pub fn spawn_count(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> GatewayState {
        if self.stopping.load(Ordering::SeqCst) > 0 {
            GatewayState::Stopping
        } else if self.attempt.lock().is_some() {
            GatewayState::Starting
        } else if self.is_running() {
            GatewayState::Running
        } else {
            GatewayState::Absent
        }
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            configured: self.is_configured(),
            state: self.state(),
            pid: self.pid(),
            spawn_count: self.spawn_count(),
            target: self.target.to_string(),
        }
    }

    /// Spawn the gateway unless a process is already live.
    ///
    /// Does not wait for readiness.
    pub fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured);
        }

        let mut slot = self.handle.lock();
        if slot.is_some() {
            debug!("Gateway already running");
            return Ok(());
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(self.config.server_args())
            .envs(cli_env(&self.config))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!(command = %self.config.command, error = %e, "Failed to spawn gateway");
            GatewayError::Spawn(e.to_string())
        })?;

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let pid = child.id();
        let (stop_tx, stop_rx) = oneshot::channel();
        *slot = Some(GatewayHandle {
            generation,
            pid,
            stop_tx: Some(stop_tx),
        });
        drop(slot);

        info!(pid, generation, target = %self.target, "Gateway process spawned");

        forward_output(child.stdout.take(), "stdout", pid);
        forward_output(child.stderr.take(), "stderr", pid);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let exit = supervise(child, stop_rx, generation).await;
            manager.record_exit(exit);
        });

        Ok(())
    }

    /// Make sure the gateway is live, starting it and waiting for readiness if needed
    pub async fn ensure_running(self: &Arc<Self>) -> Result<(), GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured);
        }

        loop {
            // Registered before the handle is inspected so a clear in between is not missed
            let cleared = self.cleared.notified();
            tokio::pin!(cleared);
            cleared.as_mut().enable();

            let outcome = {
                let mut slot = self.attempt.lock();
                if let Some(attempt) = slot.as_ref() {
                    debug!(attempt = attempt.id, "Joining in-flight gateway startup");
                    Some(attempt.outcome.clone())
                } else {
                    let terminating = self.handle.lock().as_ref().map(GatewayHandle::is_terminating);
                    match terminating {
                        Some(false) => return Ok(()),
                        // A process on its way out is never handed to a caller
                        Some(true) => None,
                        None => {
                            let attempt = self.begin_attempt();
                            let outcome = attempt.outcome.clone();
                            *slot = Some(attempt);
                            Some(outcome)
                        }
                    }
                }
            };

            match outcome {
                Some(outcome) => return outcome.await,
                None => {
                    debug!("Waiting for terminating gateway to clear");
                    cleared.await;
                }
            }
        }
    }

    /// Terminate the live process (if any), then start a fresh one
    pub async fn restart(self: &Arc<Self>) -> Result<(), GatewayError> {
        info!("Restarting gateway");
        self.terminate_and_clear().await;
        self.ensure_running().await
    }

    /// Terminate the live process. A no-op when nothing is running.
    pub async fn stop(&self) {
        if !self.terminate_and_clear().await {
            debug!("Stop requested but gateway is not running");
        }
    }

    /// Apply an exit event. Events from an older generation are ignored.
    pub fn record_exit(&self, exit: GatewayExit) {
        let mut slot = self.handle.lock();
        let current = slot.as_ref().is_some_and(|h| h.generation == exit.generation);
        if current {
            *slot = None;
            self.cleared.notify_waiters();
            warn!(
                pid = exit.pid,
                code = exit.code,
                generation = exit.generation,
                "Gateway process exited"
            );
        } else {
            debug!(
                pid = exit.pid,
                code = exit.code,
                generation = exit.generation,
                "Exit of a previous gateway process"
            );
        }
    }

    /// Create the shared attempt. Must be called with the attempt slot locked.
    fn begin_attempt(self: &Arc<Self>) -> StartupAttempt {
        let id = self.attempt_ids.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(attempt = id, "Starting gateway");

        // Runs on its own task so it settles even if every waiter goes away
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = match manager.start() {
                Ok(()) => manager.wait_ready().await,
                Err(e) => Err(e),
            };
            manager.finish_attempt(id);
            result
        });

        let manager = Arc::clone(self);
        let outcome = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(attempt = id, error = %e, "Gateway startup task failed");
                    manager.finish_attempt(id);
                    Err(GatewayError::Attempt(e.to_string()))
                }
            }
        }
        .boxed()
        .shared();

        StartupAttempt { id, outcome }
    }

    fn finish_attempt(&self, id: u64) {
        let mut slot = self.attempt.lock();
        if slot.as_ref().is_some_and(|a| a.id == id) {
            *slot = None;
        }
    }

    /// Poll the target until any path answers or the deadline passes.
    ///
    /// The spawned process is left alone on timeout.
    async fn wait_ready(&self) -> Result<(), GatewayError> {
        let timeout = self.config.ready_timeout();
        let interval = self.config.ready_interval();
        let started = Instant::now();
        let deadline = started + timeout;
        let mut rounds: u32 = 0;

        loop {
            rounds += 1;
            for path in &self.config.ready_paths {
                if self.probe(path).await {
                    info!(
                        path = %path,
                        rounds,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Gateway is ready"
                    );
                    return Ok(());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    rounds,
                    timeout_ms = timeout.as_millis() as u64,
                    target = %self.target,
                    "Gateway did not become ready"
                );
                return Err(GatewayError::NotReady { timeout });
            }

            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    /// True when the target returns any HTTP response for `path`
    async fn probe(&self, path: &str) -> bool {
        let req = match Request::get(self.target.url(path)).body(Empty::<Bytes>::new()) {
            Ok(r) => r,
            Err(_) => return false,
        };

        match tokio::time::timeout(self.config.probe_timeout(), self.probe_client.request(req)).await {
            Ok(Ok(response)) => {
                debug!(path, status = %response.status(), "Readiness probe answered");
                true
            }
            Ok(Err(e)) => {
                debug!(path, error = %e, "Readiness probe failed");
                false
            }
            Err(_) => {
                debug!(path, "Readiness probe timed out");
                false
            }
        }
    }

    /// Signal the live process, wait the grace period, then drop its handle
    /// whether or not it exited. Returns false when nothing was running.
    async fn terminate_and_clear(&self) -> bool {
        let (generation, pid, stop_tx) = {
            let mut slot = self.handle.lock();
            match slot.as_mut() {
                Some(handle) => (handle.generation, handle.pid, handle.stop_tx.take()),
                None => return false,
            }
        };

        self.stopping.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }
        info!(pid, generation, "Stopping gateway");

        tokio::time::sleep(self.config.grace_period()).await;

        {
            let mut slot = self.handle.lock();
            if slot.as_ref().is_some_and(|h| h.generation == generation) {
                *slot = None;
            }
        }
        self.stopping.fetch_sub(1, Ordering::SeqCst);
        self.cleared.notify_waiters();
        true
    }
}

/// Wait for the child to exit, terminating it when asked.
///
/// A dropped sender counts as a request to stop, so the child never outlives
/// its manager.
async fn supervise(mut child: Child, stop_rx: oneshot::Receiver<()>, generation: u64) -> GatewayExit {
    let pid = child.id();

    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx => {
            terminate(&mut child);
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(pid, error = %e, "Error waiting for gateway process");
            None
        }
    };

    GatewayExit {
        generation,
        pid,
        code,
    }
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        debug!(pid, "Sending SIGTERM to gateway");
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}

/// Re-emit the child's output through tracing
fn forward_output<R>(pipe: Option<R>, stream: &'static str, pid: Option<u32>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else {
        return;
    };

    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stream == "stderr" {
                warn!(target: "gatewrap::gateway::output", pid, stream, "{}", line);
            } else {
                info!(target: "gatewrap::gateway::output", pid, stream, "{}", line);
            }
        }
    });
}
