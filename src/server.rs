//! Socket lifecycle: claim the path, bind, serve, self-heal, hand over.
//!
//! # Architecture
//!
//! ```text
//! Supervisor (config reconcile)
//!    │ start/stop
//!    ▼
//! PinentryServer ──spawns──► supervise task
//!                              │ claim_and_bind ◄─── restart on socket loss
//!                              ▼
//!                            serve loop
//!                              ├─ accept → serve_connection (at most one)
//!                              ├─ health tick → socket file still there?
//!                              └─ shutdown signal
//! ```
//!
//! The socket file's existence is the ground truth of "a server is
//! reachable here". Startup negotiates with a previous instance over the
//! data channel (the stop sentinel) instead of evicting it; a stale file
//! left by a crashed process is removed outright. While listening idle,
//! a periodic check detects external removal of the file and rebinds.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Settings;
use crate::connection::{self, Outcome, PinPrompt, STOP_SENTINEL};

/// How long a fresh instance waits for a live predecessor to release the
/// socket path after being asked to stop.
pub const DEFAULT_HANDOVER_WAIT: Duration = Duration::from_secs(1);

/// How often the listener verifies the socket file still exists on disk.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Backoff after a transport-level accept error.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Listener configuration.
///
/// Timings default to the production values; tests shorten them.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path of the Unix domain socket to own.
    pub socket_path: PathBuf,
    /// Wait after a handover request before giving up on the predecessor.
    pub handover_wait: Duration,
    /// Interval of the socket-file existence check while idle.
    pub health_check_interval: Duration,
}

impl ServerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handover_wait: DEFAULT_HANDOVER_WAIT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
        }
    }

    #[must_use]
    pub const fn with_handover_wait(mut self, wait: Duration) -> Self {
        self.handover_wait = wait;
        self
    }

    #[must_use]
    pub const fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }
}

/// A running pinentry server instance.
///
/// Owns the socket file for its lifetime. Dropping the handle signals
/// shutdown; call [`PinentryServer::stop`] to also wait for the socket
/// file to be removed.
pub struct PinentryServer {
    socket_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PinentryServer {
    /// Claim the socket path (negotiating with any previous instance),
    /// bind, and start serving.
    ///
    /// # Errors
    ///
    /// Fails if a live predecessor refuses to release the path, or if the
    /// bind itself fails (e.g. another process won a race for the path).
    /// The manager stays stopped in that case; there is no automatic
    /// retry.
    pub async fn start(config: ServerConfig, pin_prompt: Arc<dyn PinPrompt>) -> Result<Self> {
        let listener = claim_and_bind(&config).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let socket_path = config.socket_path.clone();
        let task = tokio::spawn(supervise(listener, config, pin_prompt, shutdown_rx));
        Ok(Self {
            socket_path,
            shutdown_tx,
            task: Some(task),
        })
    }

    /// Path this instance is serving on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether the serve task is still alive.
    ///
    /// Becomes `false` after [`stop`](Self::stop), after a handover to a
    /// newer instance, or after an unrecoverable listener error.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the server and wait until the socket file has been removed.
    ///
    /// Idempotent: stopping an already-stopped server is a no-op. Because
    /// this awaits the serve task, a subsequent `start` cannot race the
    /// file removal.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("server task failed: {e}");
            }
        }
    }
}

/// Reconciles desired configuration with the running server.
///
/// Callers invoke [`reconcile`](Supervisor::reconcile) whenever settings
/// may have changed; the supervisor starts, stops, or restarts the
/// underlying [`PinentryServer`] to match.
pub struct Supervisor {
    pin_prompt: Arc<dyn PinPrompt>,
    server: Option<PinentryServer>,
}

impl Supervisor {
    pub fn new(pin_prompt: Arc<dyn PinPrompt>) -> Self {
        Self {
            pin_prompt,
            server: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.server.as_ref().is_some_and(PinentryServer::is_running)
    }

    /// Bring the server in line with `settings`.
    ///
    /// Enabled with a socket path: start if stopped, restart if the path
    /// changed, leave alone otherwise. Disabled or missing path: stop.
    pub async fn reconcile(&mut self, settings: &Settings) -> Result<()> {
        if !settings.enabled {
            if self.server.is_some() {
                log::info!("pinentry disabled, stopping server");
                self.stop().await;
            }
            return Ok(());
        }

        let Some(path) = settings.expanded_socket_path() else {
            if self.server.is_some() {
                self.stop().await;
            }
            log::warn!("pinentry enabled but no socket path configured, staying stopped");
            return Ok(());
        };

        if let Some(server) = &self.server {
            if server.is_running() && server.socket_path() == path {
                return Ok(());
            }
        }

        self.stop().await;
        let server =
            PinentryServer::start(ServerConfig::new(path), Arc::clone(&self.pin_prompt)).await?;
        self.server = Some(server);
        Ok(())
    }

    /// Stop the running server, if any. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop().await;
        }
    }
}

/// Why the serve loop returned.
enum ServeEnd {
    /// Explicit stop via the shutdown signal.
    Shutdown,
    /// A peer sent the stop sentinel (instance handover).
    StopRequested,
    /// The socket file vanished from disk; rebind at the same path.
    SocketFileLost,
}

/// How a single client session ended, from the serve loop's view.
enum ClientEnd {
    Closed,
    StopRequested,
    Shutdown,
}

/// Startup protocol: negotiate the socket path, then bind exclusively.
///
/// If something is listening at the path it is asked to stop via the
/// sentinel and given `handover_wait` to remove its file; a path that
/// outlives the wait aborts startup (never evict a live, responsive
/// peer). A file nothing is listening on is stale and removed.
async fn claim_and_bind(config: &ServerConfig) -> Result<UnixListener> {
    let path = &config.socket_path;

    if path.exists() {
        match UnixStream::connect(path).await {
            Ok(mut stream) => {
                log::info!(
                    "previous instance detected at {}, requesting handover",
                    path.display()
                );
                stream
                    .write_all(format!("{STOP_SENTINEL}\n").as_bytes())
                    .await
                    .with_context(|| {
                        format!("failed to send stop request to {}", path.display())
                    })?;
                // Keep the stream open while waiting so the peer never
                // sees a half-written request.
                tokio::time::sleep(config.handover_wait).await;
                drop(stream);
                if path.exists() {
                    bail!(
                        "socket {} still present after handover request, refusing to evict a live instance",
                        path.display()
                    );
                }
            }
            Err(e) => {
                log::info!(
                    "stale socket file at {} ({e}), removing it",
                    path.display()
                );
                std::fs::remove_file(path)
                    .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
            }
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind {}", path.display()))?;
    log::info!("listening on {}", path.display());
    Ok(listener)
}

/// Outer loop: run the serve loop, clean up the socket file, and either
/// stop or replay the startup protocol depending on why it ended.
async fn supervise(
    listener: UnixListener,
    config: ServerConfig,
    pin_prompt: Arc<dyn PinPrompt>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut listener = Some(listener);
    loop {
        let Some(active) = listener.take() else { break };
        let end = serve(&active, &config, &pin_prompt, &mut shutdown_rx).await;
        // Release the path before unlinking so a pending bind elsewhere
        // cannot observe a listener without a file.
        drop(active);
        remove_socket_file(&config.socket_path);

        match end {
            ServeEnd::Shutdown => break,
            ServeEnd::StopRequested => {
                log::info!("stopped by a newer instance");
                break;
            }
            ServeEnd::SocketFileLost => {
                log::warn!(
                    "socket file lost, restarting listener at {}",
                    config.socket_path.display()
                );
                match claim_and_bind(&config).await {
                    Ok(fresh) => listener = Some(fresh),
                    Err(e) => {
                        log::error!("restart after socket loss failed: {e:#}");
                        break;
                    }
                }
            }
        }
    }
    log::info!("server stopped");
}

/// Accept loop with single-connection semantics and idle health checks.
async fn serve(
    listener: &UnixListener,
    config: &ServerConfig,
    pin_prompt: &Arc<dyn PinPrompt>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ServeEnd {
    let mut health = tokio::time::interval_at(
        tokio::time::Instant::now() + config.health_check_interval,
        config.health_check_interval,
    );
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return ServeEnd::Shutdown,
            _ = health.tick() => {
                if !config.socket_path.exists() {
                    return ServeEnd::SocketFileLost;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    log::info!("client connected");
                    match handle_client(listener, stream, pin_prompt, shutdown_rx).await {
                        ClientEnd::Closed => {
                            log::info!("client disconnected");
                            // The check was suspended for the session;
                            // resume a full interval from now.
                            health.reset();
                        }
                        ClientEnd::StopRequested => return ServeEnd::StopRequested,
                        ClientEnd::Shutdown => return ServeEnd::Shutdown,
                    }
                }
                Err(e) => {
                    log::error!("accept error: {e}");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Run one connection to completion while refusing newcomers.
///
/// The cap is exactly one live session: additional connection attempts
/// are accepted and immediately closed, never handed a handler, so the
/// first session's state cannot be touched.
async fn handle_client(
    listener: &UnixListener,
    stream: UnixStream,
    pin_prompt: &Arc<dyn PinPrompt>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ClientEnd {
    let session = connection::serve_connection(stream, Arc::clone(pin_prompt));
    tokio::pin!(session);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return ClientEnd::Shutdown,
            result = &mut session => {
                return match result {
                    Ok(Outcome::Closed) => ClientEnd::Closed,
                    Ok(Outcome::StopRequested) => ClientEnd::StopRequested,
                    Err(e) => {
                        log::warn!("connection error: {e}");
                        ClientEnd::Closed
                    }
                };
            }
            extra = listener.accept() => match extra {
                Ok((refused, _addr)) => {
                    log::warn!("refusing concurrent connection");
                    drop(refused);
                }
                Err(e) => log::error!("accept error: {e}"),
            }
        }
    }
}

fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::info!("removed socket file {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("failed to remove socket file {}: {e}", path.display()),
    }
}
