//! The broker: a singleton server owning the analyzer subprocess, the
//! listening socket, and the subscriber set. It fans the analyzer's raw
//! output out to every subscriber and honors a single inbound command,
//! `CMD:RELOAD`. Once the last subscriber disconnects the broker shuts
//! itself down, so it lives exactly as long as someone is watching.

use std::collections::HashMap;
use std::io;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use cavabar_core::ipc::RELOAD_COMMAND;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{
    unix::OwnedWriteHalf,
    UnixListener, UnixStream,
};
use tokio::process::ChildStdout;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::analyzer::{Analyzer, AnalyzerSettings};
use crate::registry::{self, RuntimePaths};

const SUBSCRIBER_QUEUE: usize = 64;
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const REAP_INTERVAL: Duration = Duration::from_millis(250);
const EMPTY_LINGER: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("a broker already owns the socket")]
    AlreadyRunning,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Run a broker to completion. Returns once the last subscriber is gone or a
/// termination signal arrived; artifacts this process owns are removed on
/// the way out, whatever the exit path.
pub async fn run(paths: RuntimePaths, settings: AnalyzerSettings) -> Result<(), BrokerError> {
    if registry::broker_alive(&paths).await {
        return Err(BrokerError::AlreadyRunning);
    }

    let listener = bind_socket(&paths)?;
    registry::write_pid_file(&paths)?;

    let result = serve(&paths, listener, settings).await;
    registry::cleanup_artifacts(&paths);
    result
}

/// Bind the listening socket. Address-in-use means another broker won the
/// race; a missing parent directory gets created and the bind retried once.
fn bind_socket(paths: &RuntimePaths) -> Result<UnixListener, BrokerError> {
    if let Some(dir) = paths.runtime_dir() {
        std::fs::create_dir_all(dir)?;
    }
    match UnixListener::bind(&paths.socket) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => Err(BrokerError::AlreadyRunning),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if let Some(dir) = paths.runtime_dir() {
                std::fs::create_dir_all(dir)?;
            }
            match UnixListener::bind(&paths.socket) {
                Ok(listener) => Ok(listener),
                Err(retry) if retry.kind() == io::ErrorKind::AddrInUse => {
                    Err(BrokerError::AlreadyRunning)
                }
                Err(retry) => Err(retry.into()),
            }
        }
        Err(err) => Err(err.into()),
    }
}

async fn serve(
    paths: &RuntimePaths,
    listener: UnixListener,
    settings: AnalyzerSettings,
) -> Result<(), BrokerError> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let (mut analyzer, stdout_rx) = Analyzer::new(settings, paths.analyzer_conf.clone());
    // A missing analyzer binary is fatal only here, at first start.
    analyzer.start().await?;

    let hub = Arc::new(BrokerHub::new(analyzer, shutdown_tx));
    hub.clone().spawn_signal_watcher(shutdown_rx.clone());
    hub.clone().spawn_broadcaster(stdout_rx, shutdown_rx.clone());
    hub.clone().spawn_reaper(shutdown_rx.clone());

    info!(
        event = "broker_start",
        socket = %paths.socket.display(),
        pid = std::process::id(),
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let hub = hub.clone();
                        tokio::spawn(async move {
                            hub.handle_connection(stream).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "accept_error", error = %err);
                    }
                }
            }
        }
    }

    hub.shutdown_analyzer().await;
    drop(listener);
    info!(event = "broker_stop");
    Ok(())
}

/// All broker state shared across the concurrent loops: the lock-guarded
/// subscriber set, the analyzer handle, and the shutdown flag.
struct BrokerHub {
    conn_counter: AtomicU64,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<Vec<u8>>>>,
    analyzer: Mutex<Analyzer>,
    /// Latched on the first registration; guards the emptiness sweep so the
    /// broker cannot exit before any client ever connected.
    ever_subscribed: AtomicBool,
    analyzer_stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl BrokerHub {
    fn new(analyzer: Analyzer, shutdown: watch::Sender<bool>) -> Self {
        Self {
            conn_counter: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
            analyzer: Mutex::new(analyzer),
            ever_subscribed: AtomicBool::new(false),
            analyzer_stopped: AtomicBool::new(false),
            shutdown,
        }
    }

    fn next_conn_id(&self) -> u64 {
        self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn register(&self, conn_id: u64, sender: mpsc::Sender<Vec<u8>>) {
        self.subscribers.write().await.insert(conn_id, sender);
        self.ever_subscribed.store(true, Ordering::SeqCst);
        info!(event = "subscriber_connected", conn_id);
    }

    async fn unregister(&self, conn_id: u64) {
        if self.subscribers.write().await.remove(&conn_id).is_some() {
            info!(event = "subscriber_disconnected", conn_id);
        }
    }

    /// Periodic sweep deciding when the broker has no reason to live. The
    /// subscriber set must stay empty for a full linger window before the
    /// sweep commits, so a liveness probe's connect-and-close never takes
    /// the broker down while the real client is still on its way.
    fn spawn_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            let mut empty_since: Option<Instant> = None;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        if !self.ever_subscribed.load(Ordering::SeqCst) {
                            continue;
                        }
                        if self.subscribers.read().await.is_empty() {
                            let since = *empty_since.get_or_insert_with(Instant::now);
                            if since.elapsed() >= EMPTY_LINGER {
                                info!(event = "last_subscriber_gone");
                                self.begin_shutdown();
                                return;
                            }
                        } else {
                            empty_since = None;
                        }
                    }
                }
            }
        });
    }

    /// Send one raw line to a point-in-time view of the subscriber set.
    /// Failed or backed-up subscribers are pruned in the same pass.
    async fn broadcast(&self, frame: &[u8]) {
        let targets: Vec<(u64, mpsc::Sender<Vec<u8>>)> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .map(|(conn_id, sender)| (*conn_id, sender.clone()))
                .collect()
        };

        let mut dropped = Vec::new();
        for (conn_id, sender) in targets {
            match sender.try_send(frame.to_vec()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(conn_id),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event = "slow_subscriber", conn_id);
                    dropped.push(conn_id);
                }
            }
        }
        for conn_id in dropped {
            self.unregister(conn_id).await;
        }
    }

    async fn reload_analyzer(&self) {
        info!(event = "reload_requested");
        let mut analyzer = self.analyzer.lock().await;
        analyzer.restart().await;
    }

    async fn shutdown_analyzer(&self) {
        if self.analyzer_stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut analyzer = self.analyzer.lock().await;
        analyzer.stop().await;
    }

    fn spawn_signal_watcher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(event = "signal_install_error", error = %err);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!(event = "signal_shutdown", signal = "SIGINT");
                    self.begin_shutdown();
                }
                _ = term.recv() => {
                    info!(event = "signal_shutdown", signal = "SIGTERM");
                    self.begin_shutdown();
                }
                changed = shutdown.changed() => {
                    let _ = changed;
                }
            }
        });
    }

    /// Single reader task. Each analyzer (re)start delivers a fresh stdout
    /// pipe on `stdout_rx`; the old pipe simply hits EOF when the previous
    /// process is stopped, so a reload never races an in-flight read.
    fn spawn_broadcaster(
        self: Arc<Self>,
        mut stdout_rx: mpsc::UnboundedReceiver<ChildStdout>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            loop {
                let stdout = tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_ok() && *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    next = stdout_rx.recv() => match next {
                        Some(stdout) => stdout,
                        None => break,
                    },
                };

                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_ok() && *shutdown.borrow() {
                                return;
                            }
                        }
                        line = lines.next_line() => {
                            match line {
                                Ok(Some(line)) => {
                                    if line.trim().is_empty() {
                                        continue;
                                    }
                                    let mut frame = line.into_bytes();
                                    frame.push(b'\n');
                                    self.broadcast(&frame).await;
                                }
                                // Feed closed; wait for the next relaunch.
                                Ok(None) => break,
                                Err(err) => {
                                    warn!(event = "analyzer_read_error", error = %err);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    /// One task per accepted connection: register it for broadcasts, then
    /// listen for command lines until EOF or shutdown. Broadcast-only
    /// clients never write, so this usually just waits for their EOF.
    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let conn_id = self.next_conn_id();
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Vec<u8>>(SUBSCRIBER_QUEUE);
        let writer_task = tokio::spawn(writer_loop(conn_id, write_half, rx));
        self.register(conn_id, tx.clone()).await;

        let mut shutdown = self.shutdown.subscribe();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        while !*shutdown.borrow() {
            line.clear();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                read = reader.read_line(&mut line) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        if line.trim() == RELOAD_COMMAND {
                            self.reload_analyzer().await;
                        } else {
                            debug!(event = "ignored_command", conn_id, raw = %line.trim());
                        }
                    }
                    Err(err) => {
                        debug!(event = "command_read_error", conn_id, error = %err);
                        break;
                    }
                }
            }
        }

        self.unregister(conn_id).await;
        drop(tx);
        let _ = writer_task.await;
    }
}

async fn writer_loop(conn_id: u64, mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(WRITE_TIMEOUT, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(event = "subscriber_write_error", conn_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "subscriber_write_timeout", conn_id);
                break;
            }
        }
    }
}
