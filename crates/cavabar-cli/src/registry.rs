//! Liveness registry: on-disk artifacts (socket path, pid marker) used to
//! detect a running broker and to reclaim leftovers from a crashed one.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cavabar_core::ipc;
use tokio::net::UnixStream;
use tracing::debug;

const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Locations of the broker's runtime artifacts.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub socket: PathBuf,
    pub pid_file: PathBuf,
    pub analyzer_conf: PathBuf,
}

impl RuntimePaths {
    /// Artifacts live under `$XDG_RUNTIME_DIR/cavabar/`, falling back to the
    /// conventional `/run/user/<uid>` location.
    pub fn resolve() -> Self {
        let base = std::env::var("XDG_RUNTIME_DIR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/run/user/{}", unsafe { libc::getuid() })));
        Self::under(base.join(ipc::RUNTIME_SUBDIR))
    }

    pub fn under(dir: PathBuf) -> Self {
        Self {
            socket: dir.join(ipc::SOCKET_FILE),
            pid_file: dir.join(ipc::PID_FILE),
            analyzer_conf: dir.join(ipc::ANALYZER_CONF_FILE),
        }
    }

    pub fn runtime_dir(&self) -> Option<&Path> {
        self.socket.parent()
    }
}

/// Two-tier liveness check. Prefers socket reachability; falls back to the
/// pid marker. Stale artifacts found along the way are deleted. Never fails:
/// malformed pid contents and missing files resolve to `false`.
pub async fn broker_alive(paths: &RuntimePaths) -> bool {
    if paths.socket.exists() {
        let connect = UnixStream::connect(&paths.socket);
        match tokio::time::timeout(CONNECT_PROBE_TIMEOUT, connect).await {
            Ok(Ok(_stream)) => return true,
            Ok(Err(err)) => {
                debug!(event = "orphan_socket", path = %paths.socket.display(), error = %err);
                let _ = fs::remove_file(&paths.socket);
            }
            Err(_) => {
                debug!(event = "socket_probe_timeout", path = %paths.socket.display());
                let _ = fs::remove_file(&paths.socket);
            }
        }
    }

    if paths.pid_file.exists() {
        match read_pid_file(paths) {
            Some(pid) if pid_alive(pid) => return true,
            _ => {
                debug!(event = "stale_pid_marker", path = %paths.pid_file.display());
                let _ = fs::remove_file(&paths.pid_file);
            }
        }
    }

    false
}

/// Existence probe via `kill(pid, 0)`: delivers no signal, only checks that
/// the process exists.
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

pub fn read_pid_file(paths: &RuntimePaths) -> Option<u32> {
    fs::read_to_string(&paths.pid_file).ok()?.trim().parse().ok()
}

/// Write our own pid as the marker. Called only after the socket bind
/// succeeded, so a readable marker always pairs with a bound socket.
pub fn write_pid_file(paths: &RuntimePaths) -> std::io::Result<()> {
    if let Some(dir) = paths.runtime_dir() {
        fs::create_dir_all(dir)?;
    }
    fs::write(&paths.pid_file, std::process::id().to_string())
}

/// Remove socket and pid marker, but only when this process owns them: the
/// marker matches our pid, or (for the socket) the marker is absent. Safe to
/// call repeatedly; removal failures are swallowed.
pub fn cleanup_artifacts(paths: &RuntimePaths) {
    let own_pid = std::process::id();
    if paths.socket.exists() {
        let owns_socket = match read_pid_file(paths) {
            Some(pid) => pid == own_pid,
            None => !paths.pid_file.exists(),
        };
        if owns_socket {
            let _ = fs::remove_file(&paths.socket);
        }
    }
    if read_pid_file(paths) == Some(own_pid) {
        let _ = fs::remove_file(&paths.pid_file);
    }
}
