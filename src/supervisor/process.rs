//! Spawning and reaping of a single extension process.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::extensions::{ExtensionId, ExtensionManifest};
use crate::ipc::{IpcEndpoint, ENV_AUTH_TOKEN, ENV_EXTENSION_ID, ENV_IPC_ADDRESS};

/// Distinguishes successive processes of the same extension.
pub type Generation = u64;

/// Why the host asked a process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Host shutdown or an explicit stop
    Shutdown,
    /// Misbehaving process (handshake timeout, protocol violation);
    /// handled like a crash
    Fault,
    /// Stopped to be started again
    Reload,
}

#[derive(Debug)]
pub enum ProcessEvent {
    Exited {
        id: ExtensionId,
        generation: Generation,
        status: String,
        /// Set when the exit was requested by the host
        stop: Option<StopReason>,
    },
    HandshakeDeadline {
        id: ExtensionId,
        generation: Generation,
    },
    RestartDue {
        id: ExtensionId,
        generation: Generation,
    },
}

/// Supervisor-side record of a running process.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    pub generation: Generation,
    pub pid: Option<u32>,
    pub started: Instant,
    stop: Option<oneshot::Sender<StopReason>>,
}

impl ProcessHandle {
    /// A process that never started; its exit is reported separately.
    pub fn failed(generation: Generation) -> Self {
        Self {
            generation,
            pid: None,
            started: Instant::now(),
            stop: None,
        }
    }

    /// Ask the watcher to terminate the process. Returns `false` if a stop
    /// was already requested or the process never ran.
    pub fn request_stop(&mut self, reason: StopReason) -> bool {
        match self.stop.take() {
            Some(stop) => stop.send(reason).is_ok(),
            None => false,
        }
    }
}

pub(crate) struct SpawnRequest<'a> {
    pub manifest: &'a ExtensionManifest,
    pub endpoint: &'a IpcEndpoint,
    pub token: &'a str,
    pub generation: Generation,
    pub stop_timeout: Duration,
}

/// Start the process and a watcher task that reports its exit.
pub(crate) fn spawn(
    request: SpawnRequest<'_>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> std::io::Result<ProcessHandle> {
    let manifest = request.manifest;
    let child = Command::new(&manifest.executable)
        .args(&manifest.args)
        .env(ENV_IPC_ADDRESS, request.endpoint.address())
        .env(ENV_AUTH_TOKEN, request.token)
        .env(ENV_EXTENSION_ID, &manifest.id)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let pid = child.id();
    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(watch(
        manifest.id.clone(),
        request.generation,
        child,
        stop_rx,
        request.stop_timeout,
        events,
    ));

    tracing::info!(extension = %manifest.id, pid, generation = request.generation, "Spawned extension");
    Ok(ProcessHandle {
        generation: request.generation,
        pid,
        started: Instant::now(),
        stop: Some(stop_tx),
    })
}

async fn watch(
    id: ExtensionId,
    generation: Generation,
    mut child: Child,
    mut stop_rx: oneshot::Receiver<StopReason>,
    stop_timeout: Duration,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let (status, stop) = tokio::select! {
        status = child.wait() => (status, None),
        reason = &mut stop_rx => {
            // A dropped handle means the supervisor is gone
            let reason = reason.unwrap_or(StopReason::Shutdown);
            let status = match reason {
                StopReason::Fault => kill(&mut child).await,
                _ => terminate(&mut child, stop_timeout).await,
            };
            (status, Some(reason))
        }
    };

    let status = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {}", e),
    };
    tracing::debug!(extension = %id, generation, %status, "Extension process exited");

    let _ = events.send(ProcessEvent::Exited {
        id,
        generation,
        status,
        stop,
    });
}

/// Graceful termination: SIGTERM, then SIGKILL after `grace`.
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if send_sigterm(child) {
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
    }
    kill(child).await
}

async fn kill(child: &mut Child) -> std::io::Result<ExitStatus> {
    if let Err(e) = child.start_kill() {
        tracing::debug!("Kill failed: {}", e);
    }
    child.wait().await
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    match child.id() {
        // SAFETY: signalling our own child, which has not been reaped yet
        Some(pid) => unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}
