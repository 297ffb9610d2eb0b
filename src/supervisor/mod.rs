//! Extension process supervision.
//!
//! The supervisor owns every extension process and drives the registry's
//! lifecycle states as processes start, crash and stop. It never blocks:
//! exits, handshake deadlines and restart timers arrive as
//! [`ProcessEvent`]s on the host control loop.
//!
//! ```text
//!   run_all ──► Starting ──handshake──► Connected
//!                  │                        │
//!                  └──────── exit ──────────┤
//!                                           ▼
//!              Starting ◄── backoff ── Crashed ──cap──► Disabled
//! ```

mod policy;
mod process;

pub use policy::{CrashHistory, RestartPolicy, RestartVerdict};
pub use process::{Generation, ProcessEvent, StopReason};

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::SupervisorConfig;
use crate::error::{OrbitError, OrbitResult};
use crate::extensions::{ConnectionState, ExtensionError, ExtensionId, ExtensionRegistry};
use crate::ipc::{IpcEndpoint, IpcServer};

use process::{ProcessHandle, SpawnRequest};

/// What an exit event amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The event belongs to an older process and was ignored.
    Stale,
    /// Stopped on request.
    Stopped(StopReason),
    /// Crashed; a restart is scheduled.
    RestartScheduled { attempt: u32, delay: Duration },
    /// Crashed too often and is now disabled.
    Disabled { crashes: u32 },
}

pub struct ProcessSupervisor {
    policy: RestartPolicy,
    handshake_timeout: Duration,
    stop_timeout: Duration,
    events: mpsc::UnboundedSender<ProcessEvent>,
    /// Set by `run_all`; nothing spawns before the server is bound
    endpoint: Option<IpcEndpoint>,
    processes: HashMap<ExtensionId, ProcessHandle>,
    histories: HashMap<ExtensionId, CrashHistory>,
    /// Pending restart timers, by the generation they were armed for
    restarts: HashMap<ExtensionId, Generation>,
    next_generation: Generation,
}

impl ProcessSupervisor {
    pub fn new(
        config: &SupervisorConfig,
        handshake_timeout: Duration,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Self {
        Self {
            policy: RestartPolicy::from_config(config),
            handshake_timeout,
            stop_timeout: config.stop_timeout(),
            events,
            endpoint: None,
            processes: HashMap::new(),
            histories: HashMap::new(),
            restarts: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.processes.contains_key(id)
    }

    pub fn pid(&self, id: &str) -> Option<u32> {
        self.processes.get(id).and_then(|handle| handle.pid)
    }

    pub fn restart_pending(&self, id: &str) -> bool {
        self.restarts.contains_key(id)
    }

    /// Spawn a process for every extension that is not disabled, in
    /// declaration order. Returns how many were started.
    pub fn run_all(
        &mut self,
        endpoint: &IpcEndpoint,
        registry: &mut ExtensionRegistry,
        server: &mut IpcServer,
    ) -> usize {
        self.endpoint = Some(endpoint.clone());

        let ids: Vec<ExtensionId> = registry.ids().to_vec();
        let mut started = 0;
        for id in ids {
            if registry.state(&id) == Some(ConnectionState::Disabled) {
                continue;
            }
            match self.start(&id, registry, server) {
                Ok(_) => started += 1,
                Err(e) => tracing::warn!(extension = %id, "Not started: {}", e),
            }
        }
        tracing::info!("Started {} of {} extensions", started, registry.len());
        started
    }

    /// Spawn a process for `id`, which must be `Stopped` or `Crashed`.
    ///
    /// A spawn failure is reported as an exit event and handled like any
    /// other crash.
    pub fn start(
        &mut self,
        id: &str,
        registry: &mut ExtensionRegistry,
        server: &mut IpcServer,
    ) -> OrbitResult<Generation> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| ExtensionError::SpawnFailed {
                extension: id.to_string(),
                message: "IPC server is not ready".to_string(),
            })?;
        if self.processes.contains_key(id) {
            return Err(ExtensionError::SpawnFailed {
                extension: id.to_string(),
                message: "already running".to_string(),
            }
            .into());
        }

        registry.transition(id, ConnectionState::Starting)?;
        self.restarts.remove(id);
        self.next_generation += 1;
        let generation = self.next_generation;
        let token = server.issue_token(id);

        let manifest = registry
            .manifest(id)
            .ok_or_else(|| ExtensionError::ExtensionNotFound(id.to_string()))?;
        let request = SpawnRequest {
            manifest,
            endpoint: &endpoint,
            token: &token,
            generation,
            stop_timeout: self.stop_timeout,
        };

        match process::spawn(request, self.events.clone()) {
            Ok(handle) => {
                self.processes.insert(id.to_string(), handle);
                self.arm_handshake_deadline(id, generation);
            }
            Err(e) => {
                let err = ExtensionError::SpawnFailed {
                    extension: id.to_string(),
                    message: e.to_string(),
                };
                tracing::error!(extension = %id, "{}", err);
                server.revoke_token(id);
                self.processes
                    .insert(id.to_string(), ProcessHandle::failed(generation));
                let _ = self.events.send(ProcessEvent::Exited {
                    id: id.to_string(),
                    generation,
                    status: err.to_string(),
                    stop: None,
                });
            }
        }

        Ok(generation)
    }

    /// Ask the process of `id` to stop. A crashed extension waiting for its
    /// restart is stopped on the spot.
    pub fn stop(&mut self, id: &str, reason: StopReason, registry: &mut ExtensionRegistry) -> bool {
        if let Some(handle) = self.processes.get_mut(id) {
            tracing::debug!(extension = %id, ?reason, "Stopping extension");
            return handle.request_stop(reason);
        }

        if self.restarts.remove(id).is_some() {
            if let Err(e) = registry.transition(id, ConnectionState::Stopped) {
                tracing::debug!("{}", e);
            }
            return true;
        }
        false
    }

    /// Stop every process. Returns the number of stop requests sent.
    pub fn stop_all(&mut self, reason: StopReason, registry: &mut ExtensionRegistry) -> usize {
        let ids: Vec<ExtensionId> = self
            .processes
            .keys()
            .chain(self.restarts.keys())
            .cloned()
            .collect();
        ids.iter()
            .filter(|id| self.stop(id, reason, registry))
            .count()
    }

    /// Number of processes whose exit has not been reported yet.
    pub fn running(&self) -> usize {
        self.processes.len()
    }

    /// Apply an exit event.
    pub fn on_exit(
        &mut self,
        id: &str,
        generation: Generation,
        status: &str,
        stop: Option<StopReason>,
        registry: &mut ExtensionRegistry,
    ) -> ExitOutcome {
        match self.processes.get(id) {
            Some(handle) if handle.generation == generation => {}
            _ => return ExitOutcome::Stale,
        }
        let Some(handle) = self.processes.remove(id) else {
            return ExitOutcome::Stale;
        };

        match stop {
            Some(StopReason::Fault) | None => {
                let err = OrbitError::Crash {
                    extension: id.to_string(),
                    status: status.to_string(),
                };
                tracing::warn!(extension = %id, "{}", err);
                self.crashed(id, handle.started.elapsed(), registry)
            }
            Some(reason) => {
                if registry.contains(id) {
                    if let Err(e) = registry.transition(id, ConnectionState::Stopped) {
                        tracing::debug!("{}", e);
                    }
                }
                tracing::info!(extension = %id, ?reason, "Extension stopped");
                ExitOutcome::Stopped(reason)
            }
        }
    }

    fn crashed(
        &mut self,
        id: &str,
        uptime: Duration,
        registry: &mut ExtensionRegistry,
    ) -> ExitOutcome {
        if let Err(e) = registry.transition(id, ConnectionState::Crashed) {
            tracing::debug!("{}", e);
            return ExitOutcome::Stale;
        }

        let verdict = self
            .histories
            .entry(id.to_string())
            .or_default()
            .record(&self.policy, Instant::now(), uptime);

        match verdict {
            RestartVerdict::Restart { attempt, delay } => {
                tracing::info!(
                    extension = %id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling restart"
                );
                self.schedule_restart(id, delay);
                ExitOutcome::RestartScheduled { attempt, delay }
            }
            RestartVerdict::Disable { crashes } => {
                if let Err(e) = registry.transition(id, ConnectionState::Disabled) {
                    tracing::debug!("{}", e);
                }
                tracing::error!(extension = %id, crashes, "Extension disabled after repeated crashes");
                ExitOutcome::Disabled { crashes }
            }
        }
    }

    fn schedule_restart(&mut self, id: &str, delay: Duration) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.restarts.insert(id.to_string(), generation);

        let events = self.events.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ProcessEvent::RestartDue { id, generation });
        });
    }

    fn arm_handshake_deadline(&self, id: &str, generation: Generation) {
        let events = self.events.clone();
        let id = id.to_string();
        let timeout = self.handshake_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(ProcessEvent::HandshakeDeadline { id, generation });
        });
    }

    /// A restart timer fired. Respawns if it is still the pending restart
    /// and the extension is still `Crashed`.
    pub fn on_restart_due(
        &mut self,
        id: &str,
        generation: Generation,
        registry: &mut ExtensionRegistry,
        server: &mut IpcServer,
    ) -> Option<Generation> {
        if self.restarts.get(id) != Some(&generation) {
            return None;
        }
        self.restarts.remove(id);

        if registry.state(id) != Some(ConnectionState::Crashed) {
            return None;
        }
        match self.start(id, registry, server) {
            Ok(generation) => Some(generation),
            Err(e) => {
                tracing::warn!(extension = %id, "Restart failed: {}", e);
                None
            }
        }
    }

    /// The handshake window of a process closed. Kills it if it is still
    /// `Starting`, so the exit is handled as a crash.
    pub fn on_handshake_deadline(
        &mut self,
        id: &str,
        generation: Generation,
        registry: &ExtensionRegistry,
    ) -> Option<OrbitError> {
        let current = self.processes.get(id).map(|handle| handle.generation);
        if current != Some(generation) || registry.state(id) != Some(ConnectionState::Starting) {
            return None;
        }

        let err = OrbitError::Connection {
            extension: id.to_string(),
            timeout_ms: self.handshake_timeout.as_millis() as u64,
        };
        tracing::warn!(extension = %id, "{}", err);
        if let Some(handle) = self.processes.get_mut(id) {
            handle.request_stop(StopReason::Fault);
        }
        Some(err)
    }

    /// Forget crash history, e.g. before re-enabling a disabled extension.
    pub fn reset_history(&mut self, id: &str) {
        self.histories.remove(id);
    }
}
