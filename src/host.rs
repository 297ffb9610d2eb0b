//! The extension host: one control loop owning server, supervisor, registry,
//! router and aggregator.
//!
//! Everything else (connection readers, process watchers, timers) runs in
//! its own task and only posts events here, so none of the state below
//! needs a lock. Consumers talk to the loop through a cloneable
//! [`HostHandle`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::core::{
    CorrelationId, DispatchStream, ProviderId, Query, QueryRouter, ResultAggregator, SessionId,
    DEFAULT_SESSION,
};
use crate::error::{OrbitError, OrbitResult};
use crate::extensions::{
    self, ConnectionState, ExtensionError, ExtensionId, ExtensionManifest, ExtensionRegistry,
    MANIFEST_FILE,
};
use crate::ipc::{
    ConnectionEvent, Envelope, Inbound, IpcEndpoint, IpcServer, LogLevel, QueryTransport,
    ServerNotice,
};
use crate::notify::Notifier;
use crate::services::ShortcutProvider;
use crate::supervisor::{ExitOutcome, ProcessEvent, ProcessSupervisor, StopReason};

/// Extra time granted on shutdown beyond the per-process stop timeout.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

enum HostCommand {
    Query {
        session: SessionId,
        text: String,
        reply: oneshot::Sender<DispatchStream>,
    },
    Reload {
        id: ExtensionId,
        reply: oneshot::Sender<OrbitResult<()>>,
    },
    Stop {
        id: ExtensionId,
        reply: oneshot::Sender<OrbitResult<()>>,
    },
    Rescan {
        reply: oneshot::Sender<OrbitResult<RescanReport>>,
    },
    States {
        reply: oneshot::Sender<Vec<(ExtensionId, ConnectionState)>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Receiving ends of everything the control loop listens to.
struct Inbox {
    commands: mpsc::UnboundedReceiver<HostCommand>,
    connections: mpsc::UnboundedReceiver<ConnectionEvent>,
    processes: mpsc::UnboundedReceiver<ProcessEvent>,
    deadlines: mpsc::UnboundedReceiver<CorrelationId>,
}

/// What a rescan of the extensions directory changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RescanReport {
    /// New extensions, registered and started
    pub added: Vec<ExtensionId>,
    /// Extensions whose directory is gone, stopped and forgotten
    pub removed: Vec<ExtensionId>,
    /// Extensions whose manifest changed; applied on their next start
    pub updated: Vec<ExtensionId>,
}

/// Where manifests are read from when the host was loaded from a directory.
#[derive(Debug, Default)]
struct ManifestSources {
    root: Option<PathBuf>,
    extension_dirs: HashMap<ExtensionId, PathBuf>,
}

pub struct ExtensionHost {
    registry: ExtensionRegistry,
    sources: ManifestSources,
    server: IpcServer,
    supervisor: ProcessSupervisor,
    router: QueryRouter,
    aggregator: ResultAggregator,
    notifier: Arc<dyn Notifier>,
    shutdown_timeout: Duration,
}

impl ExtensionHost {
    /// Load manifests and shortcuts as configured, then start.
    ///
    /// Extensions loaded this way re-read their `manifest.json` on reload,
    /// and [`HostHandle::rescan`] picks up added and removed directories.
    pub async fn load(config: &Config, notifier: Arc<dyn Notifier>) -> OrbitResult<HostHandle> {
        let mut sources = ManifestSources::default();
        let mut manifests = Vec::new();
        if config.extensions.enabled {
            let root = config.extensions.directory_path();
            for (dir, manifest) in extensions::load_all(&root)? {
                sources.extension_dirs.insert(manifest.id.clone(), dir);
                manifests.push(manifest);
            }
            sources.root = Some(root);
        }
        let shortcuts = ShortcutProvider::from_config(config);
        Self::launch(config, manifests, sources, shortcuts, notifier).await
    }

    /// Bind the IPC server, wait until it is ready, spawn every extension and
    /// start the control loop.
    ///
    /// Manifests passed in here have no directory behind them, so reloads
    /// reuse them as they are.
    pub async fn start(
        config: &Config,
        manifests: Vec<ExtensionManifest>,
        shortcuts: Vec<ShortcutProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> OrbitResult<HostHandle> {
        Self::launch(
            config,
            manifests,
            ManifestSources::default(),
            shortcuts,
            notifier,
        )
        .await
    }

    async fn launch(
        config: &Config,
        manifests: Vec<ExtensionManifest>,
        sources: ManifestSources,
        shortcuts: Vec<ShortcutProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> OrbitResult<HostHandle> {
        let mut registry = ExtensionRegistry::from_manifests(manifests)?;

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (connection_tx, connections) = mpsc::unbounded_channel();
        let (process_tx, processes) = mpsc::unbounded_channel();
        let (deadline_tx, deadlines) = mpsc::unbounded_channel();

        let (mut server, ready) = IpcServer::start(&config.ipc, connection_tx);
        let endpoint = ready.wait().await?;

        let mut supervisor = ProcessSupervisor::new(
            &config.supervisor,
            config.ipc.handshake_timeout(),
            process_tx,
        );
        supervisor.run_all(&endpoint, &mut registry, &mut server);

        let host = Self {
            registry,
            sources,
            server,
            supervisor,
            router: QueryRouter::new(shortcuts, config.dispatch.deadline(), deadline_tx),
            aggregator: ResultAggregator::new(config.dispatch.max_results),
            notifier,
            shutdown_timeout: config.supervisor.stop_timeout() + SHUTDOWN_SLACK,
        };
        let inbox = Inbox {
            commands,
            connections,
            processes,
            deadlines,
        };
        tokio::spawn(host.run(inbox));

        Ok(HostHandle {
            commands: command_tx,
            endpoint,
        })
    }

    async fn run(mut self, mut inbox: Inbox) {
        loop {
            tokio::select! {
                command = inbox.commands.recv() => match command {
                    Some(HostCommand::Shutdown { reply }) => {
                        self.shutdown(&mut inbox.processes).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    // Every handle is gone
                    None => {
                        self.shutdown(&mut inbox.processes).await;
                        break;
                    }
                },
                Some(event) = inbox.connections.recv() => self.on_connection(event),
                Some(event) = inbox.processes.recv() => self.on_process(event),
                Some(correlation_id) = inbox.deadlines.recv() => {
                    self.aggregator.on_deadline(&correlation_id);
                }
            }
        }
        tracing::info!("Extension host stopped");
    }

    fn on_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Query {
                session,
                text,
                reply,
            } => {
                let stream = self.router.dispatch(
                    session,
                    Query::new(&text),
                    &self.registry,
                    &mut self.server,
                    &mut self.aggregator,
                );
                let _ = reply.send(stream);
            }
            HostCommand::Reload { id, reply } => {
                let _ = reply.send(self.reload(&id));
            }
            HostCommand::Stop { id, reply } => {
                let _ = reply.send(self.stop_extension(&id));
            }
            HostCommand::Rescan { reply } => {
                let _ = reply.send(self.rescan());
            }
            HostCommand::States { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            HostCommand::Shutdown { .. } => {}
        }
    }

    fn reload(&mut self, id: &str) -> OrbitResult<()> {
        let state = self
            .registry
            .state(id)
            .ok_or_else(|| ExtensionError::ExtensionNotFound(id.to_string()))?;
        // A broken manifest on disk leaves the running extension alone
        self.refresh_manifest(id)?;

        match state {
            ConnectionState::Starting | ConnectionState::Connected => {
                // Started again once the exit comes in
                let _ = self.server.send(id, Envelope::shutdown(id));
                self.supervisor.stop(id, StopReason::Reload, &mut self.registry);
            }
            ConnectionState::Crashed | ConnectionState::Stopped | ConnectionState::Disabled => {
                // Cancels a pending restart
                self.supervisor.stop(id, StopReason::Shutdown, &mut self.registry);
                self.registry.reenable(id)?;
                self.supervisor.reset_history(id);
                self.supervisor.start(id, &mut self.registry, &mut self.server)?;
            }
        }
        tracing::info!(extension = %id, "Reloading extension");
        Ok(())
    }

    /// Re-read the manifest of `id` from its directory, if it has one.
    fn refresh_manifest(&mut self, id: &str) -> OrbitResult<()> {
        let Some(dir) = self.sources.extension_dirs.get(id) else {
            return Ok(());
        };
        let manifest = ExtensionManifest::load(dir)?;
        if manifest.id != id {
            return Err(ExtensionError::ManifestInvalid {
                path: dir.join(MANIFEST_FILE),
                message: format!("id changed from '{}' to '{}'", id, manifest.id),
            }
            .into());
        }
        self.registry.replace_manifest(manifest)?;
        Ok(())
    }

    /// Bring the registry in line with the extensions directory.
    fn rescan(&mut self) -> OrbitResult<RescanReport> {
        let Some(root) = self.sources.root.clone() else {
            return Err(OrbitError::Config(
                "extensions were not loaded from a directory".to_string(),
            ));
        };
        let found = extensions::load_all(&root)?;
        let mut report = RescanReport::default();

        let vanished: Vec<ExtensionId> = self
            .registry
            .ids()
            .iter()
            .filter(|id| self.sources.extension_dirs.contains_key(*id))
            .filter(|id| !found.iter().any(|(_, manifest)| &manifest.id == *id))
            .cloned()
            .collect();
        for id in vanished {
            let _ = self.server.send(&id, Envelope::shutdown(&id));
            self.supervisor
                .stop(&id, StopReason::Shutdown, &mut self.registry);
            self.supervisor.reset_history(&id);
            self.aggregator
                .abandon_provider(&ProviderId::Extension(id.clone()));
            self.registry.remove(&id);
            self.sources.extension_dirs.remove(&id);
            tracing::info!(extension = %id, "Extension removed");
            report.removed.push(id);
        }

        for (dir, manifest) in found {
            let id = manifest.id.clone();
            if !self.registry.contains(&id) {
                self.registry.insert(manifest)?;
                self.sources.extension_dirs.insert(id.clone(), dir);
                if let Err(e) = self
                    .supervisor
                    .start(&id, &mut self.registry, &mut self.server)
                {
                    tracing::warn!(extension = %id, "Not started: {}", e);
                }
                tracing::info!(extension = %id, "Extension added");
                report.added.push(id);
            } else if self.registry.manifest(&id) != Some(&manifest) {
                self.registry.replace_manifest(manifest)?;
                self.sources.extension_dirs.insert(id.clone(), dir);
                report.updated.push(id);
            }
        }

        tracing::info!(
            added = report.added.len(),
            removed = report.removed.len(),
            updated = report.updated.len(),
            "Rescanned extensions"
        );
        Ok(report)
    }

    fn stop_extension(&mut self, id: &str) -> OrbitResult<()> {
        if !self.registry.contains(id) {
            return Err(ExtensionError::ExtensionNotFound(id.to_string()).into());
        }
        let _ = self.server.send(id, Envelope::shutdown(id));
        self.supervisor.stop(id, StopReason::Shutdown, &mut self.registry);
        Ok(())
    }

    fn on_connection(&mut self, event: ConnectionEvent) {
        let Some(notice) = self.server.handle(event) else {
            return;
        };

        match notice {
            ServerNotice::Connected(id) => {
                if let Err(e) = self.registry.transition(&id, ConnectionState::Connected) {
                    tracing::warn!(extension = %id, "Rejecting connection: {}", e);
                    self.server.disconnect(&id);
                }
            }
            ServerNotice::Disconnected(id) => {
                self.aggregator
                    .abandon_provider(&ProviderId::Extension(id.clone()));
                // Hung up but still running; treat it as broken
                if self.registry.state(&id) == Some(ConnectionState::Connected) {
                    self.supervisor
                        .stop(&id, StopReason::Fault, &mut self.registry);
                }
            }
            ServerNotice::Message(id, inbound) => self.on_message(id, inbound),
            ServerNotice::ProtocolViolation(id, _) => {
                self.aggregator
                    .abandon_provider(&ProviderId::Extension(id.clone()));
                self.supervisor
                    .stop(&id, StopReason::Fault, &mut self.registry);
            }
        }
    }

    fn on_message(&mut self, id: ExtensionId, inbound: Inbound) {
        match inbound {
            Inbound::QueryResult {
                correlation_id,
                items,
            } => {
                self.aggregator
                    .accept(&correlation_id, &ProviderId::Extension(id), items);
            }
            Inbound::Error {
                correlation_id,
                message,
            } => {
                tracing::warn!(extension = %id, correlation_id = ?correlation_id.as_ref().map(CorrelationId::as_str), "Extension error: {}", message);
                if let Some(correlation_id) = correlation_id {
                    self.aggregator
                        .provider_failed(&correlation_id, &ProviderId::Extension(id));
                }
            }
            Inbound::RegisterManifest { name, triggers } => {
                let updated = self
                    .registry
                    .manifest(&id)
                    .ok_or_else(|| ExtensionError::ExtensionNotFound(id.clone()))
                    .and_then(|manifest| manifest.with_announced(name, triggers))
                    .and_then(|manifest| self.registry.replace_manifest(manifest));
                match updated {
                    Ok(_) => tracing::info!(extension = %id, "Manifest updated by extension"),
                    Err(e) => tracing::warn!(extension = %id, "Ignoring manifest update: {}", e),
                }
            }
            Inbound::Log { level, message } => emit_log(&id, level, &message),
        }
    }

    fn on_process(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Exited {
                id,
                generation,
                status,
                stop,
            } => {
                let outcome =
                    self.supervisor
                        .on_exit(&id, generation, &status, stop, &mut self.registry);
                if outcome == ExitOutcome::Stale {
                    return;
                }

                self.server.disconnect(&id);
                self.server.revoke_token(&id);
                self.aggregator
                    .abandon_provider(&ProviderId::Extension(id.clone()));

                match outcome {
                    ExitOutcome::Disabled { crashes } => self.notify_disabled(&id, crashes),
                    ExitOutcome::Stopped(StopReason::Reload) => {
                        if let Err(e) =
                            self.supervisor
                                .start(&id, &mut self.registry, &mut self.server)
                        {
                            tracing::warn!(extension = %id, "Reload failed: {}", e);
                        }
                    }
                    _ => {}
                }
            }
            ProcessEvent::HandshakeDeadline { id, generation } => {
                self.supervisor
                    .on_handshake_deadline(&id, generation, &self.registry);
            }
            ProcessEvent::RestartDue { id, generation } => {
                self.supervisor
                    .on_restart_due(&id, generation, &mut self.registry, &mut self.server);
            }
        }
    }

    fn notify_disabled(&self, id: &str, crashes: u32) {
        let name = self
            .registry
            .manifest(id)
            .map_or(id, |manifest| manifest.name.as_str());
        let body = format!(
            "{} crashed {} times and has been disabled. Reload it to try again.",
            name, crashes
        );
        if let Err(e) = self.notifier.show_notification("Extension disabled", &body) {
            tracing::warn!("Failed to show notification: {}", e);
        }
    }

    /// Stop every extension and wait (bounded) for the processes to exit.
    async fn shutdown(&mut self, processes: &mut mpsc::UnboundedReceiver<ProcessEvent>) {
        tracing::info!("Shutting down extension host");
        self.aggregator.clear();

        for id in self.registry.ids().to_vec() {
            if self.server.is_connected(&id) {
                let _ = self.server.send(&id, Envelope::shutdown(&id));
            }
        }
        self.supervisor
            .stop_all(StopReason::Shutdown, &mut self.registry);

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        while self.supervisor.running() > 0 {
            match tokio::time::timeout_at(deadline, processes.recv()).await {
                Ok(Some(ProcessEvent::Exited {
                    id,
                    generation,
                    status,
                    stop,
                })) => {
                    self.supervisor
                        .on_exit(&id, generation, &status, stop, &mut self.registry);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    tracing::warn!(
                        "{} extensions did not exit in time",
                        self.supervisor.running()
                    );
                    break;
                }
            }
        }

        self.server.close();
    }
}

fn emit_log(id: &str, level: LogLevel, message: &str) {
    match level {
        LogLevel::Error => tracing::error!(extension = %id, "{}", message),
        LogLevel::Warn => tracing::warn!(extension = %id, "{}", message),
        LogLevel::Info => tracing::info!(extension = %id, "{}", message),
        LogLevel::Debug => tracing::debug!(extension = %id, "{}", message),
        LogLevel::Trace => tracing::trace!(extension = %id, "{}", message),
    }
}

/// Cloneable handle to a running [`ExtensionHost`].
#[derive(Clone)]
pub struct HostHandle {
    commands: mpsc::UnboundedSender<HostCommand>,
    endpoint: IpcEndpoint,
}

impl HostHandle {
    pub fn endpoint(&self) -> &IpcEndpoint {
        &self.endpoint
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> HostCommand,
    ) -> OrbitResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| OrbitError::HostStopped)?;
        response.await.map_err(|_| OrbitError::HostStopped)
    }

    /// Dispatch `text` in the default session.
    pub async fn dispatch_query(&self, text: &str) -> OrbitResult<DispatchStream> {
        self.dispatch_query_in(DEFAULT_SESSION, text).await
    }

    /// Dispatch `text` in `session`, superseding that session's previous
    /// dispatch.
    pub async fn dispatch_query_in(
        &self,
        session: SessionId,
        text: &str,
    ) -> OrbitResult<DispatchStream> {
        let text = text.to_string();
        self.request(|reply| HostCommand::Query {
            session,
            text,
            reply,
        })
        .await
    }

    /// Restart an extension, re-reading its manifest from disk when it was
    /// loaded from the extensions directory. Also the only way out of
    /// `Disabled`.
    pub async fn reload(&self, id: &str) -> OrbitResult<()> {
        let id = id.to_string();
        self.request(|reply| HostCommand::Reload { id, reply }).await?
    }

    /// Re-read the extensions directory: start new extensions, stop and
    /// forget removed ones, and take up changed manifests.
    pub async fn rescan(&self) -> OrbitResult<RescanReport> {
        self.request(|reply| HostCommand::Rescan { reply }).await?
    }

    pub async fn stop_extension(&self, id: &str) -> OrbitResult<()> {
        let id = id.to_string();
        self.request(|reply| HostCommand::Stop { id, reply }).await?
    }

    /// Connection state of every extension, in declaration order.
    pub async fn states(&self) -> OrbitResult<Vec<(ExtensionId, ConnectionState)>> {
        self.request(|reply| HostCommand::States { reply }).await
    }

    pub async fn state(&self, id: &str) -> OrbitResult<Option<ConnectionState>> {
        Ok(self
            .states()
            .await?
            .into_iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, state)| state))
    }

    /// Stop every extension and the control loop.
    pub async fn shutdown(&self) -> OrbitResult<()> {
        self.request(|reply| HostCommand::Shutdown { reply }).await
    }
}
