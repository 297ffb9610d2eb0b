//! Local socket server for extension connections.
//!
//! The accept loop and the per-connection reader/writer tasks only post
//! [`ConnectionEvent`]s. All connection bookkeeping lives in [`IpcServer`],
//! which is driven from the host control loop through [`IpcServer::handle`].

use std::collections::HashMap;
use std::time::Duration;

use interprocess::local_socket::tokio::{prelude::*, Listener, RecvHalf, SendHalf, Stream};
use interprocess::local_socket::{GenericFilePath, ListenerOptions, ToFsName};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::IpcConfig;
use crate::error::{OrbitError, OrbitResult};
use crate::extensions::ExtensionId;

use super::protocol::{Envelope, Inbound, MessageKind, MAX_MESSAGE_BYTES};
use super::QueryTransport;

pub type ConnectionId = u64;

/// Address of a bound server.
///
/// Only a server that finished binding can produce one, so holding an
/// endpoint proves extensions can connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcEndpoint {
    address: String,
}

impl IpcEndpoint {
    pub(crate) fn new(address: String) -> Self {
        Self { address }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Resolves once the listener is bound.
pub struct ServerReady(oneshot::Receiver<OrbitResult<IpcEndpoint>>);

impl ServerReady {
    pub async fn wait(self) -> OrbitResult<IpcEndpoint> {
        self.0.await.map_err(|_| {
            OrbitError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "IPC server exited before binding",
            ))
        })?
    }
}

/// Raw events from the connection tasks.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A client connected; carries the channels used to talk to it.
    Opened {
        conn: ConnectionId,
        outbound: mpsc::UnboundedSender<Envelope>,
        close: oneshot::Sender<()>,
    },
    Message {
        conn: ConnectionId,
        envelope: Envelope,
    },
    /// Unparseable or oversized line. The connection is closed after this.
    Malformed {
        conn: ConnectionId,
        error: OrbitError,
    },
    Closed {
        conn: ConnectionId,
    },
}

/// What the control loop needs to act on.
#[derive(Debug)]
pub enum ServerNotice {
    Connected(ExtensionId),
    Disconnected(ExtensionId),
    Message(ExtensionId, Inbound),
    /// The extension broke the protocol and has been disconnected.
    ProtocolViolation(ExtensionId, OrbitError),
}

struct Connection {
    /// Set once the handshake succeeds
    extension_id: Option<ExtensionId>,
    outbound: mpsc::UnboundedSender<Envelope>,
    // Dropping this stops the reader
    _close: oneshot::Sender<()>,
}

pub struct IpcServer {
    address: String,
    tokens: HashMap<ExtensionId, String>,
    connections: HashMap<ConnectionId, Connection>,
    by_extension: HashMap<ExtensionId, ConnectionId>,
    accept_task: JoinHandle<()>,
}

impl IpcServer {
    /// Bind the socket and start accepting in the background.
    pub fn start(
        config: &IpcConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> (Self, ServerReady) {
        let address = config.socket_path.clone().unwrap_or_else(default_address);
        let (ready_tx, ready_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(address.clone(), events, ready_tx));

        let server = Self {
            address,
            tokens: HashMap::new(),
            connections: HashMap::new(),
            by_extension: HashMap::new(),
            accept_task,
        };
        (server, ServerReady(ready_rx))
    }

    /// Create a fresh auth token for the next process of `extension_id`,
    /// invalidating any earlier one.
    pub fn issue_token(&mut self, extension_id: &str) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.tokens.insert(extension_id.to_string(), token.clone());
        token
    }

    pub fn revoke_token(&mut self, extension_id: &str) {
        self.tokens.remove(extension_id);
    }

    pub fn is_connected(&self, extension_id: &str) -> bool {
        self.by_extension.contains_key(extension_id)
    }

    /// Apply a connection event.
    pub fn handle(&mut self, event: ConnectionEvent) -> Option<ServerNotice> {
        match event {
            ConnectionEvent::Opened {
                conn,
                outbound,
                close,
            } => {
                tracing::debug!(conn, "Connection opened");
                self.connections.insert(
                    conn,
                    Connection {
                        extension_id: None,
                        outbound,
                        _close: close,
                    },
                );
                None
            }
            ConnectionEvent::Message { conn, envelope } => {
                let extension_id = self.connections.get(&conn)?.extension_id.clone();
                match extension_id {
                    None => self.handshake(conn, envelope),
                    Some(extension_id) => self.inbound(conn, extension_id, envelope),
                }
            }
            ConnectionEvent::Malformed { conn, error } => {
                let connection = self.drop_connection(conn)?;
                match connection.extension_id {
                    Some(extension_id) => {
                        let error = match error {
                            OrbitError::Protocol { message, .. } => {
                                OrbitError::protocol(Some(&extension_id), message)
                            }
                            other => OrbitError::protocol(Some(&extension_id), other.to_string()),
                        };
                        tracing::warn!(extension = %extension_id, "{}", error);
                        Some(ServerNotice::ProtocolViolation(extension_id, error))
                    }
                    None => {
                        tracing::warn!(conn, "Dropping unauthenticated connection: {}", error);
                        None
                    }
                }
            }
            ConnectionEvent::Closed { conn } => {
                let extension_id = self.drop_connection(conn)?.extension_id?;
                tracing::debug!(extension = %extension_id, "Extension disconnected");
                Some(ServerNotice::Disconnected(extension_id))
            }
        }
    }

    fn handshake(&mut self, conn: ConnectionId, envelope: Envelope) -> Option<ServerNotice> {
        let rejection = if envelope.kind != MessageKind::Connect {
            Some(format!("expected Connect, got {:?}", envelope.kind))
        } else if self.tokens.get(&envelope.extension_id).map(String::as_str) != envelope.token()
            || envelope.token().is_none()
        {
            Some(format!("invalid token for '{}'", envelope.extension_id))
        } else if self.by_extension.contains_key(&envelope.extension_id) {
            Some(format!("'{}' is already connected", envelope.extension_id))
        } else {
            None
        };

        if let Some(reason) = rejection {
            tracing::warn!(conn, "{}", OrbitError::protocol(None, reason));
            self.drop_connection(conn);
            return None;
        }

        let extension_id = envelope.extension_id;
        // Tokens are single use
        self.tokens.remove(&extension_id);
        let connection = self.connections.get_mut(&conn)?;
        connection.extension_id = Some(extension_id.clone());
        let _ = connection.outbound.send(Envelope::connect_ack(&extension_id));
        self.by_extension.insert(extension_id.clone(), conn);

        tracing::info!(extension = %extension_id, "Extension connected");
        Some(ServerNotice::Connected(extension_id))
    }

    fn inbound(
        &mut self,
        conn: ConnectionId,
        extension_id: ExtensionId,
        mut envelope: Envelope,
    ) -> Option<ServerNotice> {
        if envelope.extension_id.is_empty() {
            envelope.extension_id = extension_id.clone();
        }
        let parsed = if envelope.extension_id != extension_id {
            Err(format!(
                "message claims to be from '{}'",
                envelope.extension_id
            ))
        } else {
            Inbound::parse(envelope)
        };

        match parsed {
            Ok(message) => Some(ServerNotice::Message(extension_id, message)),
            Err(reason) => {
                let error = OrbitError::protocol(Some(&extension_id), reason);
                tracing::warn!(extension = %extension_id, "{}", error);
                self.drop_connection(conn);
                Some(ServerNotice::ProtocolViolation(extension_id, error))
            }
        }
    }

    /// Close the connection of `extension_id`, if any.
    pub fn disconnect(&mut self, extension_id: &str) -> bool {
        match self.by_extension.get(extension_id).copied() {
            Some(conn) => self.drop_connection(conn).is_some(),
            None => false,
        }
    }

    fn drop_connection(&mut self, conn: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(&conn)?;
        if let Some(extension_id) = &connection.extension_id {
            self.by_extension.remove(extension_id);
        }
        Some(connection)
    }

    /// Stop accepting and drop every connection.
    pub fn close(&mut self) {
        self.accept_task.abort();
        self.connections.clear();
        self.by_extension.clear();
        self.tokens.clear();

        #[cfg(not(target_os = "windows"))]
        {
            let _ = std::fs::remove_file(&self.address);
        }
    }
}

impl QueryTransport for IpcServer {
    fn send(&mut self, extension_id: &str, envelope: Envelope) -> OrbitResult<()> {
        let failed = |reason: &str| OrbitError::SendFailed {
            extension: extension_id.to_string(),
            reason: reason.to_string(),
        };

        let conn = self
            .by_extension
            .get(extension_id)
            .ok_or_else(|| failed("not connected"))?;
        let connection = self
            .connections
            .get(conn)
            .ok_or_else(|| failed("not connected"))?;
        connection
            .outbound
            .send(envelope)
            .map_err(|_| failed("connection closed"))
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Per-process socket address in the runtime directory.
pub fn default_address() -> String {
    let name = format!("orbit-{}.sock", std::process::id());

    #[cfg(target_os = "windows")]
    {
        format!(r"\\.\pipe\{}", name)
    }
    #[cfg(not(target_os = "windows"))]
    {
        dirs::runtime_dir()
            .or_else(dirs::cache_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join(name)
            .to_string_lossy()
            .into_owned()
    }
}

fn bind(address: &str) -> std::io::Result<Listener> {
    // Clean up a stale socket file from an earlier run
    #[cfg(not(target_os = "windows"))]
    {
        let _ = std::fs::remove_file(address);
    }

    let name = address.to_fs_name::<GenericFilePath>()?;
    ListenerOptions::new().name(name).create_tokio()
}

async fn accept_loop(
    address: String,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    ready: oneshot::Sender<OrbitResult<IpcEndpoint>>,
) {
    let listener = match bind(&address) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %address, "Failed to bind IPC socket: {}", e);
            let _ = ready.send(Err(e.into()));
            return;
        }
    };

    tracing::info!(address = %address, "IPC server listening");
    if ready.send(Ok(IpcEndpoint::new(address))).is_err() {
        return;
    }

    let mut next_conn: ConnectionId = 0;
    while !events.is_closed() {
        match listener.accept().await {
            Ok(stream) => {
                next_conn += 1;
                spawn_connection(next_conn, stream, events.clone());
            }
            Err(e) => {
                tracing::warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

fn spawn_connection(
    conn: ConnectionId,
    stream: Stream,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let (recv, send) = stream.split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let (close, close_rx) = oneshot::channel();

    tokio::spawn(write_loop(conn, send, outbound_rx));
    tokio::spawn(read_loop(conn, recv, events, outbound, close, close_rx));
}

async fn read_loop(
    conn: ConnectionId,
    recv: RecvHalf,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    outbound: mpsc::UnboundedSender<Envelope>,
    close: oneshot::Sender<()>,
    mut close_rx: oneshot::Receiver<()>,
) {
    // Opened goes through the same channel as the messages, so it is seen first
    if events
        .send(ConnectionEvent::Opened {
            conn,
            outbound,
            close,
        })
        .is_err()
    {
        return;
    }

    let limit = MAX_MESSAGE_BYTES as u64 + 1;
    let mut reader = BufReader::new(recv).take(limit);
    let mut line = String::new();

    loop {
        line.clear();
        reader.set_limit(limit);

        let read = tokio::select! {
            _ = &mut close_rx => break,
            read = reader.read_line(&mut line) => read,
        };

        let event = match read {
            Ok(0) => break,
            Ok(_) if line.trim().is_empty() => continue,
            Ok(_) => match Envelope::decode(&line) {
                Ok(envelope) => ConnectionEvent::Message { conn, envelope },
                Err(error) => ConnectionEvent::Malformed { conn, error },
            },
            Err(e) => ConnectionEvent::Malformed {
                conn,
                error: e.into(),
            },
        };

        let fatal = matches!(event, ConnectionEvent::Malformed { .. });
        if events.send(event).is_err() || fatal {
            break;
        }
    }

    let _ = events.send(ConnectionEvent::Closed { conn });
}

async fn write_loop(
    conn: ConnectionId,
    mut send: SendHalf,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = outbound.recv().await {
        let line = match envelope.encode() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(conn, "Failed to encode message: {}", e);
                continue;
            }
        };

        if let Err(e) = send.write_all(line.as_bytes()).await {
            tracing::debug!(conn, "Write failed: {}", e);
            break;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::{CorrelationId, Query};
    use crate::ipc::client::ExtensionClient;
    use crate::ipc::HostMessage;

    struct Harness {
        server: IpcServer,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        endpoint: IpcEndpoint,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        async fn start() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = IpcConfig {
                socket_path: Some(dir.path().join("orbit.sock").to_string_lossy().into_owned()),
                ..IpcConfig::default()
            };
            let (tx, events) = mpsc::unbounded_channel();
            let (server, ready) = IpcServer::start(&config, tx);
            let endpoint = ready.wait().await.unwrap();
            Self {
                server,
                events,
                endpoint,
                _dir: dir,
            }
        }

        /// Feed events to the server until it produces a notice.
        async fn notice(&mut self) -> ServerNotice {
            loop {
                let event = self.events.recv().await.unwrap();
                if let Some(notice) = self.server.handle(event) {
                    return notice;
                }
            }
        }

        /// Feed events until some connection closes.
        async fn pump_until_closed(&mut self) {
            loop {
                let event = self.events.recv().await.unwrap();
                let closed = matches!(event, ConnectionEvent::Closed { .. });
                self.server.handle(event);
                if closed {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_and_query_roundtrip() {
        let mut harness = Harness::start().await;
        let token = harness.server.issue_token("weather");
        let address = harness.endpoint.address().to_string();

        let client = tokio::spawn(async move {
            let mut client = ExtensionClient::connect(&address, "weather", &token)
                .await
                .unwrap();
            let message = client.recv().await.unwrap();
            let Some(HostMessage::Query { correlation_id, .. }) = message else {
                panic!("expected query, got {:?}", message);
            };
            client
                .respond(
                    &correlation_id,
                    &[crate::ipc::ExtensionResultItem::new("Oslo: 14°C")],
                )
                .await
                .unwrap();
        });

        assert!(matches!(
            harness.notice().await,
            ServerNotice::Connected(id) if id == "weather"
        ));
        assert!(harness.server.is_connected("weather"));

        let cid = CorrelationId::from("C1");
        harness
            .server
            .send("weather", Envelope::query("weather", &cid, &Query::new("wttr oslo")))
            .unwrap();

        match harness.notice().await {
            ServerNotice::Message(id, Inbound::QueryResult { correlation_id, items }) => {
                assert_eq!(id, "weather");
                assert_eq!(correlation_id, cid);
                assert_eq!(items[0].title, "Oslo: 14°C");
            }
            other => panic!("unexpected notice {:?}", other),
        }

        client.await.unwrap();
        assert!(matches!(
            harness.notice().await,
            ServerNotice::Disconnected(id) if id == "weather"
        ));
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let mut harness = Harness::start().await;
        harness.server.issue_token("weather");
        let address = harness.endpoint.address().to_string();

        let client =
            tokio::spawn(async move { ExtensionClient::connect(&address, "weather", "forged").await });

        harness.pump_until_closed().await;
        assert!(client.await.unwrap().is_err());
        assert!(!harness.server.is_connected("weather"));
    }

    #[tokio::test]
    async fn test_second_connection_for_same_id_rejected() {
        let mut harness = Harness::start().await;
        let token = harness.server.issue_token("weather");
        let address = harness.endpoint.address().to_string();

        let first = ExtensionClient::connect(&address, "weather", &token);
        let (first, notice) = tokio::join!(first, harness.notice());
        let _first = first.unwrap();
        assert!(matches!(notice, ServerNotice::Connected(_)));

        // Even with a freshly issued token, a live connection blocks a second one
        let token = harness.server.issue_token("weather");
        let second = tokio::spawn(async move {
            ExtensionClient::connect(&address, "weather", &token).await
        });
        harness.pump_until_closed().await;
        assert!(second.await.unwrap().is_err());
        assert!(harness.server.is_connected("weather"));
    }

    #[tokio::test]
    async fn test_send_to_unknown_extension_fails() {
        let mut harness = Harness::start().await;
        let err = harness
            .server
            .send("ghost", Envelope::shutdown("ghost"))
            .unwrap_err();
        assert!(matches!(err, OrbitError::SendFailed { .. }));
    }

    #[tokio::test]
    async fn test_result_without_extension_id_is_attributed_to_connection() {
        let mut harness = Harness::start().await;
        let token = harness.server.issue_token("weather");
        let address = harness.endpoint.address().to_string();

        let client = tokio::spawn(async move {
            let mut client = ExtensionClient::connect(&address, "weather", &token)
                .await
                .unwrap();
            client
                .send_raw(
                    "{\"type\":\"QueryResult\",\"correlationId\":\"C1\",\"payload\":[{\"title\":\"Oslo: 14°C\"}]}\n",
                )
                .await
                .unwrap();
            client
        });

        assert!(matches!(harness.notice().await, ServerNotice::Connected(_)));
        match harness.notice().await {
            ServerNotice::Message(id, Inbound::QueryResult { correlation_id, items }) => {
                assert_eq!(id, "weather");
                assert_eq!(correlation_id.as_str(), "C1");
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].title, "Oslo: 14°C");
                assert_eq!(items[0].source, crate::core::ProviderId::Extension("weather".into()));
            }
            other => panic!("unexpected notice {:?}", other),
        }
        assert!(harness.server.is_connected("weather"));
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_spoofed_extension_id_is_protocol_violation() {
        let mut harness = Harness::start().await;
        let token = harness.server.issue_token("weather");
        let address = harness.endpoint.address().to_string();

        let client = tokio::spawn(async move {
            let mut client = ExtensionClient::connect(&address, "weather", &token)
                .await
                .unwrap();
            client
                .send_raw(
                    "{\"type\":\"Log\",\"extensionId\":\"other\",\"payload\":{\"level\":\"info\",\"message\":\"hi\"}}\n",
                )
                .await
                .unwrap();
            client.recv().await
        });

        assert!(matches!(harness.notice().await, ServerNotice::Connected(_)));
        assert!(matches!(
            harness.notice().await,
            ServerNotice::ProtocolViolation(id, _) if id == "weather"
        ));
        assert!(matches!(client.await.unwrap(), Ok(None)));
    }

    #[tokio::test]
    async fn test_garbage_is_protocol_violation() {
        let mut harness = Harness::start().await;
        let token = harness.server.issue_token("weather");
        let address = harness.endpoint.address().to_string();

        let client = tokio::spawn(async move {
            let mut client = ExtensionClient::connect(&address, "weather", &token)
                .await
                .unwrap();
            client.send_raw("{not json\n").await.unwrap();
            // Server hangs up
            client.recv().await
        });

        assert!(matches!(harness.notice().await, ServerNotice::Connected(_)));
        assert!(matches!(
            harness.notice().await,
            ServerNotice::ProtocolViolation(id, OrbitError::Protocol { .. }) if id == "weather"
        ));
        assert!(!harness.server.is_connected("weather"));
        assert!(matches!(client.await.unwrap(), Ok(None)));
    }
}
